//! Upload route: multipart file intake.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::response::Json;
use tracing::{info, warn};

use crate::services::upload::{self, UploadError};
use crate::state::AppState;
use crate::store::Attachment;

const FILE_FIELD: &str = "file";

fn upload_error_to_status(err: &UploadError) -> StatusCode {
    match err {
        UploadError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::FileType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        UploadError::InvalidFile | UploadError::InvalidRoom => StatusCode::BAD_REQUEST,
        UploadError::Io(_) | UploadError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `POST /api/uploads`: store the multipart field `file` and describe it.
pub async fn upload(State(state): State<AppState>, mut multipart: Multipart) -> Result<Json<Attachment>, StatusCode> {
    while let Some(field) = multipart.next_field().await.map_err(|e| {
        warn!(error = %e, "multipart read failed");
        e.status()
    })? {
        if field.name() != Some(FILE_FIELD) {
            continue;
        }

        let file_name = field.file_name().unwrap_or_default().to_owned();
        let file_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_owned();
        if !upload::is_allowed_type(&file_type) {
            return Err(StatusCode::UNSUPPORTED_MEDIA_TYPE);
        }

        let bytes = field.bytes().await.map_err(|e| {
            warn!(error = %e, "multipart body read failed");
            e.status()
        })?;

        let attachment = upload::store_file(&state.config, &file_name, &file_type, &bytes)
            .await
            .map_err(|e| {
                warn!(error = %e, "upload rejected");
                upload_error_to_status(&e)
            })?;
        info!(file_url = %attachment.file_url, "upload accepted");
        return Ok(Json(attachment));
    }

    Err(StatusCode::BAD_REQUEST)
}

#[cfg(test)]
#[path = "uploads_test.rs"]
mod tests;

//! Upload service: file storage for attachments.
//!
//! DESIGN
//! ======
//! Files arrive either as HTTP multipart or inline as base64 over the
//! socket. Both paths validate type and size before anything touches disk.
//! Stored names are `<unix-ms>-<sanitized original>`; the user-supplied
//! name is kept only as the display name on the attachment. Files are
//! served back from `/uploads/`.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::{error, info};

use crate::config::ChatConfig;
use crate::frame::now_ms;
use crate::services::message::{self, MessageError};
use crate::services::room::validate_room_id;
use crate::state::AppState;
use crate::store::{Attachment, ChatMessage, Identity};

/// URL prefix stored files are served under.
pub const UPLOADS_URL_PREFIX: &str = "/uploads";

const MAX_STORED_NAME_LEN: usize = 100;

const ALLOWED_TYPE_PREFIXES: &[&str] = &["image/", "video/", "audio/", "text/"];
const ALLOWED_TYPES: &[&str] = &["application/pdf", "application/zip", "application/json"];

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("file exceeds the {max} byte limit")]
    TooLarge { max: usize },
    #[error("file type not allowed: {0}")]
    FileType(String),
    #[error("file payload is missing or malformed")]
    InvalidFile,
    #[error("invalid room id")]
    InvalidRoom,
    #[error("file storage unavailable")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl crate::frame::ErrorCode for UploadError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::TooLarge { .. } => "E_FILE_TOO_LARGE",
            Self::FileType(_) => "E_FILE_TYPE",
            Self::InvalidFile => "E_INVALID_FILE",
            Self::InvalidRoom => "E_INVALID_ROOM",
            Self::Io(_) => "E_STORAGE",
            Self::Message(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Io(_) => true,
            Self::Message(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Whether a mime type may be stored.
#[must_use]
pub fn is_allowed_type(file_type: &str) -> bool {
    let file_type = file_type.trim().to_ascii_lowercase();
    let essence = file_type.split(';').next().unwrap_or_default().trim();
    ALLOWED_TYPE_PREFIXES
        .iter()
        .any(|prefix| essence.len() > prefix.len() && essence.starts_with(prefix))
        || ALLOWED_TYPES.contains(&essence)
}

/// Reduce a user-supplied name to ASCII alphanumerics, `.`, `-`, and `_`.
#[must_use]
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        return "file".to_owned();
    }
    cleaned.chars().take(MAX_STORED_NAME_LEN).collect()
}

/// On-disk name for an upload received at `received_ms`.
#[must_use]
pub fn stored_file_name(original: &str, received_ms: i64) -> String {
    format!("{received_ms}-{}", sanitize_file_name(original))
}

fn check_metadata<'a>(file_name: &'a str, file_type: &'a str) -> Result<(&'a str, &'a str), UploadError> {
    let file_name = file_name.trim();
    let file_type = file_type.trim();
    if file_name.is_empty() {
        return Err(UploadError::InvalidFile);
    }
    if !is_allowed_type(file_type) {
        return Err(UploadError::FileType(file_type.to_owned()));
    }
    Ok((file_name, file_type))
}

/// Decode an inline base64 payload, enforcing `max_bytes` before and after
/// decoding. Accepts an optional `data:<type>;base64,` prefix.
///
/// # Errors
///
/// `TooLarge` or `InvalidFile`.
pub fn decode_inline(encoded: &str, max_bytes: usize) -> Result<Vec<u8>, UploadError> {
    let encoded = encoded.trim();
    let encoded = match encoded.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(";base64,")
            .map(|(_, payload)| payload)
            .ok_or(UploadError::InvalidFile)?,
        None => encoded,
    };
    if encoded.is_empty() {
        return Err(UploadError::InvalidFile);
    }

    let estimated = encoded.len() / 4 * 3;
    if estimated > max_bytes.saturating_add(3) {
        return Err(UploadError::TooLarge { max: max_bytes });
    }

    let bytes = STANDARD
        .decode(encoded)
        .map_err(|_| UploadError::InvalidFile)?;
    if bytes.len() > max_bytes {
        return Err(UploadError::TooLarge { max: max_bytes });
    }
    Ok(bytes)
}

// =============================================================================
// STORAGE
// =============================================================================

/// Validate and write one file into the upload directory.
///
/// # Errors
///
/// `InvalidFile`, `FileType`, `TooLarge`, or `Io`. Validation failures never
/// touch the filesystem.
pub async fn store_file(
    config: &ChatConfig,
    file_name: &str,
    file_type: &str,
    bytes: &[u8],
) -> Result<Attachment, UploadError> {
    let (file_name, file_type) = check_metadata(file_name, file_type)?;
    if bytes.is_empty() {
        return Err(UploadError::InvalidFile);
    }
    if bytes.len() > config.max_upload_bytes {
        return Err(UploadError::TooLarge { max: config.max_upload_bytes });
    }

    let stored = stored_file_name(file_name, now_ms());
    write_file(&config.upload_dir, &stored, bytes).await?;
    info!(stored = %stored, size = bytes.len(), file_type, "file stored");

    Ok(Attachment {
        file_url: format!("{UPLOADS_URL_PREFIX}/{stored}"),
        file_name: file_name.to_owned(),
        file_type: file_type.to_owned(),
    })
}

async fn write_file(dir: &Path, stored: &str, bytes: &[u8]) -> Result<(), UploadError> {
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(dir.join(stored), bytes).await
    }
    .await;
    result.map_err(|e| {
        error!(error = %e, dir = %dir.display(), stored, "file write failed");
        UploadError::Io(e)
    })
}

/// Content of the message announcing a shared file.
#[must_use]
pub fn share_content(username: &str, file_name: &str) -> String {
    format!("{username} shared a file: {file_name}")
}

/// Store an inline upload and post it to `room_id` as a message.
///
/// # Errors
///
/// Any validation error aborts before the write; `Message` errors surface
/// after the file is stored.
pub async fn share_file(
    state: &AppState,
    identity: &Identity,
    room_id: &str,
    encoded: &str,
    file_name: &str,
    file_type: &str,
) -> Result<ChatMessage, UploadError> {
    let room_id = validate_room_id(room_id).map_err(|_| UploadError::InvalidRoom)?;
    check_metadata(file_name, file_type)?;
    let bytes = decode_inline(encoded, state.config.max_upload_bytes)?;

    let attachment = store_file(&state.config, file_name, file_type, &bytes).await?;
    let content = share_content(&identity.username, &attachment.file_name);
    let message = message::send_message(state, identity, room_id, &content, None, Some(attachment)).await?;
    Ok(message)
}

#[cfg(test)]
#[path = "upload_test.rs"]
mod tests;

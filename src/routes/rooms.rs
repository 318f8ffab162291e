//! Room routes: listing, history, and search over HTTP.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use serde::Deserialize;
use tracing::error;

use crate::services::message::{self, MessageError};
use crate::state::AppState;
use crate::store::Room;

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

fn message_error_to_status(err: MessageError) -> StatusCode {
    match err {
        MessageError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    }
}

/// `GET /api/rooms`: all provisioned rooms.
pub async fn list_rooms(State(state): State<AppState>) -> Result<Json<Vec<Room>>, StatusCode> {
    let rooms = state.store.list_rooms().await.map_err(|e| {
        error!(error = %e, "room listing failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(rooms))
}

/// `GET /api/rooms/:id/messages?limit=`: most recent messages, oldest first.
pub async fn room_history(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let messages = message::get_history(&state, &room_id, query.limit)
        .await
        .map_err(message_error_to_status)?;
    Ok(Json(serde_json::json!({ "messages": messages })))
}

/// `GET /api/rooms/:id/search?q=`: case-insensitive search, newest first.
pub async fn room_search(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let results = message::search_messages(&state, &room_id, &query.q)
        .await
        .map_err(message_error_to_status)?;
    Ok(Json(serde_json::json!({ "results": results })))
}

#[cfg(test)]
#[path = "rooms_test.rs"]
mod tests;

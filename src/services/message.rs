//! Message service: send, history, and search.
//!
//! DESIGN
//! ======
//! All writes that fan out to a room go through [`persist_and_deliver`]. It
//! holds the room's sequencer across the insert and the fan-out, so every
//! occupant observes a room's messages in persistence order and never sees
//! a message before its row exists.
//!
//! Ids are time-ordered (`Uuid::now_v7`) and timestamps are assigned here,
//! never taken from client payloads.

use tracing::{error, info};
use uuid::Uuid;

use crate::frame::{Data, Frame, now_ms};
use crate::services::room::{self, validate_room_id};
use crate::state::AppState;
use crate::store::{Attachment, ChatMessage, Identity, NewMessage, StoreError};

/// Hard cap on search results.
pub const SEARCH_LIMIT: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("search query must not be empty")]
    EmptyQuery,
    #[error("invalid room id")]
    InvalidRoom,
    #[error("attachment requires fileUrl, fileName, and fileType together")]
    InvalidAttachment,
    #[error("reply target is not a message in this room")]
    InvalidReply,
    #[error("storage unavailable")]
    Storage(#[from] StoreError),
}

impl crate::frame::ErrorCode for MessageError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyContent => "E_EMPTY_CONTENT",
            Self::EmptyQuery => "E_EMPTY_QUERY",
            Self::InvalidRoom => "E_INVALID_ROOM",
            Self::InvalidAttachment => "E_INVALID_ATTACHMENT",
            Self::InvalidReply => "E_INVALID_REPLY",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

fn storage(err: StoreError) -> MessageError {
    error!(error = %err, "message storage failed");
    MessageError::Storage(err)
}

/// Where a persisted message is delivered.
#[derive(Debug, Clone, Copy)]
pub enum Delivery<'a> {
    /// Every occupant of the message's room, sender included.
    Room,
    /// Exactly these connections, through their private channels.
    Clients(&'a [Uuid]),
}

// =============================================================================
// PAYLOAD HELPERS
// =============================================================================

/// Flatten a message into frame data (camelCase message JSON).
#[must_use]
pub fn message_data(message: &ChatMessage) -> Data {
    match serde_json::to_value(message) {
        Ok(serde_json::Value::Object(map)) => map.into_iter().collect(),
        _ => Data::new(),
    }
}

/// Build an attachment from optional parts. All three or none.
///
/// # Errors
///
/// Returns `InvalidAttachment` when only some parts are present or a present
/// part is blank.
pub fn parse_attachment(
    file_url: Option<&str>,
    file_name: Option<&str>,
    file_type: Option<&str>,
) -> Result<Option<Attachment>, MessageError> {
    match (file_url, file_name, file_type) {
        (None, None, None) => Ok(None),
        (Some(url), Some(name), Some(kind)) if ![url, name, kind].iter().any(|s| s.trim().is_empty()) => {
            Ok(Some(Attachment { file_url: url.to_owned(), file_name: name.to_owned(), file_type: kind.to_owned() }))
        }
        _ => Err(MessageError::InvalidAttachment),
    }
}

// =============================================================================
// SEND
// =============================================================================

/// Persist a message under the room's sequencer, then deliver it.
///
/// # Errors
///
/// Returns `Storage` if the insert fails. Nothing is delivered then.
pub async fn persist_and_deliver(
    state: &AppState,
    message: NewMessage,
    syscall: &str,
    extra: Data,
    delivery: Delivery<'_>,
) -> Result<ChatMessage, MessageError> {
    let sequencer = state.room_sequencer(&message.room_id);
    let _turn = sequencer.lock().await;

    let stored = state.store.insert_message(message).await.map_err(storage)?;

    let mut data = message_data(&stored);
    data.extend(extra);
    let frame = Frame::request(syscall, data)
        .with_room_id(stored.room_id.clone())
        .with_from(stored.username.clone());
    match delivery {
        Delivery::Room => room::broadcast(state, &stored.room_id, &frame, None).await,
        Delivery::Clients(ids) => room::send_to(state, ids, &frame).await,
    }

    info!(id = %stored.id, room_id = %stored.room_id, author = %stored.username, "message persisted");
    Ok(stored)
}

/// Validate and send a room message on behalf of `identity`.
///
/// The sender does not need to occupy the room. Every occupant, including
/// the sender when present, receives `receive_message`.
///
/// # Errors
///
/// Validation errors leave storage and occupants untouched.
pub async fn send_message(
    state: &AppState,
    identity: &Identity,
    room_id: &str,
    content: &str,
    reply_to_id: Option<Uuid>,
    attachment: Option<Attachment>,
) -> Result<ChatMessage, MessageError> {
    if content.trim().is_empty() {
        return Err(MessageError::EmptyContent);
    }
    let room_id = validate_room_id(room_id).map_err(|_| MessageError::InvalidRoom)?;

    if let Some(parent_id) = reply_to_id {
        let parent = state
            .store
            .message_origin(parent_id)
            .await
            .map_err(storage)?;
        if parent.as_ref().map(|p| p.room_id.as_str()) != Some(room_id) {
            return Err(MessageError::InvalidReply);
        }
    }

    let message = NewMessage {
        id: Uuid::now_v7(),
        room_id: room_id.to_owned(),
        author_id: identity.user_id,
        content: content.to_owned(),
        parent_id: reply_to_id,
        attachment,
        created_at: now_ms(),
    };
    persist_and_deliver(state, message, "receive_message", Data::new(), Delivery::Room).await
}

// =============================================================================
// READ
// =============================================================================

/// Most recent messages of a room, oldest first.
///
/// # Errors
///
/// Returns `InvalidRoom` or `Storage`.
pub async fn get_history(state: &AppState, room_id: &str, limit: Option<usize>) -> Result<Vec<ChatMessage>, MessageError> {
    let room_id = validate_room_id(room_id).map_err(|_| MessageError::InvalidRoom)?;
    let limit = state.config.history_limit(limit);
    state
        .store
        .recent_messages(room_id, limit)
        .await
        .map_err(storage)
}

/// Case-insensitive substring search in one room, newest first, at most
/// [`SEARCH_LIMIT`] results.
///
/// # Errors
///
/// Returns `EmptyQuery` for a blank query, `InvalidRoom`, or `Storage`.
pub async fn search_messages(state: &AppState, room_id: &str, query: &str) -> Result<Vec<ChatMessage>, MessageError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(MessageError::EmptyQuery);
    }
    let room_id = validate_room_id(room_id).map_err(|_| MessageError::InvalidRoom)?;
    state
        .store
        .search_messages(room_id, query, SEARCH_LIMIT)
        .await
        .map_err(storage)
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;

//! Reaction service: add and remove emoji reactions.
//!
//! Uniqueness over (message, emoji, author) is enforced by the store, so two
//! racing adds of the same triple produce one row and one `Duplicate`. The
//! server never toggles: clients decide whether to add or remove.
//!
//! Deltas go to the message's room only, not the caller's current room.
//! Private messages are visible to their two parties only: anyone else gets
//! `E_MESSAGE_NOT_FOUND`, and deltas go to the parties' connections.

use tracing::{error, info};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::private;
use crate::services::room::{self, PRIVATE_ROOM_PREFIX};
use crate::state::AppState;
use crate::store::{Identity, Reaction, StoreError};

const MAX_EMOJI_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum ReactionError {
    #[error("emoji must be a non-empty string of at most 32 characters")]
    InvalidEmoji,
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),
    #[error("reaction not found")]
    NotFound,
    #[error("reaction already exists")]
    Duplicate,
    #[error("storage unavailable")]
    Storage(StoreError),
}

impl crate::frame::ErrorCode for ReactionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidEmoji => "E_INVALID_EMOJI",
            Self::MessageNotFound(_) => "E_MESSAGE_NOT_FOUND",
            Self::NotFound => "E_REACTION_NOT_FOUND",
            Self::Duplicate => "E_DUPLICATE_REACTION",
            Self::Storage(_) => "E_STORAGE",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Storage(_))
    }
}

impl From<StoreError> for ReactionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => Self::Duplicate,
            StoreError::Database(_) => {
                error!(error = %err, "reaction storage failed");
                Self::Storage(err)
            }
        }
    }
}

fn validate_emoji(emoji: &str) -> Result<&str, ReactionError> {
    let emoji = emoji.trim();
    if emoji.is_empty() || emoji.chars().count() > MAX_EMOJI_LEN {
        return Err(ReactionError::InvalidEmoji);
    }
    Ok(emoji)
}

/// Frame data for a reaction delta.
#[must_use]
pub fn reaction_data(reaction: &Reaction) -> Data {
    let mut data = Data::new();
    data.insert("messageId".into(), serde_json::json!(reaction.message_id));
    data.insert("reaction".into(), serde_json::to_value(reaction).unwrap_or_default());
    data
}

/// Where a reaction delta for one message is delivered.
enum Audience {
    Room(String),
    /// A private conversation, identified by one of its parties.
    Conversation { room_id: String, author_id: Uuid },
}

impl Audience {
    fn room_id(&self) -> &str {
        match self {
            Self::Room(room_id) | Self::Conversation { room_id, .. } => room_id,
        }
    }

    async fn deliver(&self, state: &AppState, frame: &Frame) {
        match self {
            Self::Room(room_id) => room::broadcast(state, room_id, frame, None).await,
            Self::Conversation { room_id, author_id } => {
                let parties = private::party_clients(state, room_id, *author_id).await;
                room::send_to(state, &parties, frame).await;
            }
        }
    }
}

/// Resolve the message and check that `identity` may see it.
async fn resolve_audience(state: &AppState, identity: &Identity, message_id: Uuid) -> Result<Audience, ReactionError> {
    let origin = state
        .store
        .message_origin(message_id)
        .await?
        .ok_or(ReactionError::MessageNotFound(message_id))?;

    if !origin.room_id.starts_with(PRIVATE_ROOM_PREFIX) {
        return Ok(Audience::Room(origin.room_id));
    }
    match (origin.author_id, identity.user_id) {
        (Some(author_id), Some(user_id)) if private::is_party(&origin.room_id, author_id, user_id) => {
            Ok(Audience::Conversation { room_id: origin.room_id, author_id })
        }
        _ => Err(ReactionError::MessageNotFound(message_id)),
    }
}

/// Add `identity`'s reaction and send `reaction_added` to the message's audience.
///
/// # Errors
///
/// `InvalidEmoji`, `MessageNotFound` (also for private messages the caller is
/// not a party to), `Duplicate` when the triple exists, or `Storage`. Nothing
/// is delivered on error.
pub async fn add_reaction(
    state: &AppState,
    identity: &Identity,
    message_id: Uuid,
    emoji: &str,
) -> Result<Reaction, ReactionError> {
    let emoji = validate_emoji(emoji)?;
    let audience = resolve_audience(state, identity, message_id).await?;

    let reaction = state
        .store
        .insert_reaction(message_id, emoji, identity.user_id)
        .await?;

    let frame = Frame::request("reaction_added", reaction_data(&reaction)).with_room_id(audience.room_id());
    audience.deliver(state, &frame).await;
    info!(%message_id, emoji, user = %identity.username, "reaction added");
    Ok(reaction)
}

/// Remove `identity`'s reaction and send `reaction_removed`.
///
/// # Errors
///
/// `InvalidEmoji`, `MessageNotFound`, `NotFound` when the caller has no such
/// reaction, or `Storage`.
pub async fn remove_reaction(
    state: &AppState,
    identity: &Identity,
    message_id: Uuid,
    emoji: &str,
) -> Result<Reaction, ReactionError> {
    let emoji = validate_emoji(emoji)?;
    let audience = resolve_audience(state, identity, message_id).await?;

    let reaction = state
        .store
        .delete_reaction(message_id, emoji, identity.user_id)
        .await?
        .ok_or(ReactionError::NotFound)?;

    let frame = Frame::request("reaction_removed", reaction_data(&reaction)).with_room_id(audience.room_id());
    audience.deliver(state, &frame).await;
    info!(%message_id, emoji, user = %identity.username, "reaction removed");
    Ok(reaction)
}

#[cfg(test)]
#[path = "reaction_test.rs"]
mod tests;

//! Private messaging: one-to-one relay between online users.
//!
//! A conversation between two users lives in a derived room id,
//! `dm:<sha256 of the sorted user ids>`, so it is stable across reconnects
//! and independent of usernames. Private messages are delivered only to the
//! sender's connection and the recipient's connection; the derived room id
//! cannot be joined like a public room.

use sha2::{Digest, Sha256};
use tracing::{error, info};
use uuid::Uuid;

use crate::frame::{Data, now_ms};
use crate::services::message::{self, Delivery, MessageError};
use crate::services::room::{self, PRIVATE_ROOM_PREFIX};
use crate::services::session::bytes_to_hex;
use crate::state::AppState;
use crate::store::{ChatMessage, Identity, NewMessage, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PrivateError {
    #[error("private messages require a signed-in user")]
    AuthRequired,
    #[error("message content must not be empty")]
    EmptyContent,
    #[error("cannot send a private message to yourself")]
    SelfMessage,
    #[error("recipient not found or offline")]
    RecipientOffline,
    #[error("user not found: {0}")]
    UserNotFound(String),
    #[error("storage unavailable")]
    Storage(#[from] StoreError),
    #[error(transparent)]
    Message(#[from] MessageError),
}

impl crate::frame::ErrorCode for PrivateError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::AuthRequired => "E_AUTH_REQUIRED",
            Self::EmptyContent => "E_EMPTY_CONTENT",
            Self::SelfMessage => "E_SELF_MESSAGE",
            Self::RecipientOffline => "E_RECIPIENT_OFFLINE",
            Self::UserNotFound(_) => "E_USER_NOT_FOUND",
            Self::Storage(_) => "E_STORAGE",
            Self::Message(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Storage(_) => true,
            Self::Message(e) => e.retryable(),
            _ => false,
        }
    }
}

/// Stable conversation id for two users, independent of argument order.
#[must_use]
pub fn conversation_id(a: Uuid, b: Uuid) -> String {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut hasher = Sha256::new();
    hasher.update(low.as_bytes());
    hasher.update(high.as_bytes());
    format!("{PRIVATE_ROOM_PREFIX}{}", bytes_to_hex(&hasher.finalize()))
}

/// Whether `user_id` is one of the two parties of the conversation `room_id`,
/// given one known party `author_id`.
#[must_use]
pub fn is_party(room_id: &str, author_id: Uuid, user_id: Uuid) -> bool {
    user_id == author_id || conversation_id(author_id, user_id) == room_id
}

/// Online connections of both parties of a conversation.
pub async fn party_clients(state: &AppState, room_id: &str, author_id: Uuid) -> Vec<Uuid> {
    let hub = state.hub.read().await;
    hub.clients
        .iter()
        .filter(|(_, c)| c.identity.user_id.is_some_and(|user_id| is_party(room_id, author_id, user_id)))
        .map(|(id, _)| *id)
        .collect()
}

fn signed_in(identity: &Identity) -> Result<Uuid, PrivateError> {
    identity.user_id.ok_or(PrivateError::AuthRequired)
}

/// Relay a private message from the connection `sender_client` to the most
/// recently connected socket of `recipient_username`.
///
/// # Errors
///
/// Nothing is persisted unless the recipient is online and every check passes.
pub async fn send_private_message(
    state: &AppState,
    sender_client: Uuid,
    sender: &Identity,
    recipient_username: &str,
    content: &str,
) -> Result<ChatMessage, PrivateError> {
    let sender_id = signed_in(sender)?;
    if content.trim().is_empty() {
        return Err(PrivateError::EmptyContent);
    }
    let recipient_username = recipient_username.trim();
    if recipient_username == sender.username {
        return Err(PrivateError::SelfMessage);
    }

    let (recipient_client, recipient) = room::find_online_user(state, recipient_username)
        .await
        .ok_or(PrivateError::RecipientOffline)?;
    let recipient_id = signed_in(&recipient).map_err(|_| PrivateError::RecipientOffline)?;
    if recipient_id == sender_id {
        return Err(PrivateError::SelfMessage);
    }

    let message = NewMessage {
        id: Uuid::now_v7(),
        room_id: conversation_id(sender_id, recipient_id),
        author_id: Some(sender_id),
        content: content.to_owned(),
        parent_id: None,
        attachment: None,
        created_at: now_ms(),
    };

    let mut extra = Data::new();
    extra.insert("isPrivate".into(), serde_json::Value::Bool(true));
    extra.insert("recipientUsername".into(), serde_json::json!(recipient.username));

    let targets = [sender_client, recipient_client];
    let stored = message::persist_and_deliver(
        state,
        message,
        "receive_private_message",
        extra,
        Delivery::Clients(&targets),
    )
    .await?;

    info!(id = %stored.id, from = %sender.username, to = %recipient.username, "private message relayed");
    Ok(stored)
}

/// History of the conversation between `identity` and `username`, oldest first.
///
/// # Errors
///
/// `AuthRequired`, `UserNotFound`, or `Storage`.
pub async fn private_history(
    state: &AppState,
    identity: &Identity,
    username: &str,
    limit: Option<usize>,
) -> Result<Vec<ChatMessage>, PrivateError> {
    let own_id = signed_in(identity)?;
    let username = username.trim();
    let peer = state
        .store
        .find_user(username)
        .await
        .inspect_err(|e| error!(error = %e, "private history lookup failed"))?
        .ok_or_else(|| PrivateError::UserNotFound(username.to_owned()))?;
    let peer_id = signed_in(&peer).map_err(|_| PrivateError::UserNotFound(username.to_owned()))?;

    let limit = state.config.history_limit(limit);
    let messages = state
        .store
        .recent_messages(&conversation_id(own_id, peer_id), limit)
        .await
        .inspect_err(|e| error!(error = %e, "private history read failed"))?;
    Ok(messages)
}

#[cfg(test)]
#[path = "private_test.rs"]
mod tests;

//! Session and WS-ticket handling.
//!
//! ARCHITECTURE
//! ============
//! The surrounding application owns login and session tokens. The chat core
//! only exchanges a live session for a one-time, short-lived ticket, and the
//! websocket upgrade consumes that ticket to learn who is connecting. Identity
//! is therefore fixed at handshake time; event payloads never carry it.
//!
//! TRADE-OFFS
//! ==========
//! Ticket consumption is destructive, guaranteeing single use; this favors
//! replay safety over reconnect convenience.

use std::fmt::Write;

use rand::Rng;
use uuid::Uuid;

use crate::store::{ChatStore, Identity, StoreError};

pub(crate) fn bytes_to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(s, "{b:02x}");
    }
    s
}

/// Generate a short-lived 16-byte hex WS ticket.
#[must_use]
pub(crate) fn generate_ws_ticket() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes_to_hex(&bytes)
}

/// Issue a ticket for an authenticated user.
///
/// # Errors
///
/// Returns the store error if the ticket cannot be recorded.
pub async fn issue_ws_ticket(store: &dyn ChatStore, user_id: Uuid) -> Result<String, StoreError> {
    let ticket = generate_ws_ticket();
    store.insert_ws_ticket(&ticket, user_id).await?;
    Ok(ticket)
}

/// Consume a ticket, returning the identity it was issued for.
///
/// # Errors
///
/// Returns the store error if the lookup fails.
pub async fn consume_ws_ticket(store: &dyn ChatStore, ticket: &str) -> Result<Option<Identity>, StoreError> {
    if ticket.trim().is_empty() {
        return Ok(None);
    }
    store.take_ws_ticket(ticket).await
}

/// Resolve a session token issued by the surrounding application.
///
/// # Errors
///
/// Returns the store error if the lookup fails.
pub async fn session_identity(store: &dyn ChatStore, token: &str) -> Result<Option<Identity>, StoreError> {
    if token.trim().is_empty() {
        return Ok(None);
    }
    store.session_user(token).await
}

#[cfg(test)]
#[path = "session_test.rs"]
mod tests;

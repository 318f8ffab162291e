//! Room service: connection lifecycle, join/leave, and fan-out.
//!
//! DESIGN
//! ======
//! A connection holds exactly one chat room at a time plus its private
//! channel (its outbound queue). Joining a room detaches from the previous
//! one first, so rejoining the current room is a harmless leave-then-join.
//! Notices to other occupants are produced by the websocket dispatch layer
//! from the returned transitions; this module only mutates the registry and
//! delivers frames.

use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

use crate::frame::Frame;
use crate::services::typing;
use crate::state::AppState;
use crate::store::Identity;

/// Prefix reserved for derived private conversation ids.
pub const PRIVATE_ROOM_PREFIX: &str = "dm:";

const MAX_ROOM_ID_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("invalid room id")]
    InvalidRoom,
}

impl crate::frame::ErrorCode for RoomError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRoom => "E_INVALID_ROOM",
        }
    }
}

/// Membership change produced by a join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTransition {
    /// Room the connection was in before, if any.
    pub left: Option<String>,
    pub joined: String,
}

/// Validate a public room id: non-empty, bounded, not a private conversation.
///
/// # Errors
///
/// Returns `InvalidRoom` when the id is blank, too long, or reserved.
pub fn validate_room_id(room_id: &str) -> Result<&str, RoomError> {
    let room_id = room_id.trim();
    if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN || room_id.starts_with(PRIVATE_ROOM_PREFIX) {
        return Err(RoomError::InvalidRoom);
    }
    Ok(room_id)
}

// =============================================================================
// CONNECT / DISCONNECT
// =============================================================================

/// Register a new connection without room membership.
pub async fn connect(state: &AppState, client_id: Uuid, identity: Identity, tx: mpsc::Sender<Frame>) {
    let mut hub = state.hub.write().await;
    hub.insert_client(client_id, identity, tx);
    info!(%client_id, clients = hub.clients.len(), "client registered");
}

/// Drop a connection from the registry. Returns the room it was in.
/// Typing entries are cleared separately by the typing service.
pub async fn disconnect(state: &AppState, client_id: Uuid) -> Option<String> {
    let mut hub = state.hub.write().await;
    let left = hub.detach(client_id);
    hub.clients.remove(&client_id);
    info!(%client_id, clients = hub.clients.len(), "client unregistered");
    left
}

// =============================================================================
// JOIN / LEAVE
// =============================================================================

/// Move a connection into `room_id`, leaving whatever room it held. A typing
/// entry in the room left is cleared and announced as stopped.
///
/// # Errors
///
/// Returns `InvalidRoom` for an invalid id. Membership is untouched then.
pub async fn join_room(state: &AppState, client_id: Uuid, room_id: &str) -> Result<JoinTransition, RoomError> {
    let room_id = validate_room_id(room_id)?;

    let (left, stopped_typing) = {
        let mut hub = state.hub.write().await;
        let left = hub.detach(client_id);
        let stopped_typing = left.as_deref().and_then(|old| hub.clear_typing(client_id, old));
        hub.attach(client_id, room_id);
        info!(%client_id, room_id, left = ?left, occupants = hub.occupants(room_id).len(), "client joined room");
        (left, stopped_typing)
    };

    if let (Some(old), Some(username)) = (left.as_deref(), stopped_typing) {
        typing::announce_stop(state, old, client_id, &username).await;
    }
    Ok(JoinTransition { left, joined: room_id.to_owned() })
}

/// Leave `room_id` if the connection is in it, clearing its typing entry
/// there. Returns whether it was.
///
/// # Errors
///
/// Returns `InvalidRoom` for an invalid id.
pub async fn leave_room(state: &AppState, client_id: Uuid, room_id: &str) -> Result<bool, RoomError> {
    let room_id = validate_room_id(room_id)?;

    let stopped_typing = {
        let mut hub = state.hub.write().await;
        let in_room = hub
            .clients
            .get(&client_id)
            .is_some_and(|c| c.room.as_deref() == Some(room_id));
        if !in_room {
            return Ok(false);
        }
        hub.detach(client_id);
        info!(%client_id, room_id, "client left room");
        hub.clear_typing(client_id, room_id)
    };

    if let Some(username) = stopped_typing {
        typing::announce_stop(state, room_id, client_id, &username).await;
    }
    Ok(true)
}

/// The room a connection currently occupies.
#[cfg(test)]
pub async fn current_room(state: &AppState, client_id: Uuid) -> Option<String> {
    let hub = state.hub.read().await;
    hub.clients.get(&client_id).and_then(|c| c.room.clone())
}

// =============================================================================
// LOOKUP
// =============================================================================

/// Find the connection of an authenticated user by username. When the user
/// has several connections, the most recent one wins.
pub async fn find_online_user(state: &AppState, username: &str) -> Option<(Uuid, Identity)> {
    let hub = state.hub.read().await;
    hub.clients
        .iter()
        .filter(|(_, c)| !c.identity.is_anonymous() && c.identity.username == username)
        .max_by_key(|(_, c)| c.connected_seq)
        .map(|(id, c)| (*id, c.identity.clone()))
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Broadcast a frame to every occupant of a room, optionally excluding one.
pub async fn broadcast(state: &AppState, room_id: &str, frame: &Frame, exclude: Option<Uuid>) {
    let hub = state.hub.read().await;
    let Some(occupants) = hub.rooms.get(room_id) else {
        return;
    };

    for client_id in occupants {
        if exclude == Some(*client_id) {
            continue;
        }
        let Some(client) = hub.clients.get(client_id) else {
            continue;
        };
        // Best-effort: if a client's channel is full, skip it.
        let _ = client.tx.try_send(frame.clone());
    }
}

/// Deliver a frame to specific connections through their private channels.
pub async fn send_to(state: &AppState, client_ids: &[Uuid], frame: &Frame) {
    let hub = state.hub.read().await;
    for client_id in client_ids {
        if let Some(client) = hub.clients.get(client_id) {
            let _ = client.tx.try_send(frame.clone());
        }
    }
}

#[cfg(test)]
#[path = "room_test.rs"]
mod tests;

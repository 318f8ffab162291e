//! Typing service: ephemeral per-room typing indicators.
//!
//! DESIGN
//! ======
//! Entries live in the hub, keyed by room and connection. Starting twice
//! only refreshes the expiry. A background sweeper expires entries that were
//! not refreshed within the configured TTL and tells the room the user
//! stopped typing, so a client that vanishes mid-sentence does not leave a
//! stale indicator behind. Nothing here is persisted.
//!
//! Notices never go back to the typist. A connection may only type in the
//! room it occupies, and leaving that room clears its entry there.

use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};
use uuid::Uuid;

use crate::frame::{Data, Frame};
use crate::services::room::{self, validate_room_id};
use crate::state::{AppState, Hub, TypingEntry};

const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum TypingError {
    #[error("invalid room id")]
    InvalidRoom,
    #[error("not in room: {0}")]
    NotInRoom(String),
}

impl crate::frame::ErrorCode for TypingError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidRoom => "E_INVALID_ROOM",
            Self::NotInRoom(_) => "E_NOT_IN_ROOM",
        }
    }
}

/// A typing notice that has to be fanned out.
struct Notice {
    room_id: String,
    client_id: Uuid,
    username: String,
}

fn notice_frame(syscall: &str, room_id: &str, username: &str) -> Frame {
    let mut data = Data::new();
    data.insert("username".into(), serde_json::json!(username));
    data.insert("roomId".into(), serde_json::json!(room_id));
    Frame::request(syscall, data).with_room_id(room_id)
}

/// Tell the other occupants of `room_id` that a connection stopped typing.
pub async fn announce_stop(state: &AppState, room_id: &str, client_id: Uuid, username: &str) {
    let frame = notice_frame("user_stop_typing", room_id, username);
    room::broadcast(state, room_id, &frame, Some(client_id)).await;
}

async fn announce_stops(state: &AppState, notices: Vec<Notice>) {
    for notice in notices {
        announce_stop(state, &notice.room_id, notice.client_id, &notice.username).await;
    }
}

/// Username of a connection that occupies `room_id`. `Ok(None)` when the
/// connection is gone.
fn occupant_name(hub: &Hub, client_id: Uuid, room_id: &str) -> Result<Option<String>, TypingError> {
    let Some(client) = hub.clients.get(&client_id) else {
        return Ok(None);
    };
    if client.room.as_deref() != Some(room_id) {
        return Err(TypingError::NotInRoom(room_id.to_owned()));
    }
    Ok(Some(client.identity.username.clone()))
}

// =============================================================================
// START / STOP
// =============================================================================

/// Mark a connection as typing in `room_id` and notify the other occupants.
///
/// # Errors
///
/// Returns `InvalidRoom` for an invalid id, `NotInRoom` when the connection
/// occupies a different room.
pub async fn start_typing(state: &AppState, client_id: Uuid, room_id: &str) -> Result<(), TypingError> {
    let room_id = validate_room_id(room_id).map_err(|_| TypingError::InvalidRoom)?;
    let expires_at = Instant::now() + state.config.typing_ttl;

    let username = {
        let mut hub = state.hub.write().await;
        let Some(username) = occupant_name(&hub, client_id, room_id)? else {
            return Ok(());
        };
        hub.typing
            .entry(room_id.to_owned())
            .or_default()
            .insert(client_id, TypingEntry { username: username.clone(), expires_at });
        username
    };

    let frame = notice_frame("user_typing", room_id, &username);
    room::broadcast(state, room_id, &frame, Some(client_id)).await;
    Ok(())
}

/// Clear a connection's typing flag in `room_id` and notify the other occupants.
///
/// # Errors
///
/// Returns `InvalidRoom` for an invalid id, `NotInRoom` when the connection
/// occupies a different room.
pub async fn stop_typing(state: &AppState, client_id: Uuid, room_id: &str) -> Result<(), TypingError> {
    let room_id = validate_room_id(room_id).map_err(|_| TypingError::InvalidRoom)?;

    let username = {
        let mut hub = state.hub.write().await;
        let Some(username) = occupant_name(&hub, client_id, room_id)? else {
            return Ok(());
        };
        hub.clear_typing(client_id, room_id);
        username
    };

    announce_stop(state, room_id, client_id, &username).await;
    Ok(())
}

/// Drop every typing entry a connection holds, announcing each stop.
pub async fn clear_client(state: &AppState, client_id: Uuid) {
    let notices = {
        let mut hub = state.hub.write().await;
        let mut notices = Vec::new();
        hub.typing.retain(|room_id, entries| {
            if let Some(entry) = entries.remove(&client_id) {
                notices.push(Notice { room_id: room_id.clone(), client_id, username: entry.username });
            }
            !entries.is_empty()
        });
        notices
    };
    announce_stops(state, notices).await;
}

// =============================================================================
// EXPIRY
// =============================================================================

/// Remove entries whose expiry is at or before `now`. Returns how many expired.
pub async fn sweep_expired(state: &AppState, now: Instant) -> usize {
    let notices = {
        let mut hub = state.hub.write().await;
        let mut notices = Vec::new();
        hub.typing.retain(|room_id, entries| {
            entries.retain(|client_id, entry| {
                if entry.expires_at > now {
                    return true;
                }
                notices.push(Notice {
                    room_id: room_id.clone(),
                    client_id: *client_id,
                    username: entry.username.clone(),
                });
                false
            });
            !entries.is_empty()
        });
        notices
    };

    let expired = notices.len();
    if expired > 0 {
        debug!(expired, "typing entries expired");
    }
    announce_stops(state, notices).await;
    expired
}

/// Spawn the typing sweeper. Returns a handle for shutdown.
pub fn spawn_typing_sweeper(state: AppState) -> JoinHandle<()> {
    let interval = state.config.typing_sweep_interval.max(MIN_SWEEP_INTERVAL);
    info!(
        ttl_ms = u64::try_from(state.config.typing_ttl.as_millis()).unwrap_or(u64::MAX),
        sweep_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX),
        "typing sweeper configured"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            sweep_expired(&state, Instant::now()).await;
        }
    })
}

#[cfg(test)]
#[path = "typing_test.rs"]
mod tests;

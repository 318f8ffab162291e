//! Shared application state.
//!
//! DESIGN
//! ======
//! `AppState` is built once at startup and injected into Axum handlers via
//! the `State` extractor. It owns the storage backend, the configuration,
//! and the `Hub`: the live registry of connections, room memberships, and
//! typing entries. Nothing in the crate reaches for a global.
//!
//! Each connection writes only its own registry entry (join, leave,
//! disconnect); fan-out takes a read lock and uses `try_send`, so a slow
//! client never blocks a room.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::sync::{RwLock, mpsc};
use uuid::Uuid;

use crate::config::ChatConfig;
use crate::frame::Frame;
use crate::store::{ChatStore, Identity};

/// Room every connection lands in on connect.
pub const DEFAULT_ROOM: &str = "general";

// =============================================================================
// CONNECTIONS
// =============================================================================

/// A live websocket connection. The sender is the connection's private
/// channel: frames pushed here reach only this socket.
pub struct ConnectedClient {
    pub tx: mpsc::Sender<Frame>,
    pub identity: Identity,
    /// The single chat room this connection occupies, if any.
    pub room: Option<String>,
    /// Monotonic connect order. Higher is newer.
    pub connected_seq: u64,
}

/// One connection's typing flag in a room.
#[derive(Debug, Clone)]
pub struct TypingEntry {
    pub username: String,
    pub expires_at: Instant,
}

// =============================================================================
// HUB
// =============================================================================

/// Live registry. Kept in memory only; rebuilt by clients on reconnect.
#[derive(Default)]
pub struct Hub {
    pub clients: HashMap<Uuid, ConnectedClient>,
    /// `room_id` -> occupants.
    pub rooms: HashMap<String, HashSet<Uuid>>,
    /// `room_id` -> `client_id` -> typing entry.
    pub typing: HashMap<String, HashMap<Uuid, TypingEntry>>,
    next_seq: u64,
}

impl Hub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection with no room membership.
    pub fn insert_client(&mut self, client_id: Uuid, identity: Identity, tx: mpsc::Sender<Frame>) {
        self.next_seq += 1;
        self.clients
            .insert(client_id, ConnectedClient { tx, identity, room: None, connected_seq: self.next_seq });
    }

    /// Occupants of a room. Empty when the room has nobody in it.
    #[must_use]
    pub fn occupants(&self, room_id: &str) -> Vec<Uuid> {
        self.rooms
            .get(room_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Remove a connection from its current room. Returns the room it left.
    pub fn detach(&mut self, client_id: Uuid) -> Option<String> {
        let client = self.clients.get_mut(&client_id)?;
        let room_id = client.room.take()?;
        if let Some(set) = self.rooms.get_mut(&room_id) {
            set.remove(&client_id);
            if set.is_empty() {
                self.rooms.remove(&room_id);
            }
        }
        Some(room_id)
    }

    /// Drop a connection's typing entry in one room. Returns the typist's name.
    pub fn clear_typing(&mut self, client_id: Uuid, room_id: &str) -> Option<String> {
        let entries = self.typing.get_mut(room_id)?;
        let entry = entries.remove(&client_id);
        if entries.is_empty() {
            self.typing.remove(room_id);
        }
        entry.map(|e| e.username)
    }

    /// Put a connection into a room. The caller detaches it first.
    pub fn attach(&mut self, client_id: Uuid, room_id: &str) -> bool {
        let Some(client) = self.clients.get_mut(&client_id) else {
            return false;
        };
        client.room = Some(room_id.to_owned());
        self.rooms
            .entry(room_id.to_owned())
            .or_default()
            .insert(client_id);
        true
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Per-room write sequencers. A room's lock is held across persist and
/// broadcast so occupants see messages in persistence order. Entries exist
/// only while some handle for the room is alive.
type Sequencers = Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// A claim on one room's sequencer. Dropping the last claim for a room
/// removes its entry from the map.
pub struct SequencerHandle {
    room_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    sequencers: Sequencers,
}

impl SequencerHandle {
    /// Wait for the room's turn.
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lock.lock().await
    }
}

impl Drop for SequencerHandle {
    fn drop(&mut self) {
        let mut sequencers = self
            .sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Handles are cloned only under this lock, so a count of two is the map plus this handle.
        let last = sequencers
            .get(&self.room_id)
            .is_some_and(|lock| Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(&self.lock) == 2);
        if last {
            sequencers.remove(&self.room_id);
        }
    }
}

/// Shared application state, injected into Axum handlers via State extractor.
/// Clone is required by Axum; all inner fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub config: Arc<ChatConfig>,
    pub hub: Arc<RwLock<Hub>>,
    sequencers: Sequencers,
}

impl AppState {
    #[must_use]
    pub fn new(store: Arc<dyn ChatStore>, config: ChatConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
            hub: Arc::new(RwLock::new(Hub::new())),
            sequencers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The write sequencer for a room, created on first use.
    #[must_use]
    pub fn room_sequencer(&self, room_id: &str) -> SequencerHandle {
        let mut sequencers = self
            .sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let lock = sequencers.entry(room_id.to_owned()).or_default().clone();
        SequencerHandle { room_id: room_id.to_owned(), lock, sequencers: Arc::clone(&self.sequencers) }
    }

    /// Rooms that currently have a live sequencer.
    #[cfg(test)]
    #[must_use]
    pub fn sequencer_count(&self) -> usize {
        self.sequencers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================


#[cfg(test)]
#[path = "state_test.rs"]
mod tests;

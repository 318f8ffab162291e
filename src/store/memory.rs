//! In-memory [`ChatStore`] used when no database is configured and in tests.
//!
//! One mutex guards all tables, so each trait call is atomic. That gives
//! the same uniqueness guarantee for reactions that the Postgres index does.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use uuid::Uuid;

use super::{ANONYMOUS_NAME, ChatMessage, ChatStore, Identity, MessageOrigin, NewMessage, Reaction, Room, StoreError};
use crate::frame::now_ms;

const WS_TICKET_TTL_MS: i64 = 60_000;
#[cfg(test)]
const SESSION_TTL_MS: i64 = 7 * 24 * 60 * 60 * 1000;

#[derive(Default)]
struct Tables {
    users: HashMap<Uuid, String>,
    /// token -> (user, expires at ms)
    sessions: HashMap<String, (Uuid, i64)>,
    tickets: HashMap<String, (Uuid, i64)>,
    rooms: Vec<Room>,
    /// Insertion order is persistence order.
    messages: Vec<NewMessage>,
    reactions: Vec<StoredReaction>,
}

#[derive(Clone)]
struct StoredReaction {
    id: Uuid,
    message_id: Uuid,
    emoji: String,
    author_id: Option<Uuid>,
}

pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store with the default `general` room provisioned.
    #[must_use]
    pub fn new() -> Self {
        let now = now_ms();
        let general = Room {
            id: "general".into(),
            name: "General".into(),
            description: "Default room for everyone".into(),
            is_private: false,
            created_at: now,
            updated_at: now,
        };
        Self { tables: Mutex::new(Tables { rooms: vec![general], ..Tables::default() }) }
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provision a room out of band.
    #[cfg(test)]
    pub fn add_room(&self, id: &str, name: &str, is_private: bool) {
        let now = now_ms();
        let mut tables = self.lock();
        tables.rooms.retain(|r| r.id != id);
        tables.rooms.push(Room {
            id: id.to_owned(),
            name: name.to_owned(),
            description: String::new(),
            is_private,
            created_at: now,
            updated_at: now,
        });
    }

    /// Register a session token for a user, as the surrounding app would on login.
    #[cfg(test)]
    pub fn add_session(&self, token: &str, user_id: Uuid) {
        self.lock()
            .sessions
            .insert(token.to_owned(), (user_id, now_ms() + SESSION_TTL_MS));
    }

    /// Total persisted messages across all rooms.
    #[cfg(test)]
    #[must_use]
    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    /// Total persisted reactions across all messages.
    #[cfg(test)]
    #[must_use]
    pub fn reaction_count(&self) -> usize {
        self.lock().reactions.len()
    }
}

impl Tables {
    fn username(&self, user_id: Option<Uuid>) -> String {
        user_id
            .and_then(|id| self.users.get(&id).cloned())
            .unwrap_or_else(|| ANONYMOUS_NAME.to_owned())
    }

    fn reaction(&self, stored: &StoredReaction) -> Reaction {
        Reaction {
            id: stored.id,
            message_id: stored.message_id,
            emoji: stored.emoji.clone(),
            user_id: stored.author_id,
            username: self.username(stored.author_id),
        }
    }

    fn hydrate(&self, message: &NewMessage, with_reactions: bool) -> ChatMessage {
        let reactions = if with_reactions {
            self.reactions
                .iter()
                .filter(|r| r.message_id == message.id)
                .map(|r| self.reaction(r))
                .collect()
        } else {
            Vec::new()
        };
        ChatMessage {
            id: message.id,
            content: message.content.clone(),
            room_id: message.room_id.clone(),
            author_id: message.author_id,
            username: self.username(message.author_id),
            reply_to_id: message.parent_id,
            attachment: message.attachment.clone(),
            is_edited: false,
            created_at: message.created_at,
            updated_at: message.created_at,
            reactions,
        }
    }
}

#[async_trait]
impl ChatStore for MemoryStore {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms = self.lock().rooms.clone();
        rooms.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(rooms)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let mut tables = self.lock();
        if tables.messages.iter().any(|m| m.id == message.id) {
            return Err(StoreError::Duplicate);
        }
        let hydrated = tables.hydrate(&message, false);
        tables.messages.push(message);
        Ok(hydrated)
    }

    async fn message_origin(&self, message_id: Uuid) -> Result<Option<MessageOrigin>, StoreError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .find(|m| m.id == message_id)
            .map(|m| MessageOrigin { room_id: m.room_id.clone(), author_id: m.author_id }))
    }

    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let tables = self.lock();
        let mut recent: Vec<ChatMessage> = tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id)
            .take(limit)
            .map(|m| tables.hydrate(m, true))
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn search_messages(&self, room_id: &str, query: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let needle = query.to_lowercase();
        let tables = self.lock();
        Ok(tables
            .messages
            .iter()
            .rev()
            .filter(|m| m.room_id == room_id && m.content.to_lowercase().contains(&needle))
            .take(limit)
            .map(|m| tables.hydrate(m, true))
            .collect())
    }

    async fn insert_reaction(&self, message_id: Uuid, emoji: &str, author_id: Option<Uuid>) -> Result<Reaction, StoreError> {
        let mut tables = self.lock();
        let exists = tables
            .reactions
            .iter()
            .any(|r| r.message_id == message_id && r.emoji == emoji && r.author_id == author_id);
        if exists {
            return Err(StoreError::Duplicate);
        }
        let stored = StoredReaction { id: Uuid::now_v7(), message_id, emoji: emoji.to_owned(), author_id };
        let reaction = tables.reaction(&stored);
        tables.reactions.push(stored);
        Ok(reaction)
    }

    async fn delete_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        author_id: Option<Uuid>,
    ) -> Result<Option<Reaction>, StoreError> {
        let mut tables = self.lock();
        let Some(index) = tables
            .reactions
            .iter()
            .position(|r| r.message_id == message_id && r.emoji == emoji && r.author_id == author_id)
        else {
            return Ok(None);
        };
        let stored = tables.reactions.remove(index);
        Ok(Some(tables.reaction(&stored)))
    }

    async fn find_user(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .lock()
            .users
            .iter()
            .find(|(_, name)| name.as_str() == username)
            .map(|(id, name)| Identity::user(*id, name.clone())))
    }

    async fn upsert_user(&self, username: &str) -> Result<Identity, StoreError> {
        let mut tables = self.lock();
        if let Some((id, name)) = tables.users.iter().find(|(_, name)| name.as_str() == username) {
            return Ok(Identity::user(*id, name.clone()));
        }
        let id = Uuid::new_v4();
        tables.users.insert(id, username.to_owned());
        Ok(Identity::user(id, username))
    }

    async fn session_user(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let tables = self.lock();
        let now = now_ms();
        Ok(tables
            .sessions
            .get(token)
            .filter(|(_, expires_at)| *expires_at > now)
            .and_then(|(user_id, _)| {
                tables
                    .users
                    .get(user_id)
                    .map(|name| Identity::user(*user_id, name.clone()))
            }))
    }

    async fn insert_ws_ticket(&self, ticket: &str, user_id: Uuid) -> Result<(), StoreError> {
        self.lock()
            .tickets
            .insert(ticket.to_owned(), (user_id, now_ms() + WS_TICKET_TTL_MS));
        Ok(())
    }

    async fn take_ws_ticket(&self, ticket: &str) -> Result<Option<Identity>, StoreError> {
        let mut tables = self.lock();
        let Some((user_id, expires_at)) = tables.tickets.remove(ticket) else {
            return Ok(None);
        };
        if expires_at <= now_ms() {
            return Ok(None);
        }
        Ok(tables
            .users
            .get(&user_id)
            .map(|name| Identity::user(user_id, name.clone())))
    }
}

#[cfg(test)]
#[path = "memory_test.rs"]
mod tests;

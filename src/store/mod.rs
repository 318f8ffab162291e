//! Persistent chat storage.
//!
//! ARCHITECTURE
//! ============
//! Services talk to storage only through the [`ChatStore`] trait. Postgres
//! is the production backend; the in-memory backend serves local runs
//! without `DATABASE_URL` and the test suite.
//!
//! DESIGN
//! ======
//! - Every write is a single-row insert or delete. No multi-row transactions.
//! - Reaction uniqueness over (message, emoji, author) is a storage-level
//!   guarantee: a racing duplicate insert surfaces as [`StoreError::Duplicate`].
//! - Reads return hydrated records: author usernames resolved, reactions
//!   attached to messages.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Display name used for messages and reactions without an author.
pub const ANONYMOUS_NAME: &str = "Anonymous";

// =============================================================================
// RECORDS
// =============================================================================

/// Who is behind a connection. Anonymous connections have no `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub user_id: Option<Uuid>,
    pub username: String,
}

impl Identity {
    #[must_use]
    pub fn anonymous() -> Self {
        Self { user_id: None, username: ANONYMOUS_NAME.to_owned() }
    }

    #[must_use]
    pub fn user(user_id: Uuid, username: impl Into<String>) -> Self {
        Self { user_id: Some(user_id), username: username.into() }
    }

    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.user_id.is_none()
    }
}

/// A stored file referenced by a message. All three fields or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_url: String,
    pub file_name: String,
    pub file_type: String,
}

/// Insert payload for a message. Id and timestamps are assigned by the store
/// caller's sequencer, not by clients.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub room_id: String,
    pub author_id: Option<Uuid>,
    pub content: String,
    pub parent_id: Option<Uuid>,
    pub attachment: Option<Attachment>,
    pub created_at: i64,
}

/// A message as clients see it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub content: String,
    pub room_id: String,
    pub author_id: Option<Uuid>,
    /// Resolved author name, [`ANONYMOUS_NAME`] when there is no author.
    pub username: String,
    pub reply_to_id: Option<Uuid>,
    #[serde(flatten)]
    pub attachment: Option<Attachment>,
    pub is_edited: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub reactions: Vec<Reaction>,
}

/// Where a message lives and who wrote it.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct MessageOrigin {
    pub room_id: String,
    pub author_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: Uuid,
    pub message_id: Uuid,
    pub emoji: String,
    pub user_id: Option<Uuid>,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub id: String,
    pub name: String,
    pub description: String,
    pub is_private: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("duplicate row")]
    Duplicate,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

// =============================================================================
// TRAIT
// =============================================================================

/// Storage operations needed by the chat services.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// All rooms, ordered by id.
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Persist a message and return it hydrated with the author name and an
    /// empty reaction list.
    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError>;

    /// Room and author of an existing message, `None` when it does not exist.
    async fn message_origin(&self, message_id: Uuid) -> Result<Option<MessageOrigin>, StoreError>;

    /// The `limit` most recent messages of a room, oldest first.
    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    /// Case-insensitive substring search inside one room, newest first.
    async fn search_messages(&self, room_id: &str, query: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError>;

    /// Insert a reaction. [`StoreError::Duplicate`] when the triple exists.
    async fn insert_reaction(&self, message_id: Uuid, emoji: &str, author_id: Option<Uuid>) -> Result<Reaction, StoreError>;

    /// Delete the reaction matching the triple, returning it if it existed.
    async fn delete_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        author_id: Option<Uuid>,
    ) -> Result<Option<Reaction>, StoreError>;

    async fn find_user(&self, username: &str) -> Result<Option<Identity>, StoreError>;

    /// Create the user if missing. Only the development ticket bootstrap uses this.
    async fn upsert_user(&self, username: &str) -> Result<Identity, StoreError>;

    /// Resolve a live session token issued by the surrounding application.
    async fn session_user(&self, token: &str) -> Result<Option<Identity>, StoreError>;

    async fn insert_ws_ticket(&self, ticket: &str, user_id: Uuid) -> Result<(), StoreError>;

    /// Consume a ticket atomically. Expired or unknown tickets yield `None`.
    async fn take_ws_ticket(&self, ticket: &str) -> Result<Option<Identity>, StoreError>;
}

/// Escape `LIKE` metacharacters so user input matches literally.
#[must_use]
pub(crate) fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len() + 2);
    out.push('%');
    for ch in query.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('%');
    out
}

//! Postgres-backed [`ChatStore`].
//!
//! Reads join `users` to resolve author names. Reaction inserts use
//! `ON CONFLICT DO NOTHING` against the `reactions_unique_triple` index, so
//! concurrent duplicate adds resolve inside Postgres: one insert returns a
//! row, the other returns nothing and maps to [`StoreError::Duplicate`].

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{
    ANONYMOUS_NAME, Attachment, ChatMessage, ChatStore, Identity, MessageOrigin, NewMessage, Reaction, Room, StoreError,
    escape_like,
};
use crate::frame::now_ms;

const MESSAGE_COLUMNS: &str = "m.id, m.room_id, m.author_id, u.username, m.content, m.parent_id, \
     m.file_url, m.file_name, m.file_type, m.is_edited, m.created_at, m.updated_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

// =============================================================================
// ROW MAPPING
// =============================================================================

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    room_id: String,
    author_id: Option<Uuid>,
    username: Option<String>,
    content: String,
    parent_id: Option<Uuid>,
    file_url: Option<String>,
    file_name: Option<String>,
    file_type: Option<String>,
    is_edited: bool,
    created_at: i64,
    updated_at: i64,
}

impl MessageRow {
    fn into_message(self, reactions: Vec<Reaction>) -> ChatMessage {
        let attachment = match (self.file_url, self.file_name, self.file_type) {
            (Some(file_url), Some(file_name), Some(file_type)) => Some(Attachment { file_url, file_name, file_type }),
            _ => None,
        };
        ChatMessage {
            id: self.id,
            content: self.content,
            room_id: self.room_id,
            author_id: self.author_id,
            username: self.username.unwrap_or_else(|| ANONYMOUS_NAME.to_owned()),
            reply_to_id: self.parent_id,
            attachment,
            is_edited: self.is_edited,
            created_at: self.created_at,
            updated_at: self.updated_at,
            reactions,
        }
    }
}

#[derive(sqlx::FromRow)]
struct ReactionRow {
    id: Uuid,
    message_id: Uuid,
    emoji: String,
    author_id: Option<Uuid>,
    username: Option<String>,
}

impl From<ReactionRow> for Reaction {
    fn from(row: ReactionRow) -> Self {
        Self {
            id: row.id,
            message_id: row.message_id,
            emoji: row.emoji,
            user_id: row.author_id,
            username: row.username.unwrap_or_else(|| ANONYMOUS_NAME.to_owned()),
        }
    }
}

fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

impl PgStore {
    /// Attach reactions to a batch of message rows, preserving row order.
    async fn hydrate(&self, rows: Vec<MessageRow>) -> Result<Vec<ChatMessage>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();
        let reaction_rows = sqlx::query_as::<_, ReactionRow>(
            "SELECT r.id, r.message_id, r.emoji, r.author_id, u.username
             FROM reactions r
             LEFT JOIN users u ON u.id = r.author_id
             WHERE r.message_id = ANY($1)
             ORDER BY r.created_at ASC, r.id ASC",
        )
        .bind(ids.as_slice())
        .fetch_all(&self.pool)
        .await?;

        let mut by_message: HashMap<Uuid, Vec<Reaction>> = HashMap::new();
        for row in reaction_rows {
            by_message.entry(row.message_id).or_default().push(row.into());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let reactions = by_message.remove(&row.id).unwrap_or_default();
                row.into_message(reactions)
            })
            .collect())
    }
}

// =============================================================================
// TRAIT IMPL
// =============================================================================

#[async_trait]
impl ChatStore for PgStore {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, bool, i64, i64)>(
            "SELECT id, name, description, is_private, created_at, updated_at FROM rooms ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, name, description, is_private, created_at, updated_at)| Room {
                id,
                name,
                description,
                is_private,
                created_at,
                updated_at,
            })
            .collect())
    }

    async fn insert_message(&self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let (file_url, file_name, file_type) = match message.attachment {
            Some(a) => (Some(a.file_url), Some(a.file_name), Some(a.file_type)),
            None => (None, None, None),
        };
        let row = sqlx::query_as::<_, MessageRow>(&format!(
            "WITH m AS (
                INSERT INTO messages
                    (id, room_id, author_id, content, parent_id, file_url, file_name, file_type, created_at, updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
                RETURNING *
             )
             SELECT {MESSAGE_COLUMNS} FROM m LEFT JOIN users u ON u.id = m.author_id"
        ))
        .bind(message.id)
        .bind(&message.room_id)
        .bind(message.author_id)
        .bind(&message.content)
        .bind(message.parent_id)
        .bind(file_url)
        .bind(file_name)
        .bind(file_type)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_message(Vec::new()))
    }

    async fn message_origin(&self, message_id: Uuid) -> Result<Option<MessageOrigin>, StoreError> {
        let origin = sqlx::query_as::<_, MessageOrigin>("SELECT room_id, author_id FROM messages WHERE id = $1")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(origin)
    }

    async fn recent_messages(&self, room_id: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let mut rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.author_id
             WHERE m.room_id = $1
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $2"
        ))
        .bind(room_id)
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.reverse();
        self.hydrate(rows).await
    }

    async fn search_messages(&self, room_id: &str, query: &str, limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        let rows = sqlx::query_as::<_, MessageRow>(&format!(
            "SELECT {MESSAGE_COLUMNS}
             FROM messages m
             LEFT JOIN users u ON u.id = m.author_id
             WHERE m.room_id = $1 AND m.content ILIKE $2 ESCAPE '\\'
             ORDER BY m.created_at DESC, m.id DESC
             LIMIT $3"
        ))
        .bind(room_id)
        .bind(escape_like(query))
        .bind(sql_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn insert_reaction(&self, message_id: Uuid, emoji: &str, author_id: Option<Uuid>) -> Result<Reaction, StoreError> {
        let row = sqlx::query_as::<_, ReactionRow>(
            "WITH r AS (
                INSERT INTO reactions (id, message_id, emoji, author_id, created_at)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT DO NOTHING
                RETURNING id, message_id, emoji, author_id
             )
             SELECT r.id, r.message_id, r.emoji, r.author_id, u.username
             FROM r LEFT JOIN users u ON u.id = r.author_id",
        )
        .bind(Uuid::now_v7())
        .bind(message_id)
        .bind(emoji)
        .bind(author_id)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Reaction::from).ok_or(StoreError::Duplicate)
    }

    async fn delete_reaction(
        &self,
        message_id: Uuid,
        emoji: &str,
        author_id: Option<Uuid>,
    ) -> Result<Option<Reaction>, StoreError> {
        let row = sqlx::query_as::<_, ReactionRow>(
            "WITH r AS (
                DELETE FROM reactions
                WHERE message_id = $1 AND emoji = $2 AND author_id IS NOT DISTINCT FROM $3
                RETURNING id, message_id, emoji, author_id
             )
             SELECT r.id, r.message_id, r.emoji, r.author_id, u.username
             FROM r LEFT JOIN users u ON u.id = r.author_id",
        )
        .bind(message_id)
        .bind(emoji)
        .bind(author_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Reaction::from))
    }

    async fn find_user(&self, username: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String)>("SELECT id, username FROM users WHERE username = $1")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(id, username)| Identity::user(id, username)))
    }

    async fn upsert_user(&self, username: &str) -> Result<Identity, StoreError> {
        let (id, username) = sqlx::query_as::<_, (Uuid, String)>(
            "INSERT INTO users (id, username) VALUES ($1, $2)
             ON CONFLICT (username) DO UPDATE SET username = EXCLUDED.username
             RETURNING id, username",
        )
        .bind(Uuid::new_v4())
        .bind(username)
        .fetch_one(&self.pool)
        .await?;
        Ok(Identity::user(id, username))
    }

    async fn session_user(&self, token: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String)>(
            "SELECT u.id, u.username
             FROM sessions s
             JOIN users u ON u.id = s.user_id
             WHERE s.token = $1 AND s.expires_at > now()",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, username)| Identity::user(id, username)))
    }

    async fn insert_ws_ticket(&self, ticket: &str, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO ws_tickets (ticket, user_id) VALUES ($1, $2)")
            .bind(ticket)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn take_ws_ticket(&self, ticket: &str) -> Result<Option<Identity>, StoreError> {
        let row = sqlx::query_as::<_, (Uuid, String)>(
            "WITH t AS (
                DELETE FROM ws_tickets WHERE ticket = $1 RETURNING user_id, expires_at
             )
             SELECT u.id, u.username FROM t JOIN users u ON u.id = t.user_id
             WHERE t.expires_at > now()",
        )
        .bind(ticket)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, username)| Identity::user(id, username)))
    }
}

#[cfg(test)]
#[path = "postgres_test.rs"]
mod tests;

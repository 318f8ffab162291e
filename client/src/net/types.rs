//! Shared wire-protocol DTOs for the client/server boundary.
//!
//! DESIGN
//! ======
//! These types mirror server frame payloads so serde round-trips stay
//! lossless. Ids stay strings on the client; the server owns UUID parsing.

#[cfg(test)]
#[path = "types_test.rs"]
mod types_test;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Lifecycle position of a frame in a request/response stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameStatus {
    Request,
    Item,
    Done,
    Error,
    Cancel,
}

/// The socket envelope, as sent and received by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub ts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<String>,
    #[serde(default)]
    pub from: Option<String>,
    pub syscall: String,
    pub status: FrameStatus,
    #[serde(default = "empty_object")]
    pub data: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Frame {
    /// Build an outbound request with a fresh id. Non-object payloads are
    /// replaced by an empty object, which is all the server accepts.
    pub fn request(syscall: &str, data: serde_json::Value) -> Self {
        let data = if data.is_object() { data } else { empty_object() };
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            ts: 0,
            room_id: None,
            from: None,
            syscall: syscall.to_owned(),
            status: FrameStatus::Request,
            data,
        }
    }

    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(serde_json::Value::as_str)
    }
}

/// A reaction on a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reaction {
    pub id: String,
    pub message_id: String,
    pub emoji: String,
    /// Reacting user, `None` for anonymous reactions.
    #[serde(default)]
    pub user_id: Option<String>,
    pub username: String,
}

/// A chat message as the server renders it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub content: String,
    pub room_id: String,
    #[serde(default)]
    pub author_id: Option<String>,
    pub username: String,
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub file_url: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub is_edited: bool,
    /// Milliseconds since the Unix epoch.
    #[serde(deserialize_with = "deserialize_i64_from_number")]
    pub created_at: i64,
    #[serde(default, deserialize_with = "deserialize_i64_from_number")]
    pub updated_at: i64,
    #[serde(default)]
    pub reactions: Vec<Reaction>,
}

/// Structured error carried by an error-status frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameError {
    /// Request that failed.
    pub syscall: String,
    /// Grepable code such as `E_EMPTY_CONTENT`. `None` for gateway errors.
    pub code: Option<String>,
    pub message: String,
    pub retryable: bool,
}

impl FrameError {
    /// Extract the error payload from an error-status or gateway error frame.
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.status != FrameStatus::Error && frame.syscall != "gateway:error" {
            return None;
        }
        Some(Self {
            syscall: frame.syscall.clone(),
            code: frame.str_field("code").map(str::to_owned),
            message: frame.str_field("message").unwrap_or("unknown error").to_owned(),
            retryable: frame
                .data
                .get("retryable")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        })
    }
}

/// Parse a list of messages, skipping entries that do not match the schema.
pub fn parse_messages(value: Option<&serde_json::Value>) -> Option<Vec<ChatMessage>> {
    let items = value?.as_array()?;
    Some(
        items
            .iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect(),
    )
}

fn deserialize_i64_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::Number(number) => {
            if let Some(int) = number.as_i64() {
                return Ok(int);
            }
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            if let Some(float) = number.as_f64()
                && float.is_finite()
                && float.fract() == 0.0
                && float >= i64::MIN as f64
                && float <= i64::MAX as f64
            {
                return Ok(float as i64);
            }
            Err(D::Error::custom("expected integer-compatible number"))
        }
        _ => Err(D::Error::custom("expected number")),
    }
}

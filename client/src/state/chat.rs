//! Chat state for one connection.
//!
//! SYSTEM CONTEXT
//! ==============
//! The UI owns the socket; every inbound frame is handed to
//! [`ChatState::apply_frame`], and outbound actions are built here as
//! request frames so the local view and the wire format stay in step.
//!
//! DESIGN
//! ======
//! - Messages are deduplicated by id and kept in ascending `created_at`
//!   order, so a live broadcast racing a history reply cannot double up.
//! - Only events for the joined room touch `messages` and `typing`.
//! - Reaction toggling is a local decision: the server never flips a
//!   reaction on its own.

#[cfg(test)]
#[path = "chat_test.rs"]
mod chat_test;

use std::collections::{BTreeSet, HashMap};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::net::types::{ChatMessage, Frame, FrameError, FrameStatus, Reaction, parse_messages};

/// Local projection of the chat session.
#[derive(Clone, Debug, Default)]
pub struct ChatState {
    /// Client id assigned by the server on connect.
    pub self_client_id: Option<String>,
    /// Handshake identity. `None` user id means anonymous.
    pub self_user_id: Option<String>,
    pub self_username: Option<String>,
    /// Room the server last confirmed.
    pub room_id: Option<String>,
    /// Messages of `room_id`, ascending.
    pub messages: Vec<ChatMessage>,
    /// Usernames currently typing in `room_id`.
    pub typing: BTreeSet<String>,
    pub search_query: Option<String>,
    /// Latest search results, newest first as delivered.
    pub search_results: Vec<ChatMessage>,
    /// Private conversations keyed by the other party's username.
    pub private_conversations: HashMap<String, Vec<ChatMessage>>,
    pub last_error: Option<FrameError>,
}

impl ChatState {
    // =========================================================================
    // INBOUND
    // =========================================================================

    /// Apply one server frame. Returns `true` when the frame was recognised.
    pub fn apply_frame(&mut self, frame: &Frame) -> bool {
        if let Some(err) = FrameError::from_frame(frame) {
            self.last_error = Some(err);
            return true;
        }

        match (frame.syscall.as_str(), frame.status) {
            ("connected", FrameStatus::Request) => {
                self.self_client_id = frame.str_field("clientId").map(str::to_owned);
                self.self_user_id = frame.str_field("userId").map(str::to_owned);
                self.self_username = frame.str_field("username").map(str::to_owned);
                if let Some(room_id) = frame.str_field("roomId") {
                    self.enter_room(room_id);
                }
                true
            }
            ("join_room", FrameStatus::Done) => {
                if let Some(room_id) = frame.str_field("roomId") {
                    self.enter_room(room_id);
                }
                true
            }
            ("leave_room", FrameStatus::Done) => {
                if frame.str_field("roomId") == self.room_id.as_deref() {
                    self.room_id = None;
                    self.messages.clear();
                    self.typing.clear();
                }
                true
            }
            ("receive_message", FrameStatus::Request) => {
                let Ok(message) = serde_json::from_value::<ChatMessage>(frame.data.clone()) else {
                    return false;
                };
                if self.room_id.as_deref() == Some(message.room_id.as_str()) {
                    self.typing.remove(&message.username);
                    upsert_message(&mut self.messages, message);
                }
                true
            }
            ("get_history", FrameStatus::Done) => {
                let Some(history) = parse_messages(frame.data.get("messages")) else {
                    return false;
                };
                if frame.str_field("roomId") == self.room_id.as_deref() {
                    for message in history {
                        upsert_message(&mut self.messages, message);
                    }
                }
                true
            }
            ("search_results", FrameStatus::Done) => {
                let Some(results) = parse_messages(frame.data.get("results")) else {
                    return false;
                };
                self.search_query = frame.str_field("query").map(str::to_owned);
                self.search_results = results;
                true
            }
            ("reaction_added", FrameStatus::Request) => {
                let Some(reaction) = reaction_payload(frame) else {
                    return false;
                };
                self.for_message(&reaction.message_id, |message| {
                    if !message.reactions.iter().any(|r| r.id == reaction.id) {
                        message.reactions.push(reaction.clone());
                    }
                });
                true
            }
            ("reaction_removed", FrameStatus::Request) => {
                let Some(reaction) = reaction_payload(frame) else {
                    return false;
                };
                self.for_message(&reaction.message_id, |message| {
                    message.reactions.retain(|r| r.id != reaction.id);
                });
                true
            }
            ("user_typing", FrameStatus::Request) => {
                if let Some(username) = self.typing_target(frame) {
                    self.typing.insert(username);
                }
                true
            }
            ("user_stop_typing", FrameStatus::Request) => {
                if let Some(username) = self.typing_target(frame) {
                    self.typing.remove(&username);
                }
                true
            }
            ("receive_private_message", FrameStatus::Request) => {
                let Ok(message) = serde_json::from_value::<ChatMessage>(frame.data.clone()) else {
                    return false;
                };
                let peer = if self.self_username.as_deref() == Some(message.username.as_str()) {
                    frame.str_field("recipientUsername").unwrap_or_default().to_owned()
                } else {
                    message.username.clone()
                };
                upsert_message(self.private_conversations.entry(peer).or_default(), message);
                true
            }
            ("get_private_history", FrameStatus::Done) => {
                let (Some(peer), Some(history)) =
                    (frame.str_field("username"), parse_messages(frame.data.get("messages")))
                else {
                    return false;
                };
                let conversation = self.private_conversations.entry(peer.to_owned()).or_default();
                for message in history {
                    upsert_message(conversation, message);
                }
                true
            }
            ("room_joined" | "room_left", FrameStatus::Request) | ("pong", FrameStatus::Done) => true,
            _ => false,
        }
    }

    fn enter_room(&mut self, room_id: &str) {
        if self.room_id.as_deref() != Some(room_id) {
            self.messages.clear();
            self.typing.clear();
            self.search_query = None;
            self.search_results.clear();
        }
        self.room_id = Some(room_id.to_owned());
    }

    fn typing_target(&self, frame: &Frame) -> Option<String> {
        if frame.str_field("roomId") != self.room_id.as_deref() {
            return None;
        }
        frame.str_field("username").map(str::to_owned)
    }

    /// Run `apply` on every local copy of a message.
    fn for_message(&mut self, message_id: &str, mut apply: impl FnMut(&mut ChatMessage)) {
        let rooms = self.messages.iter_mut();
        let search = self.search_results.iter_mut();
        let private = self.private_conversations.values_mut().flat_map(|c| c.iter_mut());
        for message in rooms.chain(search).chain(private) {
            if message.id == message_id {
                apply(message);
            }
        }
    }

    /// True when the local user already holds `emoji` on the message.
    /// Anonymous users share a single slot per emoji.
    pub fn has_reacted(&self, message_id: &str, emoji: &str) -> bool {
        self.messages
            .iter()
            .chain(self.private_conversations.values().flatten())
            .filter(|m| m.id == message_id)
            .flat_map(|m| m.reactions.iter())
            .any(|r| r.emoji == emoji && r.user_id == self.self_user_id)
    }

    // =========================================================================
    // OUTBOUND
    // =========================================================================

    pub fn join_room(room_id: &str) -> Frame {
        Frame::request("join_room", serde_json::json!({ "roomId": room_id }))
    }

    pub fn leave_room(room_id: &str) -> Frame {
        Frame::request("leave_room", serde_json::json!({ "roomId": room_id }))
    }

    /// Build `send_message` for the joined room. `None` before the first join.
    pub fn send_message(&self, content: &str, reply_to_id: Option<&str>) -> Option<Frame> {
        let room_id = self.room_id.as_deref()?;
        let mut data = serde_json::json!({ "roomId": room_id, "content": content });
        if let Some(reply_to_id) = reply_to_id {
            data["replyToId"] = serde_json::json!(reply_to_id);
        }
        Some(Frame::request("send_message", data))
    }

    pub fn typing(&self, active: bool) -> Option<Frame> {
        let room_id = self.room_id.as_deref()?;
        let syscall = if active { "typing" } else { "stop_typing" };
        Some(Frame::request(syscall, serde_json::json!({ "roomId": room_id })))
    }

    pub fn get_history(&self, limit: Option<usize>) -> Option<Frame> {
        let room_id = self.room_id.as_deref()?;
        let mut data = serde_json::json!({ "roomId": room_id });
        if let Some(limit) = limit {
            data["limit"] = serde_json::json!(limit);
        }
        Some(Frame::request("get_history", data))
    }

    pub fn search(&self, query: &str) -> Option<Frame> {
        let room_id = self.room_id.as_deref()?;
        Some(Frame::request(
            "search_messages",
            serde_json::json!({ "roomId": room_id, "query": query }),
        ))
    }

    /// Add the reaction if the local user does not hold it yet, remove it
    /// otherwise.
    pub fn toggle_reaction(&self, message_id: &str, emoji: &str) -> Frame {
        let syscall = if self.has_reacted(message_id, emoji) {
            "remove_reaction"
        } else {
            "add_reaction"
        };
        Frame::request(syscall, serde_json::json!({ "messageId": message_id, "emoji": emoji }))
    }

    /// Build `upload_file` for the joined room. The bytes travel base64-encoded.
    pub fn upload_file(&self, file_name: &str, file_type: &str, bytes: &[u8]) -> Option<Frame> {
        let room_id = self.room_id.as_deref()?;
        Some(Frame::request(
            "upload_file",
            serde_json::json!({
                "roomId": room_id,
                "fileName": file_name,
                "fileType": file_type,
                "file": STANDARD.encode(bytes),
            }),
        ))
    }

    pub fn ping() -> Frame {
        Frame::request("ping", serde_json::json!({}))
    }

    pub fn send_private_message(recipient_username: &str, content: &str) -> Frame {
        Frame::request(
            "send_private_message",
            serde_json::json!({ "recipientUsername": recipient_username, "content": content }),
        )
    }

    pub fn get_private_history(username: &str) -> Frame {
        Frame::request("get_private_history", serde_json::json!({ "username": username }))
    }
}

fn reaction_payload(frame: &Frame) -> Option<Reaction> {
    serde_json::from_value(frame.data.get("reaction")?.clone()).ok()
}

/// Insert or replace by id, keeping ascending `created_at` order.
fn upsert_message(messages: &mut Vec<ChatMessage>, message: ChatMessage) {
    if let Some(existing) = messages.iter_mut().find(|m| m.id == message.id) {
        *existing = message;
        return;
    }
    let at = messages.partition_point(|m| m.created_at <= message.created_at);
    messages.insert(at, message);
}

//! WebSocket handler: bidirectional frame relay.
//!
//! DESIGN
//! ======
//! On upgrade, resolves the connection's identity from the handshake ticket,
//! generates a client ID, and enters a `select!` loop:
//! - Incoming client frames → parse + dispatch by syscall
//! - Frames queued on the connection's private channel → forward to client
//!
//! Handler functions are business logic only: they validate, call a
//! service, and return an `Outcome`. The dispatch layer owns the reply to
//! the sender and membership notices to other occupants. Services that
//! persist fan out their own events so delivery follows persistence order.
//!
//! Membership changes, typing, and ping run inline in arrival order.
//! Storage-bound events run as spawned tasks that reply through the private
//! channel, so one slow storage call never stalls the socket.
//!
//! LIFECYCLE
//! =========
//! 1. Upgrade → send `connected`, auto-join the default room
//! 2. Client sends frames → dispatch → handler returns Outcome
//! 3. Dispatch applies Outcome (reply / notices)
//! 4. Close → clear typing, broadcast `room_left`, unregister

use std::collections::HashMap;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::frame::{Data, ErrorCode, Frame, Status};
use crate::services::{message, private, reaction, room, session, typing, upload};
use crate::state::{AppState, DEFAULT_ROOM};
use crate::store::Identity;

/// Capacity of each connection's private channel.
const CLIENT_QUEUE_CAPACITY: usize = 256;

/// Events handled in arrival order on the connection task.
const INLINE_SYSCALLS: &[&str] = &["join_room", "leave_room", "typing", "stop_typing", "ping"];

/// Events that touch storage and run as spawned tasks.
const STORAGE_SYSCALLS: &[&str] = &[
    "send_message",
    "get_history",
    "search_messages",
    "add_reaction",
    "remove_reaction",
    "upload_file",
    "send_private_message",
    "get_private_history",
];

// =============================================================================
// OUTCOME
// =============================================================================

/// A membership notice for the other occupants of a room.
struct Notice {
    room_id: String,
    syscall: &'static str,
    data: Data,
}

/// Result returned by handler functions. The dispatch layer uses this to
/// decide who receives what.
enum Outcome {
    /// Send done+data to sender only.
    Reply(Data),
    /// Send done+data to sender under a different event name.
    ReplyAs { syscall: &'static str, data: Data },
    /// Reply to sender, notify other occupants of the named rooms.
    ReplyAndNotify { reply: Data, notices: Vec<Notice> },
    /// Answer a ping.
    Pong,
    /// Nothing goes back to the sender.
    Silent,
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct BadRequest(String);

impl ErrorCode for BadRequest {
    fn error_code(&self) -> &'static str {
        "E_BAD_REQUEST"
    }
}

/// Per-connection context handed to handlers.
#[derive(Clone)]
struct Connection {
    client_id: Uuid,
    identity: Identity,
    tx: mpsc::Sender<Frame>,
}

// =============================================================================
// UPGRADE
// =============================================================================

pub async fn handle_ws(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let identity = match params.get("ticket") {
        Some(ticket) => match session::consume_ws_ticket(state.store.as_ref(), ticket).await {
            Ok(Some(identity)) => identity,
            Ok(None) => return (StatusCode::UNAUTHORIZED, "invalid or expired ticket").into_response(),
            Err(e) => {
                error!(error = %e, "ws ticket validation failed");
                return (StatusCode::INTERNAL_SERVER_ERROR, "ticket validation error").into_response();
            }
        },
        None if state.config.allow_anonymous => Identity::anonymous(),
        None => return (StatusCode::UNAUTHORIZED, "ticket required").into_response(),
    };

    ws.on_upgrade(move |socket| run_ws(socket, state, identity))
}

// =============================================================================
// CONNECTION
// =============================================================================

async fn run_ws(mut socket: WebSocket, state: AppState, identity: Identity) {
    let client_id = Uuid::new_v4();
    let (client_tx, mut client_rx) = mpsc::channel::<Frame>(CLIENT_QUEUE_CAPACITY);
    let conn = Connection { client_id, identity, tx: client_tx.clone() };

    room::connect(&state, client_id, conn.identity.clone(), client_tx).await;

    let welcome = connected_frame(&conn);
    if send_frame(&mut socket, &welcome).await.is_err() {
        cleanup(&state, &conn).await;
        return;
    }
    auto_join(&state, &conn).await;

    info!(%client_id, username = %conn.identity.username, anonymous = conn.identity.is_anonymous(), "ws: client connected");

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let Some(msg) = msg else { break };
                let Ok(msg) = msg else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_inbound_text(&state, &conn, &text).await {
                            let _ = send_frame(&mut socket, &frame).await;
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = client_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
        }
    }

    cleanup(&state, &conn).await;
    info!(%client_id, "ws: client disconnected");
}

fn connected_frame(conn: &Connection) -> Frame {
    let mut data = Data::new();
    data.insert("clientId".into(), serde_json::json!(conn.client_id));
    data.insert("userId".into(), serde_json::json!(conn.identity.user_id));
    data.insert("username".into(), serde_json::json!(conn.identity.username));
    data.insert("roomId".into(), serde_json::json!(DEFAULT_ROOM));
    Frame::request("connected", data)
}

/// Place a fresh connection in the default room and tell its occupants.
async fn auto_join(state: &AppState, conn: &Connection) {
    match room::join_room(state, conn.client_id, DEFAULT_ROOM).await {
        Ok(transition) => {
            let notice = membership_notice("room_joined", &transition.joined, conn);
            broadcast_notice(state, conn, notice).await;
        }
        Err(e) => warn!(client_id = %conn.client_id, error = %e, "ws: default room join failed"),
    }
}

/// Tear down a connection. In-flight storage tasks keep running.
async fn cleanup(state: &AppState, conn: &Connection) {
    typing::clear_client(state, conn.client_id).await;
    if let Some(room_id) = room::disconnect(state, conn.client_id).await {
        let notice = membership_notice("room_left", &room_id, conn);
        broadcast_notice(state, conn, notice).await;
    }
}

// =============================================================================
// FRAME DISPATCH
// =============================================================================

/// Parse and process one inbound text frame and return frames for the sender.
///
/// Inline events answer through the return value. Storage-bound events are
/// spawned and answer through the connection's private channel.
async fn process_inbound_text(state: &AppState, conn: &Connection, text: &str) -> Vec<Frame> {
    let mut req: Frame = match serde_json::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            warn!(client_id = %conn.client_id, error = %e, "ws: invalid inbound frame");
            let err = Frame::request("gateway:error", Data::new()).with_data("message", format!("invalid json: {e}"));
            return vec![err];
        }
    };

    // Identity comes from the handshake; whatever the payload claims is ignored.
    req.from = Some(conn.identity.username.clone());
    info!(client_id = %conn.client_id, id = %req.id, syscall = %req.syscall, status = ?req.status, "ws: recv frame");

    if INLINE_SYSCALLS.contains(&req.syscall.as_str()) {
        let result = handle_inline(state, conn, &req).await;
        apply_outcome(state, conn, &req, result).await
    } else if STORAGE_SYSCALLS.contains(&req.syscall.as_str()) {
        spawn_storage_handler(state, conn, req);
        Vec::new()
    } else {
        vec![req.error_from(&BadRequest(format!("unknown syscall: {}", req.syscall)))]
    }
}

fn spawn_storage_handler(state: &AppState, conn: &Connection, req: Frame) {
    let state = state.clone();
    let conn = conn.clone();
    tokio::spawn(async move {
        let result = handle_storage(&state, &conn, &req).await;
        for frame in apply_outcome(&state, &conn, &req, result).await {
            // The connection may be gone; the write itself already happened.
            let _ = conn.tx.send(frame).await;
        }
    });
}

/// Turn a handler result into frames for the sender, broadcasting notices.
async fn apply_outcome(state: &AppState, conn: &Connection, req: &Frame, result: Result<Outcome, Frame>) -> Vec<Frame> {
    match result {
        Ok(Outcome::Reply(data)) => vec![req.done_with(data)],
        Ok(Outcome::ReplyAs { syscall, data }) => {
            let mut frame = req.done_with(data);
            frame.syscall = syscall.into();
            vec![frame]
        }
        Ok(Outcome::ReplyAndNotify { reply, notices }) => {
            for notice in notices {
                broadcast_notice(state, conn, notice).await;
            }
            vec![req.done_with(reply)]
        }
        Ok(Outcome::Pong) => vec![req.pong()],
        Ok(Outcome::Silent) => Vec::new(),
        Err(err_frame) => vec![err_frame],
    }
}

async fn broadcast_notice(state: &AppState, conn: &Connection, notice: Notice) {
    let frame = Frame::request(notice.syscall, notice.data).with_room_id(notice.room_id.clone());
    room::broadcast(state, &notice.room_id, &frame, Some(conn.client_id)).await;
}

fn membership_notice(syscall: &'static str, room_id: &str, conn: &Connection) -> Notice {
    let mut data = Data::new();
    data.insert("roomId".into(), serde_json::json!(room_id));
    data.insert("username".into(), serde_json::json!(conn.identity.username));
    data.insert("clientId".into(), serde_json::json!(conn.client_id));
    Notice { room_id: room_id.to_owned(), syscall, data }
}

fn membership_reply(room_id: &str, conn: &Connection) -> Data {
    let mut data = Data::new();
    data.insert("roomId".into(), serde_json::json!(room_id));
    data.insert("username".into(), serde_json::json!(conn.identity.username));
    data
}

// =============================================================================
// PAYLOAD ACCESS
// =============================================================================

fn required_str<'a>(req: &'a Frame, key: &str) -> Result<&'a str, Frame> {
    req.str_field(key)
        .ok_or_else(|| req.error_from(&BadRequest(format!("{key} required"))))
}

fn required_uuid(req: &Frame, key: &str) -> Result<Uuid, Frame> {
    req.uuid_field(key)
        .ok_or_else(|| req.error_from(&BadRequest(format!("{key} must be a message id"))))
}

// =============================================================================
// INLINE HANDLERS
// =============================================================================

async fn handle_inline(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.syscall.as_str() {
        "join_room" => {
            let room_id = required_str(req, "roomId")?;
            let transition = room::join_room(state, conn.client_id, room_id)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut notices = Vec::with_capacity(2);
            if let Some(left) = &transition.left {
                notices.push(membership_notice("room_left", left, conn));
            }
            notices.push(membership_notice("room_joined", &transition.joined, conn));
            Ok(Outcome::ReplyAndNotify { reply: membership_reply(&transition.joined, conn), notices })
        }
        "leave_room" => {
            let room_id = required_str(req, "roomId")?;
            let left = room::leave_room(state, conn.client_id, room_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            let room_id = room_id.trim();

            let notices = if left {
                vec![membership_notice("room_left", room_id, conn)]
            } else {
                Vec::new()
            };
            Ok(Outcome::ReplyAndNotify { reply: membership_reply(room_id, conn), notices })
        }
        "typing" => {
            let room_id = required_str(req, "roomId")?;
            typing::start_typing(state, conn.client_id, room_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Silent)
        }
        "stop_typing" => {
            let room_id = required_str(req, "roomId")?;
            typing::stop_typing(state, conn.client_id, room_id)
                .await
                .map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Silent)
        }
        "ping" => Ok(Outcome::Pong),
        other => Err(req.error_from(&BadRequest(format!("unknown syscall: {other}")))),
    }
}

// =============================================================================
// STORAGE HANDLERS
// =============================================================================

async fn handle_storage(state: &AppState, conn: &Connection, req: &Frame) -> Result<Outcome, Frame> {
    match req.syscall.as_str() {
        "send_message" => {
            let room_id = required_str(req, "roomId")?;
            let content = req.str_field("content").unwrap_or_default();
            let reply_to_id = match req.data.get("replyToId") {
                None | Some(serde_json::Value::Null) => None,
                Some(_) => Some(
                    req.uuid_field("replyToId")
                        .ok_or_else(|| req.error_from(&message::MessageError::InvalidReply))?,
                ),
            };
            let attachment = message::parse_attachment(
                req.str_field("fileUrl"),
                req.str_field("fileName"),
                req.str_field("fileType"),
            )
            .map_err(|e| req.error_from(&e))?;

            let sent = message::send_message(state, &conn.identity, room_id, content, reply_to_id, attachment)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("id".into(), serde_json::json!(sent.id));
            Ok(Outcome::Reply(data))
        }
        "get_history" => {
            let room_id = required_str(req, "roomId")?;
            let messages = message::get_history(state, room_id, req.usize_field("limit"))
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("roomId".into(), serde_json::json!(room_id.trim()));
            data.insert("messages".into(), serde_json::to_value(&messages).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        "search_messages" => {
            let room_id = required_str(req, "roomId")?;
            let query = req.str_field("query").unwrap_or_default();
            let results = message::search_messages(state, room_id, query)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("roomId".into(), serde_json::json!(room_id.trim()));
            data.insert("query".into(), serde_json::json!(query));
            data.insert("results".into(), serde_json::to_value(&results).unwrap_or_default());
            Ok(Outcome::ReplyAs { syscall: "search_results", data })
        }
        "add_reaction" | "remove_reaction" => {
            let message_id = required_uuid(req, "messageId")?;
            let emoji = req.str_field("emoji").unwrap_or_default();
            let result = if req.syscall == "add_reaction" {
                reaction::add_reaction(state, &conn.identity, message_id, emoji).await
            } else {
                reaction::remove_reaction(state, &conn.identity, message_id, emoji).await
            };
            let reaction = result.map_err(|e| req.error_from(&e))?;
            Ok(Outcome::Reply(reaction::reaction_data(&reaction)))
        }
        "upload_file" => {
            let room_id = required_str(req, "roomId")?;
            let file_name = required_str(req, "fileName")?;
            let file_type = required_str(req, "fileType")?;
            let encoded = req.str_field("file").unwrap_or_default();

            let sent = upload::share_file(state, &conn.identity, room_id, encoded, file_name, file_type)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("id".into(), serde_json::json!(sent.id));
            if let Some(attachment) = &sent.attachment {
                data.insert("fileUrl".into(), serde_json::json!(attachment.file_url));
            }
            Ok(Outcome::Reply(data))
        }
        "send_private_message" => {
            let recipient = required_str(req, "recipientUsername")?;
            let content = req.str_field("content").unwrap_or_default();
            let sent = private::send_private_message(state, conn.client_id, &conn.identity, recipient, content)
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("id".into(), serde_json::json!(sent.id));
            data.insert("roomId".into(), serde_json::json!(sent.room_id));
            Ok(Outcome::Reply(data))
        }
        "get_private_history" => {
            let username = required_str(req, "username")?;
            let messages = private::private_history(state, &conn.identity, username, req.usize_field("limit"))
                .await
                .map_err(|e| req.error_from(&e))?;

            let mut data = Data::new();
            data.insert("username".into(), serde_json::json!(username.trim()));
            data.insert("messages".into(), serde_json::to_value(&messages).unwrap_or_default());
            Ok(Outcome::Reply(data))
        }
        other => Err(req.error_from(&BadRequest(format!("unknown syscall: {other}")))),
    }
}

// =============================================================================
// HELPERS
// =============================================================================

async fn send_frame(socket: &mut WebSocket, frame: &Frame) -> Result<(), ()> {
    let json = match serde_json::to_string(frame) {
        Ok(j) => j,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if frame.status == Status::Error {
        let code = frame.str_field("code").unwrap_or("-");
        let message = frame.str_field("message").unwrap_or("-");
        warn!(id = %frame.id, syscall = %frame.syscall, code, message, "ws: send frame status=Error");
    } else {
        info!(id = %frame.id, syscall = %frame.syscall, status = ?frame.status, "ws: send frame");
    }
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;

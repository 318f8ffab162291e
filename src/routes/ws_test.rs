use super::*;
use crate::config::ChatConfig;
use crate::state::test_helpers;
use crate::store::{ChatMessage, ChatStore, MessageOrigin, NewMessage, Reaction, Room, StoreError};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::tungstenite;

fn request_text(syscall: &str, data: serde_json::Value) -> String {
    let data: Data = match data {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => Data::new(),
    };
    serde_json::to_string(&Frame::request(syscall, data)).expect("frame should serialize")
}

async fn connect(state: &AppState, identity: Identity, room_id: &str) -> (Connection, mpsc::Receiver<Frame>) {
    let (client_id, rx) = test_helpers::connect_client(state, identity.clone(), room_id).await;
    let tx = state.hub.read().await.clients[&client_id].tx.clone();
    (Connection { client_id, identity, tx }, rx)
}

async fn recv_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(500), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed unexpectedly")
}

async fn assert_no_frame(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected no frame"
    );
}

fn error_code(frame: &Frame) -> Option<&str> {
    assert_eq!(frame.status, Status::Error, "expected error frame, got {frame:?}");
    frame.str_field("code")
}

// =============================================================================
// GATEWAY
// =============================================================================

#[tokio::test]
async fn invalid_json_yields_gateway_error() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;

    let frames = process_inbound_text(&state, &conn, "{not json").await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "gateway:error");
    assert!(
        frames[0]
            .str_field("message")
            .is_some_and(|m| m.starts_with("invalid json"))
    );
}

#[tokio::test]
async fn unknown_syscall_is_bad_request() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;

    let frames = process_inbound_text(&state, &conn, &request_text("delete_everything", json!({}))).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(error_code(&frames[0]), Some("E_BAD_REQUEST"));
}

#[tokio::test]
async fn ping_answers_pong() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;

    let frames = process_inbound_text(&state, &conn, &request_text("ping", json!({}))).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].syscall, "pong");
    assert_eq!(frames[0].status, Status::Done);
}

// =============================================================================
// ROOMS
// =============================================================================

#[tokio::test]
async fn join_room_moves_connection_and_notifies_both_rooms() {
    let (state, _store) = test_helpers::test_app_state();
    let alice = Identity::user(Uuid::new_v4(), "alice");
    let (conn, mut rx_alice) = connect(&state, alice, "general").await;
    let (_g, mut rx_general) = connect(&state, Identity::anonymous(), "general").await;
    let (_r, mut rx_random) = connect(&state, Identity::anonymous(), "random").await;

    let frames = process_inbound_text(&state, &conn, &request_text("join_room", json!({"roomId": "random"}))).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(frames[0].str_field("roomId"), Some("random"));
    assert_eq!(frames[0].str_field("username"), Some("alice"));

    let left = recv_frame(&mut rx_general).await;
    assert_eq!(left.syscall, "room_left");
    assert_eq!(left.str_field("username"), Some("alice"));
    assert_eq!(left.uuid_field("clientId"), Some(conn.client_id));

    let joined = recv_frame(&mut rx_random).await;
    assert_eq!(joined.syscall, "room_joined");
    assert_eq!(joined.str_field("roomId"), Some("random"));

    assert_no_frame(&mut rx_alice).await;
    assert_eq!(room::current_room(&state, conn.client_id).await.as_deref(), Some("random"));
}

#[tokio::test]
async fn join_invalid_room_errors_to_sender_only() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;

    for data in [json!({"roomId": ""}), json!({"roomId": "dm:abc"})] {
        let frames = process_inbound_text(&state, &conn, &request_text("join_room", data)).await;
        assert_eq!(error_code(&frames[0]), Some("E_INVALID_ROOM"));
    }
    let frames = process_inbound_text(&state, &conn, &request_text("join_room", json!({}))).await;
    assert_eq!(error_code(&frames[0]), Some("E_BAD_REQUEST"));

    assert_no_frame(&mut rx_peer).await;
    assert_eq!(room::current_room(&state, conn.client_id).await.as_deref(), Some("general"));
}

#[tokio::test]
async fn leave_room_is_idempotent() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;

    let frames = process_inbound_text(&state, &conn, &request_text("leave_room", json!({"roomId": "random"}))).await;
    assert_eq!(frames[0].status, Status::Done);
    assert_no_frame(&mut rx_peer).await;

    let frames = process_inbound_text(&state, &conn, &request_text("leave_room", json!({"roomId": "general"}))).await;
    assert_eq!(frames[0].status, Status::Done);
    assert_eq!(recv_frame(&mut rx_peer).await.syscall, "room_left");
    assert!(room::current_room(&state, conn.client_id).await.is_none());
}

// =============================================================================
// MESSAGES
// =============================================================================

#[tokio::test]
async fn send_message_broadcasts_then_replies() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let (conn, mut rx_alice) = connect(&state, alice.clone(), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;
    let (_other, mut rx_other) = connect(&state, Identity::anonymous(), "random").await;

    let req = request_text("send_message", json!({"content": "hello", "roomId": "general"}));
    assert!(process_inbound_text(&state, &conn, &req).await.is_empty());

    let echo = recv_frame(&mut rx_alice).await;
    assert_eq!(echo.syscall, "receive_message");
    let done = recv_frame(&mut rx_alice).await;
    assert_eq!(done.status, Status::Done);
    assert_eq!(done.syscall, "send_message");
    assert_eq!(done.uuid_field("id"), echo.uuid_field("id"));

    let delivered = recv_frame(&mut rx_peer).await;
    assert_eq!(delivered.str_field("content"), Some("hello"));
    assert_eq!(delivered.str_field("username"), Some("alice"));
    assert_eq!(delivered.data["authorId"], json!(alice.user_id));
    assert_eq!(delivered.data["reactions"], json!([]));
    assert_no_frame(&mut rx_peer).await;
    assert_no_frame(&mut rx_other).await;
}

#[tokio::test]
async fn payload_identity_fields_are_ignored() {
    let (state, store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "general").await;

    let req = request_text(
        "send_message",
        json!({"content": "hi", "roomId": "general", "username": "mallory", "userId": Uuid::new_v4()}),
    );
    process_inbound_text(&state, &conn, &req).await;

    let delivered = recv_frame(&mut rx).await;
    assert_eq!(delivered.str_field("username"), Some("Anonymous"));
    assert!(delivered.data["authorId"].is_null());
    assert_eq!(store.message_count(), 1);
}

#[tokio::test]
async fn empty_message_errors_without_broadcast() {
    let (state, store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;

    let req = request_text("send_message", json!({"content": "   ", "roomId": "general"}));
    process_inbound_text(&state, &conn, &req).await;

    let err = recv_frame(&mut rx).await;
    assert_eq!(error_code(&err), Some("E_EMPTY_CONTENT"));
    assert_no_frame(&mut rx).await;
    assert_no_frame(&mut rx_peer).await;
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn partial_attachment_and_bad_reply_are_rejected() {
    let (state, store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "general").await;

    let req = request_text(
        "send_message",
        json!({"content": "see file", "roomId": "general", "fileUrl": "/uploads/1-a.png"}),
    );
    process_inbound_text(&state, &conn, &req).await;
    assert_eq!(error_code(&recv_frame(&mut rx).await), Some("E_INVALID_ATTACHMENT"));

    let req = request_text(
        "send_message",
        json!({"content": "re", "roomId": "general", "replyToId": "not-a-uuid"}),
    );
    process_inbound_text(&state, &conn, &req).await;
    assert_eq!(error_code(&recv_frame(&mut rx).await), Some("E_INVALID_REPLY"));
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn history_and_search_reply_to_sender() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "random").await;
    for content in ["First post", "second POST", "unrelated"] {
        message::send_message(&state, &Identity::anonymous(), "general", content, None, None)
            .await
            .expect("seed");
    }

    process_inbound_text(&state, &conn, &request_text("get_history", json!({"roomId": "general", "limit": 2}))).await;
    let history = recv_frame(&mut rx).await;
    assert_eq!(history.status, Status::Done);
    let contents: Vec<&str> = history.data["messages"]
        .as_array()
        .expect("messages array")
        .iter()
        .filter_map(|m| m["content"].as_str())
        .collect();
    assert_eq!(contents, ["second POST", "unrelated"]);

    process_inbound_text(&state, &conn, &request_text("search_messages", json!({"roomId": "general", "query": "post"})))
        .await;
    let search = recv_frame(&mut rx).await;
    assert_eq!(search.syscall, "search_results");
    assert_eq!(search.status, Status::Done);
    let results = search.data["results"].as_array().expect("results array");
    assert_eq!(results.len(), 2);
    assert_eq!(results[0]["content"], "second POST");

    process_inbound_text(&state, &conn, &request_text("search_messages", json!({"roomId": "general", "query": " "})))
        .await;
    assert_eq!(error_code(&recv_frame(&mut rx).await), Some("E_EMPTY_QUERY"));
}

// =============================================================================
// TYPING
// =============================================================================

#[tokio::test]
async fn typing_reaches_others_only() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::user(Uuid::new_v4(), "alice"), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;

    let frames = process_inbound_text(&state, &conn, &request_text("typing", json!({"roomId": "general"}))).await;
    assert!(frames.is_empty());
    let notice = recv_frame(&mut rx_peer).await;
    assert_eq!(notice.syscall, "user_typing");
    assert_eq!(notice.str_field("username"), Some("alice"));

    process_inbound_text(&state, &conn, &request_text("stop_typing", json!({"roomId": "general"}))).await;
    assert_eq!(recv_frame(&mut rx_peer).await.syscall, "user_stop_typing");
    assert_no_frame(&mut rx).await;
}

#[tokio::test]
async fn typing_in_another_room_is_rejected() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, _rx) = connect(&state, Identity::anonymous(), "general").await;
    let (_other, mut rx_other) = connect(&state, Identity::anonymous(), "random").await;

    let frames = process_inbound_text(&state, &conn, &request_text("typing", json!({"roomId": "random"}))).await;
    assert_eq!(frames.len(), 1);
    assert_eq!(error_code(&frames[0]), Some("E_NOT_IN_ROOM"));
    assert_no_frame(&mut rx_other).await;
}

// =============================================================================
// REACTIONS
// =============================================================================

#[tokio::test]
async fn concurrent_duplicate_reactions_yield_one_broadcast_and_one_error() {
    let (state, store) = test_helpers::test_app_state();
    let bob = store.upsert_user("bob").await.expect("bob");
    let msg = message::send_message(&state, &bob, "general", "react", None, None)
        .await
        .expect("seed");
    let (conn, mut rx_bob) = connect(&state, bob, "random").await;
    let (_watcher, mut rx_watcher) = connect(&state, Identity::anonymous(), "general").await;

    let req = request_text("add_reaction", json!({"messageId": msg.id, "emoji": "👍"}));
    process_inbound_text(&state, &conn, &req).await;
    process_inbound_text(&state, &conn, &req).await;

    let first = recv_frame(&mut rx_bob).await;
    let second = recv_frame(&mut rx_bob).await;
    let statuses = [first.status, second.status];
    assert!(statuses.contains(&Status::Done));
    assert!(statuses.contains(&Status::Error));
    let err = if first.status == Status::Error { &first } else { &second };
    assert_eq!(error_code(err), Some("E_DUPLICATE_REACTION"));

    let added = recv_frame(&mut rx_watcher).await;
    assert_eq!(added.syscall, "reaction_added");
    assert_eq!(added.data["reaction"]["username"], "bob");
    assert_no_frame(&mut rx_watcher).await;
    assert_eq!(store.reaction_count(), 1);
}

#[tokio::test]
async fn reaction_errors_map_to_codes() {
    let (state, _store) = test_helpers::test_app_state();
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "general").await;

    process_inbound_text(&state, &conn, &request_text("add_reaction", json!({"messageId": Uuid::new_v4(), "emoji": "👍"})))
        .await;
    assert_eq!(error_code(&recv_frame(&mut rx).await), Some("E_MESSAGE_NOT_FOUND"));

    process_inbound_text(&state, &conn, &request_text("remove_reaction", json!({"messageId": "nope", "emoji": "👍"})))
        .await;
    assert_eq!(error_code(&recv_frame(&mut rx).await), Some("E_BAD_REQUEST"));
}

// =============================================================================
// PRIVATE MESSAGES
// =============================================================================

#[tokio::test]
async fn private_message_to_offline_user_errors() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let (conn, mut rx) = connect(&state, alice, "general").await;

    let req = request_text("send_private_message", json!({"content": "hi", "recipientUsername": "carol"}));
    process_inbound_text(&state, &conn, &req).await;

    let err = recv_frame(&mut rx).await;
    assert_eq!(error_code(&err), Some("E_RECIPIENT_OFFLINE"));
    assert_eq!(err.str_field("message"), Some("recipient not found or offline"));
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn private_message_round_trip_over_dispatch() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let bob = store.upsert_user("bob").await.expect("bob");
    let (alice_conn, mut rx_alice) = connect(&state, alice, "general").await;
    let (_bob_conn, mut rx_bob) = connect(&state, bob, "general").await;

    let req = request_text("send_private_message", json!({"content": "psst", "recipientUsername": "bob"}));
    process_inbound_text(&state, &alice_conn, &req).await;

    let to_bob = recv_frame(&mut rx_bob).await;
    assert_eq!(to_bob.syscall, "receive_private_message");
    assert_eq!(to_bob.data["isPrivate"], json!(true));

    let echo = recv_frame(&mut rx_alice).await;
    assert_eq!(echo.syscall, "receive_private_message");
    let done = recv_frame(&mut rx_alice).await;
    assert_eq!(done.status, Status::Done);
    assert!(done.str_field("roomId").is_some_and(|r| r.starts_with("dm:")));

    process_inbound_text(&state, &alice_conn, &request_text("get_private_history", json!({"username": "bob"}))).await;
    let history = recv_frame(&mut rx_alice).await;
    assert_eq!(history.data["messages"][0]["content"], "psst");
}

// =============================================================================
// STORAGE FAILURES
// =============================================================================

struct FailingStore;

fn unavailable() -> StoreError {
    StoreError::Database(sqlx::Error::PoolTimedOut)
}

#[async_trait::async_trait]
impl ChatStore for FailingStore {
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        Err(unavailable())
    }
    async fn insert_message(&self, _message: NewMessage) -> Result<ChatMessage, StoreError> {
        Err(unavailable())
    }
    async fn message_origin(&self, _message_id: Uuid) -> Result<Option<MessageOrigin>, StoreError> {
        Err(unavailable())
    }
    async fn recent_messages(&self, _room_id: &str, _limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        Err(unavailable())
    }
    async fn search_messages(&self, _room_id: &str, _query: &str, _limit: usize) -> Result<Vec<ChatMessage>, StoreError> {
        Err(unavailable())
    }
    async fn insert_reaction(&self, _message_id: Uuid, _emoji: &str, _author_id: Option<Uuid>) -> Result<Reaction, StoreError> {
        Err(unavailable())
    }
    async fn delete_reaction(
        &self,
        _message_id: Uuid,
        _emoji: &str,
        _author_id: Option<Uuid>,
    ) -> Result<Option<Reaction>, StoreError> {
        Err(unavailable())
    }
    async fn find_user(&self, _username: &str) -> Result<Option<Identity>, StoreError> {
        Err(unavailable())
    }
    async fn upsert_user(&self, _username: &str) -> Result<Identity, StoreError> {
        Err(unavailable())
    }
    async fn session_user(&self, _token: &str) -> Result<Option<Identity>, StoreError> {
        Err(unavailable())
    }
    async fn insert_ws_ticket(&self, _ticket: &str, _user_id: Uuid) -> Result<(), StoreError> {
        Err(unavailable())
    }
    async fn take_ws_ticket(&self, _ticket: &str) -> Result<Option<Identity>, StoreError> {
        Err(unavailable())
    }
}

#[tokio::test]
async fn storage_failure_is_retryable_and_private_to_sender() {
    let state = AppState::new(Arc::new(FailingStore), ChatConfig::default());
    let (conn, mut rx) = connect(&state, Identity::anonymous(), "general").await;
    let (_peer, mut rx_peer) = connect(&state, Identity::anonymous(), "general").await;

    process_inbound_text(&state, &conn, &request_text("send_message", json!({"content": "hi", "roomId": "general"})))
        .await;

    let err = recv_frame(&mut rx).await;
    assert_eq!(error_code(&err), Some("E_STORAGE"));
    assert_eq!(err.data["retryable"], json!(true));
    assert_eq!(err.str_field("message"), Some("storage unavailable"));
    assert_no_frame(&mut rx).await;
    assert_no_frame(&mut rx_peer).await;
}

// =============================================================================
// END TO END
// =============================================================================

async fn serve(state: AppState) -> std::net::SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, crate::routes::app(state))
            .await
            .expect("server should run");
    });
    addr
}

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn next_frame(stream: &mut WsStream) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("ws receive timed out")
            .expect("ws stream ended")
            .expect("ws error");
        if let tungstenite::Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).expect("server frames are valid json");
        }
    }
}

#[tokio::test]
async fn end_to_end_anonymous_connect_and_send() {
    let (state, _store) = test_helpers::test_app_state();
    let addr = serve(state).await;

    let (mut stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
        .await
        .expect("ws connect");

    let connected = next_frame(&mut stream).await;
    assert_eq!(connected.syscall, "connected");
    assert_eq!(connected.str_field("username"), Some("Anonymous"));
    assert_eq!(connected.str_field("roomId"), Some("general"));
    assert!(connected.uuid_field("clientId").is_some());

    let req = request_text("send_message", json!({"content": "hello", "roomId": "general"}));
    stream
        .send(tungstenite::Message::text(req))
        .await
        .expect("ws send");

    let delivered = next_frame(&mut stream).await;
    assert_eq!(delivered.syscall, "receive_message");
    assert_eq!(delivered.str_field("content"), Some("hello"));
    let done = next_frame(&mut stream).await;
    assert_eq!(done.status, Status::Done);
    assert_eq!(done.uuid_field("id"), delivered.uuid_field("id"));
}

#[tokio::test]
async fn end_to_end_ticket_sets_identity_and_is_single_use() {
    let config = ChatConfig { allow_anonymous: false, ..ChatConfig::default() };
    let (state, store) = test_helpers::test_app_state_with_config(config);
    let alice = store.upsert_user("alice").await.expect("alice");
    let ticket = session::issue_ws_ticket(store.as_ref(), alice.user_id.expect("id"))
        .await
        .expect("ticket");
    let addr = serve(state).await;

    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
            .await
            .is_err(),
        "anonymous upgrade should be refused"
    );

    let (mut stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?ticket={ticket}"))
        .await
        .expect("ws connect with ticket");
    let connected = next_frame(&mut stream).await;
    assert_eq!(connected.str_field("username"), Some("alice"));
    assert_eq!(connected.uuid_field("userId"), alice.user_id);

    assert!(
        tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws?ticket={ticket}"))
            .await
            .is_err(),
        "tickets are single use"
    );
}

#[tokio::test]
async fn end_to_end_disconnect_announces_room_left() {
    let (state, _store) = test_helpers::test_app_state();
    let (_watcher, mut rx_watcher) = connect(&state, Identity::anonymous(), "general").await;
    let addr = serve(state.clone()).await;

    let (mut stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/api/ws"))
        .await
        .expect("ws connect");
    let connected = next_frame(&mut stream).await;
    let client_id = connected.uuid_field("clientId");

    let joined = recv_frame(&mut rx_watcher).await;
    assert_eq!(joined.syscall, "room_joined");
    assert_eq!(joined.uuid_field("clientId"), client_id);

    stream.close(None).await.expect("close");
    drop(stream);

    let left = recv_frame(&mut rx_watcher).await;
    assert_eq!(left.syscall, "room_left");
    assert_eq!(left.uuid_field("clientId"), client_id);
}

use super::*;
use crate::frame::Frame;
use crate::state::test_helpers;
use crate::store::ChatStore;
use tokio::sync::mpsc;
use tokio::time::{Duration, timeout};

async fn assert_channel_has_frame(rx: &mut mpsc::Receiver<Frame>) -> Frame {
    timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("frame receive timed out")
        .expect("channel closed")
}

async fn assert_channel_empty(rx: &mut mpsc::Receiver<Frame>) {
    assert!(
        timeout(Duration::from_millis(80), rx.recv()).await.is_err(),
        "expected channel to remain empty"
    );
}

#[test]
fn conversation_id_is_order_independent() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let id = conversation_id(a, b);
    assert_eq!(id, conversation_id(b, a));
    assert!(id.starts_with("dm:"));
    assert_eq!(id.len(), 3 + 64);
    assert_ne!(id, conversation_id(a, Uuid::new_v4()));
}

#[tokio::test]
async fn private_message_reaches_only_the_two_parties() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let bob = store.upsert_user("bob").await.expect("bob");
    let (alice_client, mut rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;
    let (_bob_client, mut rx_bob) = test_helpers::connect_client(&state, bob.clone(), "random").await;
    let (_bystander, mut rx_bystander) = test_helpers::connect_client(&state, Identity::anonymous(), "general").await;

    let sent = send_private_message(&state, alice_client, &alice, "bob", "psst")
        .await
        .expect("send");

    let expected_room = conversation_id(
        alice.user_id.expect("alice id"),
        bob.user_id.expect("bob id"),
    );
    assert_eq!(sent.room_id, expected_room);

    for rx in [&mut rx_alice, &mut rx_bob] {
        let frame = assert_channel_has_frame(rx).await;
        assert_eq!(frame.syscall, "receive_private_message");
        assert_eq!(frame.str_field("content"), Some("psst"));
        assert_eq!(frame.str_field("username"), Some("alice"));
        assert_eq!(frame.data["isPrivate"], serde_json::json!(true));
        assert_eq!(frame.str_field("recipientUsername"), Some("bob"));
    }
    assert_channel_empty(&mut rx_bystander).await;
}

#[tokio::test]
async fn offline_recipient_is_rejected_without_persisting() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    store.upsert_user("carol").await.expect("carol");
    let (alice_client, mut rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;

    let err = send_private_message(&state, alice_client, &alice, "carol", "are you there?")
        .await
        .expect_err("carol offline");
    assert!(matches!(err, PrivateError::RecipientOffline));
    assert_eq!(err.to_string(), "recipient not found or offline");
    assert_eq!(store.message_count(), 0);
    assert_channel_empty(&mut rx_alice).await;
}

#[tokio::test]
async fn anonymous_senders_and_self_messages_are_rejected() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let (alice_client, _rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;
    let (anon_client, _rx_anon) = test_helpers::connect_client(&state, Identity::anonymous(), "general").await;

    assert!(matches!(
        send_private_message(&state, anon_client, &Identity::anonymous(), "alice", "hi").await,
        Err(PrivateError::AuthRequired)
    ));
    assert!(matches!(
        send_private_message(&state, alice_client, &alice, "alice", "hi").await,
        Err(PrivateError::SelfMessage)
    ));
    assert!(matches!(
        send_private_message(&state, alice_client, &alice, "bob", "  ").await,
        Err(PrivateError::EmptyContent)
    ));
    assert_eq!(store.message_count(), 0);
}

#[tokio::test]
async fn anonymous_connections_are_not_recipients() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let (alice_client, _rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;
    let (_anon, _rx_anon) = test_helpers::connect_client(&state, Identity::anonymous(), "general").await;

    assert!(matches!(
        send_private_message(&state, alice_client, &alice, "Anonymous", "hi").await,
        Err(PrivateError::RecipientOffline)
    ));
}

#[tokio::test]
async fn history_is_shared_by_both_parties() {
    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let bob = store.upsert_user("bob").await.expect("bob");
    let (alice_client, _rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;
    let (bob_client, _rx_bob) = test_helpers::connect_client(&state, bob.clone(), "general").await;

    send_private_message(&state, alice_client, &alice, "bob", "one")
        .await
        .expect("send");
    send_private_message(&state, bob_client, &bob, "alice", "two")
        .await
        .expect("send");

    let from_alice = private_history(&state, &alice, "bob", None).await.expect("history");
    let from_bob = private_history(&state, &bob, "alice", None).await.expect("history");
    let contents: Vec<_> = from_alice.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, ["one", "two"]);
    assert_eq!(from_alice, from_bob);

    assert!(matches!(
        private_history(&state, &alice, "nobody", None).await,
        Err(PrivateError::UserNotFound(_))
    ));
    assert!(matches!(
        private_history(&state, &Identity::anonymous(), "bob", None).await,
        Err(PrivateError::AuthRequired)
    ));
}

#[tokio::test]
async fn reactions_on_private_messages_stay_between_the_parties() {
    use crate::services::reaction::{ReactionError, add_reaction, remove_reaction};

    let (state, store) = test_helpers::test_app_state();
    let alice = store.upsert_user("alice").await.expect("alice");
    let bob = store.upsert_user("bob").await.expect("bob");
    let carol = store.upsert_user("carol").await.expect("carol");
    let (alice_client, mut rx_alice) = test_helpers::connect_client(&state, alice.clone(), "general").await;
    let (_bob_client, mut rx_bob) = test_helpers::connect_client(&state, bob.clone(), "random").await;
    let (_carol_client, mut rx_carol) = test_helpers::connect_client(&state, carol.clone(), "general").await;

    let sent = send_private_message(&state, alice_client, &alice, "bob", "psst")
        .await
        .expect("send");
    assert_channel_has_frame(&mut rx_alice).await;
    assert_channel_has_frame(&mut rx_bob).await;

    for outsider in [&carol, &Identity::anonymous()] {
        assert!(matches!(
            add_reaction(&state, outsider, sent.id, "👀").await,
            Err(ReactionError::MessageNotFound(_))
        ));
        assert!(matches!(
            remove_reaction(&state, outsider, sent.id, "👀").await,
            Err(ReactionError::MessageNotFound(_))
        ));
    }
    assert_eq!(store.reaction_count(), 0);

    add_reaction(&state, &bob, sent.id, "👍").await.expect("bob reacts");
    for rx in [&mut rx_alice, &mut rx_bob] {
        let frame = assert_channel_has_frame(rx).await;
        assert_eq!(frame.syscall, "reaction_added");
        assert_eq!(frame.data["reaction"]["username"], "bob");
    }

    remove_reaction(&state, &bob, sent.id, "👍").await.expect("bob removes");
    for rx in [&mut rx_alice, &mut rx_bob] {
        assert_eq!(assert_channel_has_frame(rx).await.syscall, "reaction_removed");
    }

    add_reaction(&state, &alice, sent.id, "❤️").await.expect("author reacts");
    assert_eq!(assert_channel_has_frame(&mut rx_bob).await.syscall, "reaction_added");
    assert_channel_has_frame(&mut rx_alice).await;
    assert_channel_empty(&mut rx_carol).await;

    let history = private_history(&state, &bob, "alice", None).await.expect("history");
    let emojis: Vec<_> = history[0].reactions.iter().map(|r| r.emoji.as_str()).collect();
    assert_eq!(emojis, ["❤️"]);
}

#[test]
fn party_check_accepts_only_the_two_users() {
    let a = Uuid::new_v4();
    let b = Uuid::new_v4();
    let room_id = conversation_id(a, b);
    assert!(is_party(&room_id, a, a));
    assert!(is_party(&room_id, a, b));
    assert!(!is_party(&room_id, a, Uuid::new_v4()));
}

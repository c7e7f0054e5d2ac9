use std::time::Duration;

use serde_json::Value;

use duel_peer::{ChatReceivedEvent, PeerJoinedEvent};
use duel_shared::{messages::ChatPayload, Envelope, LocalIdentity, MessageType};
use duel_test::{expect_event, spawn_node, RawPeer};

#[tokio::test]
async fn tampered_payload_is_dropped() {
    let node = spawn_node().await;
    let mut events = node.subscribe();
    let mut raw = RawPeer::connect(&node).await;
    let joined = expect_event!(events, PeerJoinedEvent);
    assert_eq!(&joined.peer, raw.id());

    let original = raw.chat("meet me at the bridge");
    let forged = RawPeer::tamper(&original, |json| {
        json["payload"]["text"] = Value::from("meet me at the cave");
    });
    raw.send_raw(&forged).await;
    raw.send(&raw.chat("genuine")).await;

    let chat = expect_event!(events, ChatReceivedEvent);
    assert_eq!(&chat.from, raw.id());
    assert_eq!(chat.text, "genuine");
}

#[tokio::test]
async fn envelope_signed_by_someone_else_is_dropped() {
    let node = spawn_node().await;
    let mut events = node.subscribe();
    let mut raw = RawPeer::connect(&node).await;

    let impostor = LocalIdentity::generate();
    let payload = ChatPayload {
        text: "not from the link owner".to_string(),
        to: None,
    };
    let relayed = Envelope::seal(&impostor, MessageType::Chat, &payload).unwrap();
    raw.send(&relayed).await;
    raw.send(&raw.chat("from the owner")).await;

    let chat = expect_event!(events, ChatReceivedEvent);
    assert_eq!(chat.text, "from the owner");
}

#[tokio::test]
async fn replayed_and_stale_envelopes_are_dropped() {
    let node = spawn_node().await;
    let mut events = node.subscribe();
    let mut raw = RawPeer::connect(&node).await;

    let first = raw.chat("one");
    raw.send(&first).await;
    raw.send(&first).await;
    let stale = raw.stale_chat("from last week", Duration::from_secs(7 * 24 * 3600));
    raw.send(&stale).await;
    raw.send(&raw.chat("two")).await;

    let chat = expect_event!(events, ChatReceivedEvent);
    assert_eq!(chat.text, "one");
    let chat = expect_event!(events, ChatReceivedEvent);
    assert_eq!(chat.text, "two");
}

#[tokio::test]
async fn malformed_frame_does_not_break_the_link() {
    let node = spawn_node().await;
    let mut events = node.subscribe();
    let mut raw = RawPeer::connect(&node).await;

    raw.send_raw(b"definitely not an envelope").await;
    raw.send(&raw.chat("still here")).await;

    let chat = expect_event!(events, ChatReceivedEvent);
    assert_eq!(chat.text, "still here");
    assert!(node.connected_peers().contains(raw.id()));
}

#[tokio::test]
async fn handshake_for_another_network_is_refused() {
    let node = spawn_node().await;
    let mut raw = RawPeer::connect_as(&node, LocalIdentity::generate(), "elsewhere").await;

    assert!(raw.receive().await.is_none());
    assert!(node.peers().is_empty());
}

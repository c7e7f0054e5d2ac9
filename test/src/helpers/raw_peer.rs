use std::{net::SocketAddr, time::Duration};

use serde_json::Value;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

use duel_peer::Node;
use duel_shared::{
    decode_envelope, encode_frame, frame_length,
    messages::{ChatPayload, HandshakePayload},
    Envelope, LocalIdentity, MessageType, PeerId, Timestamp, FRAME_HEADER_SIZE,
};

use crate::test_node::NETWORK_ID;

const MAX_FRAME: usize = 1024 * 1024;

/// A hand-driven peer speaking the stream protocol directly, for feeding a
/// node envelopes a well-behaved peer would never send
pub struct RawPeer {
    identity: LocalIdentity,
    stream: TcpStream,
    /// The node's handshake envelope
    pub greeting: Envelope,
}

impl RawPeer {
    /// Dials `node` and completes the handshake
    pub async fn connect(node: &Node) -> Self {
        Self::connect_as(node, LocalIdentity::generate(), NETWORK_ID).await
    }

    pub async fn connect_as(node: &Node, identity: LocalIdentity, network_id: &str) -> Self {
        let mut stream = TcpStream::connect(node.local_address())
            .await
            .expect("node accepts connections");
        let hello = HandshakePayload {
            network_id: network_id.to_string(),
            public_key: identity.peer_id().clone(),
            address: SocketAddr::from(([127, 0, 0, 1], 9)),
            capabilities: Vec::new(),
        };
        let envelope =
            Envelope::seal(&identity, MessageType::Handshake, &hello).expect("handshake seals");
        let frame = encode_frame(&envelope, MAX_FRAME).expect("handshake frames");
        stream.write_all(&frame).await.expect("handshake written");

        let body = read_body(&mut stream).await.expect("node answers the handshake");
        let greeting = decode_envelope(&body).expect("node handshake decodes");
        Self {
            identity,
            stream,
            greeting,
        }
    }

    pub fn id(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub fn chat(&self, text: &str) -> Envelope {
        let payload = ChatPayload {
            text: text.to_string(),
            to: None,
        };
        Envelope::seal(&self.identity, MessageType::Chat, &payload).expect("chat seals")
    }

    /// A chat envelope stamped `age` in the past
    pub fn stale_chat(&self, text: &str, age: Duration) -> Envelope {
        let payload = serde_json::json!({ "text": text });
        let timestamp = Timestamp::now().saturating_sub(age.as_millis() as u64);
        Envelope::seal_value(
            &self.identity,
            MessageType::Chat,
            payload,
            self.identity.next_sequence(),
            timestamp,
        )
        .expect("chat seals")
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        let frame = encode_frame(envelope, MAX_FRAME).expect("envelope frames");
        self.stream.write_all(&frame).await.expect("frame written");
    }

    /// Writes `body` as one frame without any checks
    pub async fn send_raw(&mut self, body: &[u8]) {
        let length = u32::try_from(body.len()).expect("body fits a frame");
        self.stream
            .write_all(&length.to_be_bytes())
            .await
            .expect("header written");
        self.stream.write_all(body).await.expect("body written");
    }

    /// `envelope` with `edit` applied to its JSON after signing
    pub fn tamper(envelope: &Envelope, edit: impl FnOnce(&mut Value)) -> Vec<u8> {
        let json = envelope.to_json().expect("envelope serializes");
        let mut value: Value = serde_json::from_slice(&json).expect("envelope is json");
        edit(&mut value);
        serde_json::to_vec(&value).expect("edited envelope serializes")
    }

    /// Next envelope the node sends, or `None` once it closes the stream
    pub async fn receive(&mut self) -> Option<Envelope> {
        let body = read_body(&mut self.stream).await?;
        decode_envelope(&body).ok()
    }
}

async fn read_body(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let length = frame_length(header, MAX_FRAME).ok()?;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await.ok()?;
    Some(body)
}

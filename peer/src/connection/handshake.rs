use std::net::SocketAddr;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use duel_shared::{
    decode_envelope, encode_frame, messages::HandshakePayload, CodecError, Envelope,
    LocalIdentity, MessageType, NetworkConfig, PeerId,
};

use crate::error::PeerError;

use super::link::read_frame;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    #[error(transparent)]
    Transport(#[from] PeerError),

    #[error("Stream closed before the handshake completed")]
    Closed,

    #[error("Handshake timed out")]
    Timeout,

    #[error("First envelope was not a handshake")]
    NotHandshake,

    #[error("Handshake signature did not verify")]
    BadSignature,

    #[error("Handshake sender does not match its announced key")]
    KeyMismatch,

    #[error("Peer is on network '{theirs}', expected '{ours}'")]
    NetworkMismatch { ours: String, theirs: String },

    #[error("Expected peer {expected:?}, got {actual:?}")]
    UnexpectedPeer { expected: PeerId, actual: PeerId },

    #[error("Handshake refused by the local registry")]
    Refused,
}

impl From<CodecError> for HandshakeError {
    fn from(err: CodecError) -> Self {
        HandshakeError::Transport(PeerError::Codec(err))
    }
}

/// A peer's verified handshake
#[derive(Debug)]
pub(crate) struct Greeting {
    pub envelope: Envelope,
    pub payload: HandshakePayload,
}

/// Sends the local handshake, then reads and checks the remote one.
///
/// Both sides write first, so neither waits on the other. `expected` is the
/// peer the dialer meant to reach.
pub(crate) async fn exchange<S>(
    stream: &mut S,
    identity: &LocalIdentity,
    network: &NetworkConfig,
    advertised: SocketAddr,
    expected: Option<&PeerId>,
) -> Result<Greeting, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello = HandshakePayload {
        network_id: network.network_id.clone(),
        public_key: identity.peer_id().clone(),
        address: advertised,
        capabilities: network.capabilities(),
    };
    let envelope = Envelope::seal(identity, MessageType::Handshake, &hello)?;
    let frame = encode_frame(&envelope, network.max_frame_size)?;
    stream
        .write_all(&frame)
        .await
        .map_err(|err| PeerError::io("writing handshake", err))?;

    let body = read_frame(stream, network.max_frame_size)
        .await?
        .ok_or(HandshakeError::Closed)?;
    let envelope = decode_envelope(&body)?;
    let greeting = check(envelope, network)?;

    if let Some(expected) = expected {
        if &greeting.payload.public_key != expected {
            return Err(HandshakeError::UnexpectedPeer {
                expected: expected.clone(),
                actual: greeting.payload.public_key,
            });
        }
    }
    Ok(greeting)
}

fn check(envelope: Envelope, network: &NetworkConfig) -> Result<Greeting, HandshakeError> {
    if envelope.message_type() != MessageType::Handshake {
        return Err(HandshakeError::NotHandshake);
    }
    let payload: HandshakePayload = envelope.open(MessageType::Handshake)?;
    if envelope.sender_id() != &payload.public_key {
        return Err(HandshakeError::KeyMismatch);
    }
    if !envelope.verify_signature() {
        return Err(HandshakeError::BadSignature);
    }
    if payload.network_id != network.network_id {
        return Err(HandshakeError::NetworkMismatch {
            ours: network.network_id.clone(),
            theirs: payload.network_id,
        });
    }
    Ok(Greeting { envelope, payload })
}

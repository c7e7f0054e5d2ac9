use std::{
    fmt,
    net::SocketAddr,
    sync::atomic::{AtomicU64, Ordering},
};

use ed25519_dalek::{
    Signature, Signer, SigningKey, Verifier, VerifyingKey, PUBLIC_KEY_LENGTH, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Identity of a peer on the wire: lowercase hex of its Ed25519 verifying key.
///
/// Because the id *is* the key, it is self-certifying, and its string order is
/// the order every participant independently uses to fix battle turn order.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn from_key(key: &VerifyingKey) -> Self {
        Self(hex::encode(key.as_bytes()))
    }

    /// Parses and validates a hex-encoded verifying key
    pub fn parse(text: &str) -> Result<Self, CodecError> {
        let id = Self(text.to_ascii_lowercase());
        id.verifying_key()?;
        Ok(id)
    }

    /// Decodes the verifying key this id stands for
    pub fn verifying_key(&self) -> Result<VerifyingKey, CodecError> {
        let bytes = hex::decode(&self.0).map_err(|_| CodecError::InvalidHex { what: "peer id" })?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            bytes
                .as_slice()
                .try_into()
                .map_err(|_| CodecError::InvalidKeyMaterial {
                    what: "public key",
                    expected: PUBLIC_KEY_LENGTH,
                    actual: bytes.len(),
                })?;
        VerifyingKey::from_bytes(&bytes).map_err(|_| CodecError::InvalidKeyMaterial {
            what: "public key",
            expected: PUBLIC_KEY_LENGTH,
            actual: PUBLIC_KEY_LENGTH,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight hex characters, for log lines
    pub fn short(&self) -> &str {
        let end = self.0.len().min(8);
        &self.0[..end]
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Signs `message` with `key`, returning the raw 64-byte signature
pub fn sign(message: &[u8], key: &SigningKey) -> Vec<u8> {
    key.sign(message).to_bytes().to_vec()
}

/// Checks a raw signature. Any malformed input is a failed verification.
pub fn verify_signature(message: &[u8], signature: &[u8], key: &VerifyingKey) -> bool {
    let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&bytes);
    key.verify(message, &signature).is_ok()
}

/// The local node's signing identity.
///
/// Owns the secret key and the per-identity sequence counter stamped into
/// every outgoing envelope.
pub struct LocalIdentity {
    signing_key: SigningKey,
    peer_id: PeerId,
    sequence: AtomicU64,
}

impl LocalIdentity {
    /// Generates a fresh identity from the operating system RNG
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_secret_bytes(secret: &[u8; SECRET_KEY_LENGTH]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(secret))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_key(&signing_key.verifying_key());
        Self {
            signing_key,
            peer_id,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Next value of the strictly increasing envelope sequence, starting at 1
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        sign(message, &self.signing_key)
    }
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("peer_id", &self.peer_id)
            .finish_non_exhaustive()
    }
}

/// What this node knows about a remote peer.
///
/// Created from the first discovery packet or handshake, refreshed on every
/// verified message.
#[derive(Clone, Debug, PartialEq)]
pub struct PeerIdentity {
    pub peer_id: PeerId,
    pub public_key: VerifyingKey,
    pub network_id: String,
    pub address: SocketAddr,
    /// Wall-clock milliseconds of the last verified message
    pub last_seen: u64,
    pub capabilities: Vec<String>,
}

impl PeerIdentity {
    pub fn new(
        peer_id: PeerId,
        network_id: &str,
        address: SocketAddr,
        last_seen: u64,
    ) -> Result<Self, CodecError> {
        let public_key = peer_id.verifying_key()?;
        Ok(Self {
            peer_id,
            public_key,
            network_id: network_id.to_string(),
            address,
            last_seen,
            capabilities: Vec::new(),
        })
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn is_bot(&self) -> bool {
        self.capabilities.iter().any(|c| c == crate::BOT_CAPABILITY)
    }
}

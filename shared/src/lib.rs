//! # Duel Shared
//! Identity, signed envelopes, framing, payload types, configuration and the
//! deterministic battle rules shared by every duel peer.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

mod backends;
mod codec;
mod config;
mod envelope;
mod error;
mod identity;
mod key_ring;

pub mod battle;
pub mod messages;

pub use backends::{Timer, Timestamp};
pub use codec::{
    decode_discovery, decode_envelope, encode_discovery, encode_frame, frame_length,
    FrameDecoder, FRAME_HEADER_SIZE, MAX_DISCOVERY_PACKET_SIZE,
};
pub use config::{
    validate_network_id, BattleConfig, GroupConfig, NetworkConfig, NodeConfig, ReconnectConfig,
    SyncConfig, BOT_CAPABILITY, MAX_PEERS_LIMIT, MIN_DISCOVERY_PORT,
};
pub use envelope::{signing_bytes, Envelope, MessageType};
pub use error::{CodecError, ConfigError};
pub use identity::{sign, verify_signature, LocalIdentity, PeerId, PeerIdentity};
pub use key_ring::{KeyRing, VerifyRejection};

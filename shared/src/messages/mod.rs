//! Typed payloads carried inside envelopes and discovery datagrams.

mod battle;
mod chat;
mod discovery;
mod group;
mod handshake;
mod state;

pub use battle::{
    AbortReason, BattleAbortPayload, BattleAcceptPayload, BattleActionPayload,
    BattleInvitePayload, ResultSummary, SessionId,
};
pub use chat::ChatPayload;
pub use discovery::{DiscoveryPacket, DiscoveryTag};
pub use group::{
    CeremonyId, CeremonyKind, CeremonyPhase, CeremonyState, GroupEventPayload, PhaseChoice,
};
pub use handshake::HandshakePayload;
pub use state::{CharacterFields, CharacterStateSnapshot, Position};

use std::net::SocketAddr;

/// Address to dial for a peer that announced `announced` from `source`: an
/// unspecified announced IP (`0.0.0.0`) is replaced by the source IP
pub fn resolve_announced_address(announced: SocketAddr, source: SocketAddr) -> SocketAddr {
    if announced.ip().is_unspecified() {
        SocketAddr::new(source.ip(), announced.port())
    } else {
        announced
    }
}

/// 64 random bits rendered as 16 hex characters
pub(crate) fn random_id() -> String {
    format!("{:016x}", fastrand::u64(..))
}

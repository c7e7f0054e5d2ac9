//! Authenticated stream links between peers.

mod handshake;
mod link;
mod manager;

pub use handshake::HandshakeError;
pub(crate) use manager::ConnectionManager;

use duel_shared::{Envelope, PeerId};

/// What the connection layer hands to the node's dispatcher
#[derive(Debug)]
pub(crate) enum Inbound {
    /// Handshake completed, link is live
    Joined(PeerId),
    /// Link dropped; recovery has started
    Lost(PeerId),
    /// Recovery gave up, peer removed from the registry
    Left(PeerId),
    /// A verified envelope from a live link
    Envelope(Envelope),
}

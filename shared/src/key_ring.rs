use std::{collections::HashMap, time::Duration};

use log::{debug, trace};
use thiserror::Error;

use crate::{
    backends::Timestamp,
    envelope::Envelope,
    identity::{PeerId, PeerIdentity},
};

/// Why an envelope was refused by the [`KeyRing`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerifyRejection {
    #[error("Sender {sender:?} is not a known peer")]
    UnknownSender { sender: PeerId },

    #[error("Signature does not match envelope contents")]
    InvalidSignature,

    #[error("Sequence {sequence} is not greater than last accepted {last}")]
    Replay { sequence: u64, last: u64 },

    #[error("Envelope is {age_ms} ms old")]
    Stale { age_ms: u64 },

    #[error("Envelope timestamp is {ahead_ms} ms in the future")]
    FromFuture { ahead_ms: u64 },
}

#[derive(Debug, Clone)]
struct KnownPeer {
    identity: PeerIdentity,
    last_sequence: u64,
    /// Timestamp of the newest accepted envelope
    last_timestamp: u64,
}

/// The set of identities this node has seen and will accept envelopes from.
///
/// Verification here is stricter than [`Envelope::verify_signature`]: the
/// sender must be known, the sequence must advance and the timestamp must be
/// within the freshness window.
#[derive(Debug)]
pub struct KeyRing {
    peers: HashMap<PeerId, KnownPeer>,
    max_message_age: Duration,
    max_clock_skew: Duration,
}

impl KeyRing {
    pub fn new(max_message_age: Duration, max_clock_skew: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            max_message_age,
            max_clock_skew,
        }
    }

    /// Adds or refreshes an identity. Returns true if it was not known before.
    ///
    /// Refreshing keeps the replay watermark.
    pub fn insert(&mut self, identity: PeerIdentity) -> bool {
        match self.peers.get_mut(&identity.peer_id) {
            Some(known) => {
                known.identity.address = identity.address;
                known.identity.capabilities = identity.capabilities;
                known.identity.last_seen = known.identity.last_seen.max(identity.last_seen);
                false
            }
            None => {
                self.peers.insert(
                    identity.peer_id.clone(),
                    KnownPeer {
                        identity,
                        last_sequence: 0,
                        last_timestamp: 0,
                    },
                );
                true
            }
        }
    }

    pub fn remove(&mut self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.peers.remove(peer_id).map(|known| known.identity)
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<&PeerIdentity> {
        self.peers.get(peer_id).map(|known| &known.identity)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn identities(&self) -> impl Iterator<Item = &PeerIdentity> {
        self.peers.values().map(|known| &known.identity)
    }

    /// Marks a peer as seen at `now` without a signed envelope (discovery)
    pub fn touch(&mut self, peer_id: &PeerId, now: u64) {
        if let Some(known) = self.peers.get_mut(peer_id) {
            known.identity.last_seen = known.identity.last_seen.max(now);
        }
    }

    /// Peers not seen since `cutoff` (wall-clock ms)
    pub fn silent_since(&self, cutoff: u64) -> Vec<PeerId> {
        self.peers
            .values()
            .filter(|known| known.identity.last_seen < cutoff)
            .map(|known| known.identity.peer_id.clone())
            .collect()
    }

    /// Fail-closed verification against the current clock
    pub fn verify(&mut self, envelope: &Envelope) -> bool {
        self.check(envelope, Timestamp::now()).is_ok()
    }

    /// Verifies `envelope` as of wall-clock `now`; on success records its
    /// sequence and refreshes the sender's last-seen time
    pub fn check(&mut self, envelope: &Envelope, now: u64) -> Result<(), VerifyRejection> {
        self.check_with(envelope, now, false)
    }

    /// Verifies the handshake opening a new link. A peer restarted with a
    /// persisted key counts its sequence from 1 again, so a lower sequence
    /// starts a new watermark when the envelope is newer than anything
    /// accepted from that peer so far.
    pub fn check_handshake(&mut self, envelope: &Envelope, now: u64) -> Result<(), VerifyRejection> {
        self.check_with(envelope, now, true)
    }

    fn check_with(
        &mut self,
        envelope: &Envelope,
        now: u64,
        restart: bool,
    ) -> Result<(), VerifyRejection> {
        let sender = envelope.sender_id();
        let Some(known) = self.peers.get_mut(sender) else {
            return Err(VerifyRejection::UnknownSender {
                sender: sender.clone(),
            });
        };

        if !envelope.verify_signature() {
            return Err(VerifyRejection::InvalidSignature);
        }

        let restarted = restart && envelope.timestamp() > known.last_timestamp;
        if envelope.sequence() <= known.last_sequence && !restarted {
            return Err(VerifyRejection::Replay {
                sequence: envelope.sequence(),
                last: known.last_sequence,
            });
        }

        let timestamp = envelope.timestamp();
        if now > timestamp {
            let age_ms = now - timestamp;
            if age_ms > self.max_message_age.as_millis() as u64 {
                return Err(VerifyRejection::Stale { age_ms });
            }
        } else {
            let ahead_ms = timestamp - now;
            if ahead_ms > self.max_clock_skew.as_millis() as u64 {
                return Err(VerifyRejection::FromFuture { ahead_ms });
            }
        }

        trace!(
            "accepted {} #{} from {}",
            envelope.message_type().as_str(),
            envelope.sequence(),
            sender.short()
        );
        if envelope.sequence() <= known.last_sequence {
            debug!(
                "{} restarted its sequence at {}",
                sender.short(),
                envelope.sequence()
            );
        }
        known.last_sequence = envelope.sequence();
        known.last_timestamp = known.last_timestamp.max(timestamp);
        known.identity.last_seen = known.identity.last_seen.max(now);
        Ok(())
    }
}

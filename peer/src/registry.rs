use std::{collections::HashMap, net::SocketAddr, time::Duration};

use log::debug;
use parking_lot::RwLock;

use duel_shared::{Envelope, KeyRing, PeerId, PeerIdentity, Timestamp, VerifyRejection};

/// Per-peer connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Known from discovery, no link yet
    Disconnected,
    Connecting,
    Connected,
    /// Link lost, waiting for it to be re-established
    Reconnecting,
    Abandoned,
}

/// Public view of a registry entry
#[derive(Clone, Debug, PartialEq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub address: SocketAddr,
    pub state: ConnectionState,
    pub capabilities: Vec<String>,
    pub last_seen: u64,
}

impl PeerInfo {
    pub fn is_bot(&self) -> bool {
        self.capabilities
            .iter()
            .any(|c| c == duel_shared::BOT_CAPABILITY)
    }
}

/// Outcome of offering an identity to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    Refreshed,
    Full,
}

#[derive(Debug)]
struct PeerRecord {
    state: ConnectionState,
    /// Id of the live link, if any
    link: Option<u64>,
    /// Whether the peer has ever completed a handshake
    was_connected: bool,
    /// Bumped on every completed handshake
    generation: u64,
}

struct RegistryInner {
    key_ring: KeyRing,
    records: HashMap<PeerId, PeerRecord>,
}

/// Discovered and connected peers, shared by discovery and the connection
/// manager. All access goes through locked accessors.
pub struct PeerRegistry {
    local: PeerId,
    max_peers: usize,
    inner: RwLock<RegistryInner>,
}

impl PeerRegistry {
    pub fn new(
        local: PeerId,
        max_peers: usize,
        max_message_age: Duration,
        max_clock_skew: Duration,
    ) -> Self {
        Self {
            local,
            max_peers,
            inner: RwLock::new(RegistryInner {
                key_ring: KeyRing::new(max_message_age, max_clock_skew),
                records: HashMap::new(),
            }),
        }
    }

    pub fn local(&self) -> &PeerId {
        &self.local
    }

    /// Adds a new identity or refreshes a known one, respecting `max_peers`
    pub fn admit(&self, identity: PeerIdentity) -> Admission {
        let mut inner = self.inner.write();
        if inner.key_ring.contains(&identity.peer_id) {
            inner.key_ring.insert(identity);
            return Admission::Refreshed;
        }
        if inner.records.len() >= self.max_peers {
            return Admission::Full;
        }
        let peer_id = identity.peer_id.clone();
        inner.key_ring.insert(identity);
        inner.records.insert(
            peer_id,
            PeerRecord {
                state: ConnectionState::Disconnected,
                link: None,
                was_connected: false,
                generation: 0,
            },
        );
        Admission::Admitted
    }

    /// Fail-closed verification through the key ring
    pub fn verify(&self, envelope: &Envelope) -> Result<(), VerifyRejection> {
        self.inner.write().key_ring.check(envelope, Timestamp::now())
    }

    /// Verifies the handshake of a new link. Without a live link the peer
    /// may have restarted, so its sequence is allowed to start over.
    pub fn verify_handshake(&self, envelope: &Envelope) -> Result<(), VerifyRejection> {
        let mut inner = self.inner.write();
        let linked = inner
            .records
            .get(envelope.sender_id())
            .is_some_and(|record| record.link.is_some());
        if linked {
            inner.key_ring.check(envelope, Timestamp::now())
        } else {
            inner.key_ring.check_handshake(envelope, Timestamp::now())
        }
    }

    pub fn touch(&self, peer_id: &PeerId) {
        self.inner.write().key_ring.touch(peer_id, Timestamp::now());
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.inner.read().records.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self, peer_id: &PeerId) -> Option<ConnectionState> {
        self.inner.read().records.get(peer_id).map(|r| r.state)
    }

    pub fn identity(&self, peer_id: &PeerId) -> Option<PeerIdentity> {
        self.inner.read().key_ring.get(peer_id).cloned()
    }

    pub fn is_connected(&self, peer_id: &PeerId) -> bool {
        self.state(peer_id) == Some(ConnectionState::Connected)
    }

    /// Number of handshakes completed with the peer so far
    pub fn generation(&self, peer_id: &PeerId) -> Option<u64> {
        self.inner.read().records.get(peer_id).map(|r| r.generation)
    }

    /// Moves a peer into `Connecting` unless a link exists or is being made
    pub fn begin_connect(&self, peer_id: &PeerId) -> bool {
        let mut inner = self.inner.write();
        match inner.records.get_mut(peer_id) {
            Some(record)
                if matches!(
                    record.state,
                    ConnectionState::Disconnected | ConnectionState::Reconnecting
                ) =>
            {
                record.state = ConnectionState::Connecting;
                true
            }
            _ => false,
        }
    }

    /// Records a live link. Fails if another link is already live.
    pub fn mark_connected(&self, peer_id: &PeerId, link: u64) -> bool {
        let mut inner = self.inner.write();
        let Some(record) = inner.records.get_mut(peer_id) else {
            return false;
        };
        if record.state == ConnectionState::Connected {
            return false;
        }
        record.state = ConnectionState::Connected;
        record.link = Some(link);
        record.was_connected = true;
        record.generation += 1;
        true
    }

    /// Marks the peer `Reconnecting` if `link` is still its live link
    pub fn mark_lost(&self, peer_id: &PeerId, link: u64) -> bool {
        let mut inner = self.inner.write();
        match inner.records.get_mut(peer_id) {
            Some(record) if record.link == Some(link) => {
                record.state = ConnectionState::Reconnecting;
                record.link = None;
                true
            }
            _ => false,
        }
    }

    /// Returns a failed connection attempt to the state it came from
    pub fn connect_failed(&self, peer_id: &PeerId) {
        let mut inner = self.inner.write();
        if let Some(record) = inner.records.get_mut(peer_id) {
            if record.state == ConnectionState::Connecting {
                record.state = if record.was_connected {
                    ConnectionState::Reconnecting
                } else {
                    ConnectionState::Disconnected
                };
            }
        }
    }

    /// Removes an unreachable peer. Returns whether it had ever been
    /// connected, i.e. whether its departure is news to subscribers.
    pub fn abandon(&self, peer_id: &PeerId) -> Option<bool> {
        let mut inner = self.inner.write();
        let record = inner.records.remove(peer_id)?;
        inner.key_ring.remove(peer_id);
        debug!("abandoned peer {} in state {:?}", peer_id.short(), record.state);
        Some(record.was_connected)
    }

    pub fn connected(&self) -> Vec<PeerId> {
        self.inner
            .read()
            .records
            .iter()
            .filter(|(_, r)| r.state == ConnectionState::Connected)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn peers(&self) -> Vec<PeerInfo> {
        let inner = self.inner.read();
        let mut peers: Vec<PeerInfo> = inner
            .records
            .iter()
            .filter_map(|(id, record)| {
                inner.key_ring.get(id).map(|identity| PeerInfo {
                    peer_id: id.clone(),
                    address: identity.address,
                    state: record.state,
                    capabilities: identity.capabilities.clone(),
                    last_seen: identity.last_seen,
                })
            })
            .collect();
        peers.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        peers
    }

    /// Forgets discovered peers that never got a link and have been silent
    /// since `cutoff` (wall-clock ms)
    pub fn purge_silent(&self, cutoff: u64) -> Vec<PeerId> {
        let mut inner = self.inner.write();
        let silent = inner.key_ring.silent_since(cutoff);
        let mut purged = Vec::new();
        for peer_id in silent {
            let idle = inner
                .records
                .get(&peer_id)
                .is_some_and(|r| r.state == ConnectionState::Disconnected);
            if idle {
                inner.records.remove(&peer_id);
                inner.key_ring.remove(&peer_id);
                purged.push(peer_id);
            }
        }
        purged
    }
}

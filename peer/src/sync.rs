use std::{collections::HashMap, time::Instant};

use log::{debug, trace};

use duel_shared::{
    messages::{CharacterFields, CharacterStateSnapshot},
    MessageType, PeerId, SyncConfig, Timer, Timestamp,
};

use crate::{events::PeerEvent, outbox::Outbox};

/// Result of offering a remote snapshot to the mirror
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Older than (or equal to) the cached copy, discarded
    Superseded,
    /// Snapshot owner differs from the envelope sender, discarded
    OwnerMismatch,
}

/// Holds the local character summary and a read-only mirror of every
/// connected peer's, merged last-write-wins by version then timestamp.
pub struct StateSynchronizer {
    local: PeerId,
    fields: CharacterFields,
    version: u64,
    timestamp: u64,
    mirror: HashMap<PeerId, CharacterStateSnapshot>,
    rebroadcast: Timer,
}

impl StateSynchronizer {
    pub fn new(local: PeerId, config: &SyncConfig, now: Instant) -> Self {
        Self {
            local,
            fields: CharacterFields::default(),
            version: 1,
            timestamp: Timestamp::now(),
            mirror: HashMap::new(),
            rebroadcast: Timer::new_at(config.sync_interval, now),
        }
    }

    pub fn local_snapshot(&self) -> CharacterStateSnapshot {
        CharacterStateSnapshot::new(self.local.clone(), &self.fields, self.version, self.timestamp)
    }

    /// Replaces the local fields. A change bumps the version and is
    /// broadcast right away; an identical update does nothing.
    pub fn update_local(
        &mut self,
        fields: CharacterFields,
        now: Instant,
        outbox: &mut Outbox,
    ) -> Option<CharacterStateSnapshot> {
        if fields == self.fields {
            return None;
        }
        self.fields = fields;
        self.version += 1;
        self.timestamp = Timestamp::now().max(self.timestamp + 1);

        let snapshot = self.local_snapshot();
        outbox.broadcast(MessageType::StateSync, &snapshot);
        self.rebroadcast.reset_at(now);
        Some(snapshot)
    }

    /// Sends the current snapshot to a peer that just connected
    pub fn greet(&self, peer: &PeerId, outbox: &mut Outbox) {
        outbox.send(vec![peer.clone()], MessageType::StateSync, &self.local_snapshot());
    }

    /// Periodic full re-broadcast
    pub fn tick(&mut self, now: Instant, outbox: &mut Outbox) {
        if self.rebroadcast.ringing_at(now) {
            outbox.broadcast(MessageType::StateSync, &self.local_snapshot());
            self.rebroadcast.reset_at(now);
        }
    }

    pub fn apply_remote(
        &mut self,
        sender: &PeerId,
        snapshot: CharacterStateSnapshot,
        outbox: &mut Outbox,
    ) -> SyncOutcome {
        if &snapshot.owner != sender {
            debug!(
                "{} sent a snapshot owned by {}, discarding",
                sender.short(),
                snapshot.owner.short()
            );
            return SyncOutcome::OwnerMismatch;
        }
        if let Some(current) = self.mirror.get(sender) {
            if !snapshot.supersedes(current) {
                trace!(
                    "stale snapshot v{} from {} (have v{})",
                    snapshot.version,
                    sender.short(),
                    current.version
                );
                return SyncOutcome::Superseded;
            }
        }

        self.mirror.insert(sender.clone(), snapshot.clone());
        outbox.emit(PeerEvent::StateUpdated(snapshot));
        SyncOutcome::Applied
    }

    pub fn snapshot(&self, peer: &PeerId) -> Option<&CharacterStateSnapshot> {
        self.mirror.get(peer)
    }

    pub fn evict(&mut self, peer: &PeerId) -> Option<CharacterStateSnapshot> {
        self.mirror.remove(peer)
    }
}

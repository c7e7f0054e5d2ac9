//! # Duel Peer
//! A serverless peer for turn-based battles: finds other peers on the local
//! network, keeps signed TCP links to them, mirrors their character state,
//! runs group ceremonies and arbitrates battles that every participant
//! replays identically.

#![deny(
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces
)]

pub mod shared {
    pub use duel_shared::{
        battle, messages, BattleConfig, GroupConfig, LocalIdentity, MessageType, NetworkConfig,
        NodeConfig, PeerId, ReconnectConfig, SyncConfig,
    };
}

mod backoff;
mod battle;
mod connection;
mod discovery;
mod error;
mod events;
mod group;
mod node;
mod outbox;
mod registry;
mod sync;

pub use backoff::Backoff;
pub use battle::{
    ActionRequest, BattleCoordinator, MAX_BATTLE_PARTICIPANTS, MIN_BATTLE_PARTICIPANTS,
};
pub use connection::HandshakeError;
pub use discovery::{Discovery, DiscoveryOutcome, IgnoreReason};
pub use error::{BattleError, GroupError, PeerError};
pub use events::{
    ActionAppliedEvent, AppliedAction, BattleAbortedEvent, BattleInvitation, BattleInvitedEvent,
    BattleResolvedEvent, BattleStart, BattleStartedEvent, ChatMessage, ChatReceivedEvent, Event,
    EventBus, EventSubscription, Events, FairnessRejectedEvent, FairnessRejection,
    GroupEventTriggeredEvent, GroupInvitation, GroupInvitedEvent, GroupOutcome,
    GroupPhaseOpenedEvent, PeerDisconnectedEvent, PeerEvent, PeerJoined, PeerJoinedEvent,
    PeerLeftEvent, PhaseOpening, PhaseSummary, StateUpdatedEvent, TurnStart, TurnStartedEvent,
};
pub use group::{CompletedCeremony, GroupCoordinator};
pub use node::Node;
pub use outbox::{Outbox, Outgoing, Recipients};
pub use registry::{Admission, ConnectionState, PeerInfo, PeerRegistry};
pub use sync::{StateSynchronizer, SyncOutcome};

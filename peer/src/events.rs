use std::{collections::BTreeMap, mem, net::SocketAddr, time::Duration, vec::IntoIter};

use log::warn;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

use duel_shared::{
    battle::{FairnessViolation, LoggedAction},
    messages::{
        BattleAbortPayload, CeremonyId, CeremonyKind, CeremonyState, CharacterStateSnapshot,
        PhaseChoice, ResultSummary, SessionId,
    },
    PeerId,
};

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone, Debug, PartialEq)]
pub struct PeerJoined {
    pub peer: PeerId,
    pub address: SocketAddr,
    pub bot: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatMessage {
    pub from: PeerId,
    pub text: String,
    /// Addressed to the local peer only
    pub direct: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BattleInvitation {
    pub session_id: SessionId,
    pub from: PeerId,
    pub participants: Vec<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BattleStart {
    pub session_id: SessionId,
    pub order: Vec<PeerId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnStart {
    pub session_id: SessionId,
    pub turn: u64,
    pub actor: PeerId,
    /// How long the actor may still submit
    pub time_left: Duration,
}

#[derive(Clone, Debug, PartialEq)]
pub struct AppliedAction {
    pub session_id: SessionId,
    pub entry: LoggedAction,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FairnessRejection {
    pub session_id: SessionId,
    pub actor: PeerId,
    pub turn: u64,
    pub violation: FairnessViolation,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInvitation {
    pub ceremony_id: CeremonyId,
    pub from: PeerId,
    pub kind: CeremonyKind,
    pub activity: String,
    pub invitees: Vec<PeerId>,
    pub time_left: Duration,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupOutcome {
    pub ceremony_id: CeremonyId,
    pub kind: CeremonyKind,
    pub activity: String,
    pub state: CeremonyState,
    /// Initiator plus every invitee that accepted
    pub participants: Vec<PeerId>,
    /// Set when a phase closed; `state` is then the phase's own
    pub phase: Option<PhaseSummary>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseSummary {
    pub index: usize,
    pub name: String,
    /// Votes per choice id
    pub tally: BTreeMap<String, usize>,
    /// Running points per participant
    pub scores: BTreeMap<PeerId, i64>,
    /// No phase follows this one
    pub last: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhaseOpening {
    pub ceremony_id: CeremonyId,
    pub activity: String,
    pub index: usize,
    pub name: String,
    pub choices: Vec<PhaseChoice>,
    pub time_left: Duration,
}

/// Everything a node reports to the presentation layer
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    PeerJoined(PeerJoined),
    PeerLeft(PeerId),
    /// Link lost; the peer may still come back before it is abandoned
    PeerDisconnected(PeerId),
    StateUpdated(CharacterStateSnapshot),
    ChatReceived(ChatMessage),
    BattleInvited(BattleInvitation),
    BattleStarted(BattleStart),
    TurnStarted(TurnStart),
    ActionApplied(AppliedAction),
    FairnessRejected(FairnessRejection),
    BattleResolved(ResultSummary),
    BattleAborted(BattleAbortPayload),
    GroupInvited(GroupInvitation),
    GroupEventTriggered(GroupOutcome),
    GroupPhaseOpened(PhaseOpening),
}

/// A batch of events drained from a subscription, read by kind
pub struct Events {
    queue: Vec<PeerEvent>,
}

impl Events {
    pub(crate) fn new(queue: Vec<PeerEvent>) -> Self {
        Self { queue }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Removes and returns every event of kind `V`, in arrival order
    pub fn read<V: Event>(&mut self) -> IntoIter<V::Item> {
        let mut taken = Vec::new();
        let mut rest = Vec::with_capacity(self.queue.len());
        for event in mem::take(&mut self.queue) {
            match V::extract(event) {
                Ok(item) => taken.push(item),
                Err(event) => rest.push(event),
            }
        }
        self.queue = rest;
        taken.into_iter()
    }

    pub fn has<V: Event>(&self) -> bool {
        self.queue.iter().any(V::matches)
    }
}

// Event Trait
pub trait Event {
    type Item;

    fn extract(event: PeerEvent) -> Result<Self::Item, PeerEvent>;

    fn matches(event: &PeerEvent) -> bool;
}

macro_rules! event_kind {
    ($(#[$doc:meta])* $marker:ident, $variant:ident, $item:ty) => {
        $(#[$doc])*
        pub struct $marker;
        impl Event for $marker {
            type Item = $item;

            fn extract(event: PeerEvent) -> Result<Self::Item, PeerEvent> {
                match event {
                    PeerEvent::$variant(item) => Ok(item),
                    other => Err(other),
                }
            }

            fn matches(event: &PeerEvent) -> bool {
                matches!(event, PeerEvent::$variant(..))
            }
        }
    };
}

event_kind!(PeerJoinedEvent, PeerJoined, PeerJoined);
event_kind!(PeerLeftEvent, PeerLeft, PeerId);
event_kind!(PeerDisconnectedEvent, PeerDisconnected, PeerId);
event_kind!(StateUpdatedEvent, StateUpdated, CharacterStateSnapshot);
event_kind!(ChatReceivedEvent, ChatReceived, ChatMessage);
event_kind!(BattleInvitedEvent, BattleInvited, BattleInvitation);
event_kind!(BattleStartedEvent, BattleStarted, BattleStart);
event_kind!(TurnStartedEvent, TurnStarted, TurnStart);
event_kind!(ActionAppliedEvent, ActionApplied, AppliedAction);
event_kind!(FairnessRejectedEvent, FairnessRejected, FairnessRejection);
event_kind!(BattleResolvedEvent, BattleResolved, ResultSummary);
event_kind!(BattleAbortedEvent, BattleAborted, BattleAbortPayload);
event_kind!(GroupInvitedEvent, GroupInvited, GroupInvitation);
event_kind!(
    /// A ceremony or one of its phases reached Accepted, Declined or Expired
    GroupEventTriggeredEvent,
    GroupEventTriggered,
    GroupOutcome
);
event_kind!(GroupPhaseOpenedEvent, GroupPhaseOpened, PhaseOpening);

/// Fan-out of node events to any number of subscribers.
///
/// Publishing never blocks; a subscriber that falls behind by more than the
/// channel capacity loses the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PeerEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: PeerEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventSubscription {
    receiver: broadcast::Receiver<PeerEvent>,
}

impl EventSubscription {
    /// Waits for the next event. `None` once the node has shut down.
    pub async fn recv(&mut self) -> Option<PeerEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, {} events dropped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Waits for the next event of kind `V`, discarding others
    pub async fn recv_kind<V: Event>(&mut self) -> Option<V::Item> {
        loop {
            if let Ok(item) = V::extract(self.recv().await?) {
                return Some(item);
            }
        }
    }

    /// Drains everything currently queued without waiting
    pub fn receive(&mut self) -> Events {
        let mut queue = Vec::new();
        loop {
            match self.receiver.try_recv() {
                Ok(event) => queue.push(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("event subscriber lagged, {} events dropped", skipped);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Events::new(queue)
    }
}

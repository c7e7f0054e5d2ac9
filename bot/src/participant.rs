use duel_peer::{ActionRequest, EventSubscription, Node, PeerError};
use duel_shared::{
    battle::{BattleView, LoggedAction},
    messages::{CeremonyId, SessionId},
    PeerId,
};

/// The submission interface a bot drives. A player-facing UI drives the same
/// operations on the node, so a bot can do nothing a person could not.
pub trait Participant: Send + Sync + 'static {
    fn local_id(&self) -> &PeerId;

    fn subscribe(&self) -> EventSubscription;

    fn battle_view(&self, session_id: &SessionId) -> Option<BattleView>;

    fn accept_battle(&self, session_id: &SessionId) -> Result<(), PeerError>;

    fn decline_battle(&self, session_id: &SessionId) -> Result<(), PeerError>;

    fn submit_battle_action(
        &self,
        session_id: &SessionId,
        request: ActionRequest,
    ) -> Result<LoggedAction, PeerError>;

    fn respond_to_ceremony(&self, ceremony_id: &CeremonyId, accept: bool) -> Result<(), PeerError>;

    fn vote_in_ceremony(&self, ceremony_id: &CeremonyId, choice: &str) -> Result<(), PeerError>;

    fn send_chat(&self, text: &str, to: Option<&PeerId>) -> Result<(), PeerError>;
}

impl Participant for Node {
    fn local_id(&self) -> &PeerId {
        Node::local_id(self)
    }

    fn subscribe(&self) -> EventSubscription {
        Node::subscribe(self)
    }

    fn battle_view(&self, session_id: &SessionId) -> Option<BattleView> {
        Node::battle_view(self, session_id)
    }

    fn accept_battle(&self, session_id: &SessionId) -> Result<(), PeerError> {
        Node::accept_battle(self, session_id)
    }

    fn decline_battle(&self, session_id: &SessionId) -> Result<(), PeerError> {
        Node::decline_battle(self, session_id)
    }

    fn submit_battle_action(
        &self,
        session_id: &SessionId,
        request: ActionRequest,
    ) -> Result<LoggedAction, PeerError> {
        Node::submit_battle_action(self, session_id, request)
    }

    fn respond_to_ceremony(&self, ceremony_id: &CeremonyId, accept: bool) -> Result<(), PeerError> {
        Node::respond_to_ceremony(self, ceremony_id, accept)
    }

    fn vote_in_ceremony(&self, ceremony_id: &CeremonyId, choice: &str) -> Result<(), PeerError> {
        Node::vote_in_ceremony(self, ceremony_id, choice)
    }

    fn send_chat(&self, text: &str, to: Option<&PeerId>) -> Result<(), PeerError> {
        Node::send_chat(self, text, to)
    }
}

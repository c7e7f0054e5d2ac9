use std::io;

use thiserror::Error;

use duel_shared::{
    battle::{BattleRuleError, FairnessViolation, SessionPhase},
    messages::{CeremonyId, SessionId},
    CodecError, ConfigError, PeerId,
};

/// Errors surfaced by [`Node`](crate::Node) operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PeerError {
    #[error("I/O error while {context}: {reason}")]
    Io {
        context: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Peer {peer:?} is not connected")]
    NotConnected { peer: PeerId },

    #[error("Outgoing queue to peer {peer:?} is full")]
    QueueFull { peer: PeerId },

    #[error("Node has been shut down")]
    Shutdown,

    #[error(transparent)]
    Battle(#[from] BattleError),

    #[error(transparent)]
    Group(#[from] GroupError),
}

impl PeerError {
    pub(crate) fn io(context: &'static str, err: io::Error) -> Self {
        PeerError::Io {
            context,
            reason: err.to_string(),
        }
    }
}

/// Errors produced by battle session operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BattleError {
    #[error("No battle session {session_id}")]
    UnknownSession { session_id: SessionId },

    #[error("Session {session_id} is {phase:?}")]
    WrongPhase {
        session_id: SessionId,
        phase: SessionPhase,
    },

    #[error("Local peer is not a participant in session {session_id}")]
    NotParticipant { session_id: SessionId },

    #[error("Session {session_id} was already accepted")]
    AlreadyAccepted { session_id: SessionId },

    #[error("It is not the local peer's turn (current actor: {current:?})")]
    NotYourTurn { current: Option<PeerId> },

    #[error("Turn time for turn {turn} has run out")]
    TurnExpired { turn: u64 },

    #[error("Attack needs a target")]
    MissingTarget,

    #[error("A battle needs {min} to {max} participants, got {count}")]
    ParticipantCount { count: usize, min: usize, max: usize },

    #[error("Participant {peer:?} is not connected")]
    ParticipantNotConnected { peer: PeerId },

    #[error("Action rejected: {0}")]
    Fairness(FairnessViolation),

    #[error(transparent)]
    Rule(BattleRuleError),
}

impl From<BattleRuleError> for BattleError {
    fn from(err: BattleRuleError) -> Self {
        match err {
            BattleRuleError::Fairness(violation) => BattleError::Fairness(violation),
            other => BattleError::Rule(other),
        }
    }
}

/// Errors produced by group ceremony operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GroupError {
    #[error("No ceremony {ceremony_id}")]
    UnknownCeremony { ceremony_id: CeremonyId },

    #[error("Ceremony {ceremony_id} is no longer pending")]
    NotPending { ceremony_id: CeremonyId },

    #[error("Local peer was not invited to ceremony {ceremony_id}")]
    NotInvited { ceremony_id: CeremonyId },

    #[error("Ceremony {ceremony_id} was already answered")]
    AlreadyResponded { ceremony_id: CeremonyId },

    #[error("An invitation has exactly one invitee, got {count}")]
    InvitationNeedsOneInvitee { count: usize },

    #[error("{count} participants exceeds the limit of {max}")]
    TooManyParticipants { count: usize, max: usize },

    #[error("{invitees} invitees can never reach {min} participants")]
    Unreachable { invitees: usize, min: usize },

    #[error("Invitee {peer:?} is not connected")]
    InviteeNotConnected { peer: PeerId },

    #[error("Phase {index} is unusable: {reason}")]
    InvalidPhase { index: usize, reason: &'static str },

    #[error("Local peer does not take part in ceremony {ceremony_id}")]
    NotParticipant { ceremony_id: CeremonyId },

    #[error("Ceremony {ceremony_id} has no open phase")]
    NoOpenPhase { ceremony_id: CeremonyId },

    #[error("Phase {phase} offers no choice '{choice}'")]
    UnknownChoice { phase: usize, choice: String },
}

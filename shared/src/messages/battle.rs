use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    battle::{BattleAction, BattleRules, FairnessConstraint, LoggedAction},
    identity::PeerId,
};

#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn random() -> Self {
        Self(super::random_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sent by the proposer to every invitee. Carries the fairness caps and
/// rules the whole session will replay against.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BattleInvitePayload {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub participants: Vec<PeerId>,
    pub fairness: FairnessConstraint,
    pub rules: BattleRules,
    #[serde(rename = "maxTurns")]
    pub max_turns: u64,
    #[serde(rename = "turnTimeoutMs")]
    pub turn_timeout_ms: u64,
    #[serde(rename = "timeBudgetMs")]
    pub time_budget_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleAcceptPayload {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
}

/// An action for log position `turn` of a session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BattleActionPayload {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub turn: u64,
    #[serde(flatten)]
    pub action: BattleAction,
}

/// Signed outcome each participant broadcasts once its replay resolves
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    #[serde(rename = "winnerID")]
    pub winner_id: Option<PeerId>,
    pub draw: bool,
    #[serde(rename = "finalLog")]
    pub final_log: Vec<LoggedAction>,
}

impl ResultSummary {
    /// Same winner, same draw flag, same number of committed turns
    pub fn agrees_with(&self, other: &ResultSummary) -> bool {
        self.session_id == other.session_id
            && self.winner_id == other.winner_id
            && self.draw == other.draw
            && self.final_log.len() == other.final_log.len()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AbortReason {
    /// A participant's connection was lost mid-session
    Disconnect { peer: PeerId },
    /// Not every invitee accepted before the invite timeout
    HandshakeTimeout,
    /// A participant cancelled the session
    Cancelled { peer: PeerId },
    /// An invitee declined
    Declined { peer: PeerId },
    /// Two different entries were committed for the same turn
    Diverged { turn: u64 },
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::Disconnect { peer } => write!(f, "{} disconnected", peer.short()),
            AbortReason::HandshakeTimeout => f.write_str("invite handshake timed out"),
            AbortReason::Cancelled { peer } => write!(f, "cancelled by {}", peer.short()),
            AbortReason::Declined { peer } => write!(f, "declined by {}", peer.short()),
            AbortReason::Diverged { turn } => write!(f, "replicas diverged on turn {}", turn),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BattleAbortPayload {
    #[serde(rename = "sessionID")]
    pub session_id: SessionId,
    pub reason: AbortReason,
}

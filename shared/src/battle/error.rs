use thiserror::Error;

use crate::identity::PeerId;

use super::FairnessViolation;

/// Reasons an action cannot be appended to a battle log
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BattleRuleError {
    #[error("A battle needs at least two distinct participants")]
    TooFewParticipants,

    #[error("Battle is already finished")]
    Finished,

    #[error("Action is for turn {got} but the log is at turn {expected}")]
    WrongTurn { expected: u64, got: u64 },

    #[error("It is {expected:?}'s turn, not {actual:?}'s")]
    NotCurrentActor { expected: PeerId, actual: PeerId },

    #[error("Action rejected by fairness rules: {0}")]
    Fairness(FairnessViolation),
}

impl From<FairnessViolation> for BattleRuleError {
    fn from(violation: FairnessViolation) -> Self {
        BattleRuleError::Fairness(violation)
    }
}

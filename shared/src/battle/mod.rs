//! Deterministic battle rules.
//!
//! Everything in here is synchronous and side-effect free so that every
//! participant replaying the same action log reaches the same state.

mod action;
mod error;
mod fairness;
mod rules;
mod state;
mod view;

pub use action::{ActionType, BattleAction, Effect, LoggedAction, ModifierKind};
pub use error::BattleRuleError;
pub use fairness::{enforce, quantize, validate_item_id, FairnessConstraint, FairnessVerdict, FairnessViolation};
pub use rules::BattleRules;
pub use state::{ActiveModifier, BattleOutcome, BattleState, Combatant};
pub use view::{BattleView, SessionPhase};

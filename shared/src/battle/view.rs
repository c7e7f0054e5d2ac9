use std::time::Duration;

use crate::{identity::PeerId, messages::SessionId};

use super::{ActionType, BattleAction, BattleState, FairnessVerdict};

/// Lifecycle of a battle session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    Proposed,
    Accepted,
    InProgress,
    Resolved,
    Aborted,
}

impl SessionPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionPhase::Resolved | SessionPhase::Aborted)
    }
}

/// Read-only snapshot of a session as seen by one participant.
///
/// This is all a UI or a bot gets; mutation only happens through action
/// submission on the node.
#[derive(Clone, Debug)]
pub struct BattleView {
    pub session_id: SessionId,
    pub phase: SessionPhase,
    pub local: PeerId,
    pub participants: Vec<PeerId>,
    /// Present once turn order is fixed
    pub state: Option<BattleState>,
    /// Time left for the current actor before a forfeit may be recorded
    pub turn_time_left: Option<Duration>,
}

impl BattleView {
    pub fn is_my_turn(&self) -> bool {
        self.phase == SessionPhase::InProgress
            && self
                .state
                .as_ref()
                .and_then(|state| state.current_actor())
                .is_some_and(|actor| actor == &self.local)
    }

    pub fn turn(&self) -> Option<u64> {
        self.state.as_ref().map(|state| state.turn())
    }

    /// Living opponents of the local participant, in turn order
    pub fn opponents(&self) -> Vec<PeerId> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        state
            .combatants()
            .iter()
            .filter(|c| c.is_alive() && c.id != self.local)
            .map(|c| c.id.clone())
            .collect()
    }

    /// Fairness verdict the local participant would get for `action` now
    pub fn preview(&self, action: &BattleAction) -> Option<FairnessVerdict> {
        self.state.as_ref().map(|state| state.preview(action))
    }

    /// Action types that would pass the Fairness Enforcer for the local
    /// participant with default modifiers and the given item
    pub fn allowed_actions(&self, item_id: &str) -> Vec<ActionType> {
        let Some(state) = &self.state else {
            return Vec::new();
        };
        let target = self
            .opponents()
            .into_iter()
            .next()
            .unwrap_or_else(|| self.local.clone());
        ActionType::PLAYABLE
            .into_iter()
            .filter(|action_type| {
                let target = if *action_type == ActionType::Attack {
                    target.clone()
                } else {
                    self.local.clone()
                };
                let mut action = BattleAction::new(self.local.clone(), *action_type, target);
                if *action_type == ActionType::Item {
                    action = action.with_item(item_id);
                }
                state.preview(&action).is_accepted()
            })
            .collect()
    }
}

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    time::{Duration, Instant},
};

use duel_shared::{
    battle::{
        ActionType, BattleAction, BattleRules, BattleState, BattleView, FairnessConstraint,
        SessionPhase,
    },
    messages::{ResultSummary, SessionId},
    PeerId,
};

use crate::error::BattleError;

/// What a participant wants to do on its turn. The node fills in the actor,
/// the turn and the timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct ActionRequest {
    pub action_type: ActionType,
    pub target: Option<PeerId>,
    pub item_id: Option<String>,
    pub modifier: f64,
}

impl ActionRequest {
    pub fn attack(target: PeerId) -> Self {
        Self::of(ActionType::Attack, Some(target))
    }

    pub fn defend() -> Self {
        Self::of(ActionType::Defend, None)
    }

    pub fn item(item_id: &str) -> Self {
        Self {
            item_id: Some(item_id.to_string()),
            ..Self::of(ActionType::Item, None)
        }
    }

    pub fn special() -> Self {
        Self::of(ActionType::Special, None)
    }

    /// Requested effect multiplier, e.g. from equipment
    pub fn with_modifier(mut self, modifier: f64) -> Self {
        self.modifier = modifier;
        self
    }

    fn of(action_type: ActionType, target: Option<PeerId>) -> Self {
        Self {
            action_type,
            target,
            item_id: None,
            modifier: 1.0,
        }
    }

    pub(crate) fn into_action(
        self,
        actor: &PeerId,
        client_timestamp: u64,
    ) -> Result<BattleAction, BattleError> {
        let target = match (self.action_type, self.target) {
            (ActionType::Attack, Some(target)) => target,
            (ActionType::Attack, None) => return Err(BattleError::MissingTarget),
            (_, target) => target.unwrap_or_else(|| actor.clone()),
        };
        let mut action = BattleAction::new(actor.clone(), self.action_type, target)
            .with_modifier(self.modifier)
            .at(client_timestamp);
        action.item_id = self.item_id;
        Ok(action)
    }
}

/// Upper bound on actions held for turns that cannot be applied yet
pub(crate) const MAX_PENDING_ACTIONS: usize = 32;

/// An action received before its turn came up
#[derive(Clone, Debug)]
pub(crate) struct PendingAction {
    pub sender: PeerId,
    pub action: BattleAction,
}

/// One battle as seen by the local participant
pub(crate) struct Session {
    pub id: SessionId,
    pub phase: SessionPhase,
    pub participants: Vec<PeerId>,
    pub accepted: BTreeSet<PeerId>,
    pub rules: BattleRules,
    pub fairness: FairnessConstraint,
    pub max_turns: u64,
    pub turn_timeout: Duration,
    pub time_budget: Duration,
    /// Local wait past a deadline before the next actor records a forfeit.
    /// The actor stops submitting the same span before its deadline.
    pub forfeit_grace: Duration,
    pub created: Instant,
    pub state: Option<BattleState>,
    pub turn_started: Instant,
    /// Thinking time used so far, per participant
    pub spent: HashMap<PeerId, Duration>,
    pub pending: BTreeMap<u64, PendingAction>,
    pub result: Option<ResultSummary>,
    /// Results other participants broadcast before ours was ready
    pub remote_results: Vec<(PeerId, ResultSummary)>,
    pub finished_at: Option<Instant>,
}

impl Session {
    pub fn includes(&self, peer: &PeerId) -> bool {
        self.participants.contains(peer)
    }

    pub fn others<'a>(&'a self, local: &'a PeerId) -> Vec<PeerId> {
        self.participants
            .iter()
            .filter(|peer| *peer != local)
            .cloned()
            .collect()
    }

    pub fn current_actor(&self) -> Option<&PeerId> {
        self.state.as_ref().and_then(|state| state.current_actor())
    }

    /// When the current actor's time runs out: the turn timeout or what is
    /// left of its budget, whichever is shorter
    pub fn turn_deadline(&self) -> Option<Instant> {
        let actor = self.current_actor()?;
        let spent = self.spent.get(actor).copied().unwrap_or_default();
        let allowance = self
            .turn_timeout
            .min(self.time_budget.saturating_sub(spent));
        Some(self.turn_started + allowance)
    }

    /// Last moment the local actor may still submit for the current turn
    pub fn submit_deadline(&self) -> Option<Instant> {
        let deadline = self.turn_deadline()?;
        Some(
            deadline
                .checked_sub(self.forfeit_grace)
                .map_or(self.turn_started, |closes| closes.max(self.turn_started)),
        )
    }

    /// Charges the time the current turn took to its actor
    pub fn charge_turn(&mut self, actor: &PeerId, now: Instant) {
        let used = now.saturating_duration_since(self.turn_started);
        *self.spent.entry(actor.clone()).or_default() += used;
    }

    pub fn finish(&mut self, phase: SessionPhase, now: Instant) {
        self.phase = phase;
        self.finished_at = Some(now);
        self.pending.clear();
    }

    pub fn view(&self, local: &PeerId, now: Instant) -> BattleView {
        let turn_time_left = match self.phase {
            SessionPhase::InProgress => self
                .submit_deadline()
                .map(|closes| closes.saturating_duration_since(now)),
            _ => None,
        };
        BattleView {
            session_id: self.id.clone(),
            phase: self.phase,
            local: local.clone(),
            participants: self.participants.clone(),
            state: self.state.clone(),
            turn_time_left,
        }
    }
}

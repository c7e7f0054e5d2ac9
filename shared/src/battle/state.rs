use std::collections::BTreeSet;

use log::debug;

use crate::identity::PeerId;

use super::{
    enforce, ActionType, BattleAction, BattleRuleError, BattleRules, Effect, FairnessConstraint,
    FairnessVerdict, LoggedAction, ModifierKind,
};

#[derive(Clone, Debug, PartialEq)]
pub struct ActiveModifier {
    pub kind: ModifierKind,
    pub value: f64,
    /// First turn at which the modifier is no longer active
    pub expires_turn: u64,
}

/// Battle stats of one participant
#[derive(Clone, Debug, PartialEq)]
pub struct Combatant {
    pub id: PeerId,
    pub hp: f64,
    pub max_hp: f64,
    pub modifiers: Vec<ActiveModifier>,
}

impl Combatant {
    pub fn new(id: PeerId, hp: f64) -> Self {
        Self {
            id,
            hp,
            max_hp: hp,
            modifiers: Vec::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.hp > 0.0
    }

    pub fn hp_ratio(&self) -> f64 {
        if self.max_hp > 0.0 {
            self.hp / self.max_hp
        } else {
            0.0
        }
    }

    /// Product of all pending charges
    pub fn charge_multiplier(&self) -> f64 {
        self.modifiers
            .iter()
            .filter(|m| m.kind == ModifierKind::Charge)
            .map(|m| m.value)
            .product()
    }

    /// Fraction of incoming damage absorbed by the strongest active guard
    pub fn guard(&self) -> f64 {
        self.modifiers
            .iter()
            .filter(|m| m.kind == ModifierKind::Guard)
            .map(|m| m.value)
            .fold(0.0, f64::max)
    }

    pub fn has_modifier(&self, kind: ModifierKind) -> bool {
        self.modifiers.iter().any(|m| m.kind == kind)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BattleOutcome {
    Winner(PeerId),
    Draw,
}

impl BattleOutcome {
    pub fn winner(&self) -> Option<&PeerId> {
        match self {
            BattleOutcome::Winner(id) => Some(id),
            BattleOutcome::Draw => None,
        }
    }

    pub fn is_draw(&self) -> bool {
        matches!(self, BattleOutcome::Draw)
    }
}

/// Replayable battle state: participants in turn order, their stats and the
/// append-only action log.
///
/// Turn order is the lexicographic order of participant ids, so every peer
/// derives it without negotiation. `turn()` is the log length; the actor for
/// that turn is the next living participant after the previous actor.
#[derive(Clone, Debug)]
pub struct BattleState {
    combatants: Vec<Combatant>,
    cursor: usize,
    log: Vec<LoggedAction>,
    rules: BattleRules,
    constraint: FairnessConstraint,
    max_turns: u64,
}

impl BattleState {
    pub fn new(
        participants: impl IntoIterator<Item = PeerId>,
        rules: BattleRules,
        constraint: FairnessConstraint,
        max_turns: u64,
    ) -> Result<Self, BattleRuleError> {
        let order: BTreeSet<PeerId> = participants.into_iter().collect();
        if order.len() < 2 {
            return Err(BattleRuleError::TooFewParticipants);
        }
        let combatants = order
            .into_iter()
            .map(|id| Combatant::new(id, rules.starting_hp))
            .collect();
        Ok(Self {
            combatants,
            cursor: 0,
            log: Vec::new(),
            rules,
            constraint,
            max_turns,
        })
    }

    pub fn order(&self) -> impl Iterator<Item = &PeerId> {
        self.combatants.iter().map(|c| &c.id)
    }

    pub fn combatants(&self) -> &[Combatant] {
        &self.combatants
    }

    pub fn combatant(&self, id: &PeerId) -> Option<&Combatant> {
        self.combatants.iter().find(|c| &c.id == id)
    }

    pub fn log(&self) -> &[LoggedAction] {
        &self.log
    }

    pub fn rules(&self) -> &BattleRules {
        &self.rules
    }

    pub fn constraint(&self) -> &FairnessConstraint {
        &self.constraint
    }

    pub fn max_turns(&self) -> u64 {
        self.max_turns
    }

    /// Log position the next action is for
    pub fn turn(&self) -> u64 {
        self.log.len() as u64
    }

    /// The one participant whose action is accepted now, or `None` once the
    /// battle has an outcome
    pub fn current_actor(&self) -> Option<&PeerId> {
        if self.outcome().is_some() {
            return None;
        }
        self.combatants.get(self.cursor).map(|c| &c.id)
    }

    /// Living participants after the current actor, in turn order
    pub fn next_actors(&self) -> impl Iterator<Item = &PeerId> {
        let len = self.combatants.len();
        (1..len)
            .map(move |offset| &self.combatants[(self.cursor + offset) % len])
            .filter(|c| c.is_alive())
            .map(|c| &c.id)
    }

    pub fn outcome(&self) -> Option<BattleOutcome> {
        let mut living = self.combatants.iter().filter(|c| c.is_alive());
        match (living.next(), living.next()) {
            (None, _) => return Some(BattleOutcome::Draw),
            (Some(last), None) => return Some(BattleOutcome::Winner(last.id.clone())),
            _ => {}
        }

        if self.turn() < self.max_turns {
            return None;
        }

        let best = self
            .combatants
            .iter()
            .map(|c| c.hp)
            .fold(f64::NEG_INFINITY, f64::max);
        let mut leaders = self.combatants.iter().filter(|c| c.hp == best);
        match (leaders.next(), leaders.next()) {
            (Some(leader), None) => Some(BattleOutcome::Winner(leader.id.clone())),
            _ => Some(BattleOutcome::Draw),
        }
    }

    /// Runs the Fairness Enforcer against the current state without applying
    pub fn preview(&self, action: &BattleAction) -> FairnessVerdict {
        let actor = self.combatant(&action.actor);
        let target = self.combatant(&action.target);
        match actor {
            Some(actor) => enforce(&self.constraint, &self.rules, action, actor, target),
            None => FairnessVerdict {
                effect: Effect::default(),
                rejection: Some(super::FairnessViolation::UnknownTarget),
            },
        }
    }

    /// Validates and appends `action` as log entry `turn`.
    ///
    /// Rejections leave the state untouched, so the actor may resubmit.
    pub fn apply(
        &mut self,
        turn: u64,
        action: BattleAction,
    ) -> Result<&LoggedAction, BattleRuleError> {
        let Some(expected_actor) = self.current_actor() else {
            return Err(BattleRuleError::Finished);
        };
        if turn != self.turn() {
            return Err(BattleRuleError::WrongTurn {
                expected: self.turn(),
                got: turn,
            });
        }
        if &action.actor != expected_actor {
            return Err(BattleRuleError::NotCurrentActor {
                expected: expected_actor.clone(),
                actual: action.actor,
            });
        }

        let mut effect = self.preview(&action).into_result()?;
        self.resolve(&action, &mut effect);

        debug!(
            "turn {}: {} {:?} -> {:.1} dmg {:.1} heal",
            turn,
            action.actor.short(),
            action.action_type,
            effect.damage,
            effect.healing
        );
        self.log.push(LoggedAction {
            turn,
            action,
            effect,
        });
        self.advance();
        self.log.last().ok_or(BattleRuleError::Finished)
    }

    /// Records a no-op entry for the current actor
    pub fn forfeit(&mut self, turn: u64, client_timestamp: u64) -> Result<&LoggedAction, BattleRuleError> {
        let Some(actor) = self.current_actor().cloned() else {
            return Err(BattleRuleError::Finished);
        };
        self.apply(turn, BattleAction::forfeit(actor).at(client_timestamp))
    }

    fn resolve(&mut self, action: &BattleAction, effect: &mut Effect) {
        let turn = self.turn();
        let round = self.combatants.len() as u64;
        let rules = self.rules.clone();

        match action.action_type {
            ActionType::Attack => {
                if let Some(actor) = self.combatant_mut(&action.actor) {
                    actor.modifiers.retain(|m| m.kind != ModifierKind::Charge);
                }
                if let Some(target) = self.combatant_mut(&action.target) {
                    let dealt = (effect.damage * (1.0 - target.guard())).min(target.hp);
                    target.hp -= dealt;
                    effect.damage = dealt;
                }
            }
            ActionType::Defend => {
                let guard = (rules.guard_reduction * effect.multiplier).clamp(0.0, 1.0);
                self.push_modifier(&action.actor, ModifierKind::Guard, guard, turn + round);
            }
            ActionType::Item => {
                if let Some(actor) = self.combatant_mut(&action.actor) {
                    let healed = effect.healing.min(actor.max_hp - actor.hp).max(0.0);
                    actor.hp += healed;
                    effect.healing = healed;
                }
                self.push_modifier(
                    &action.actor,
                    ModifierKind::ItemEffect,
                    effect.multiplier,
                    turn + round * rules.item_rounds,
                );
            }
            ActionType::Special => {
                self.push_modifier(
                    &action.actor,
                    ModifierKind::Charge,
                    rules.special_multiplier,
                    turn + round * rules.charge_rounds,
                );
            }
            ActionType::Forfeit => {}
        }
    }

    fn push_modifier(&mut self, id: &PeerId, kind: ModifierKind, value: f64, expires_turn: u64) {
        if let Some(combatant) = self.combatant_mut(id) {
            combatant.modifiers.push(ActiveModifier {
                kind,
                value,
                expires_turn,
            });
        }
    }

    fn combatant_mut(&mut self, id: &PeerId) -> Option<&mut Combatant> {
        self.combatants.iter_mut().find(|c| &c.id == id)
    }

    fn advance(&mut self) {
        let len = self.combatants.len();
        for offset in 1..=len {
            let index = (self.cursor + offset) % len;
            if self.combatants[index].is_alive() {
                self.cursor = index;
                break;
            }
        }

        let turn = self.turn();
        for combatant in &mut self.combatants {
            combatant.modifiers.retain(|m| m.expires_turn > turn);
        }
    }
}

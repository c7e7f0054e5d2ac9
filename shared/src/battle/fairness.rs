use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::ConfigError;

use super::{
    rules::positive, ActionType, BattleAction, BattleRules, Combatant, Effect, ModifierKind,
};

/// Longest accepted item reference
pub const MAX_ITEM_ID_LEN: usize = 50;

const MARKUP_CHARACTERS: [char; 5] = ['<', '>', '"', '\'', '&'];

/// Caps on how far a single action's effect may be amplified, fixed for the
/// lifetime of a battle session
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FairnessConstraint {
    pub max_damage_modifier: f64,
    pub max_defense_modifier: f64,
    pub max_heal_modifier: f64,
    pub max_active_modifiers: usize,
}

impl Default for FairnessConstraint {
    fn default() -> Self {
        Self {
            max_damage_modifier: 1.20,
            max_defense_modifier: 1.15,
            max_heal_modifier: 1.25,
            max_active_modifiers: 3,
        }
    }
}

impl FairnessConstraint {
    pub fn with_max_damage_modifier(mut self, cap: f64) -> Self {
        self.max_damage_modifier = cap;
        self
    }

    pub fn with_max_active_modifiers(mut self, max: usize) -> Self {
        self.max_active_modifiers = max;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("maxDamageModifier", self.max_damage_modifier)?;
        positive("maxDefenseModifier", self.max_defense_modifier)?;
        positive("maxHealModifier", self.max_heal_modifier)?;
        if self.max_active_modifiers == 0 {
            return Err(ConfigError::NotPositive {
                field: "maxActiveModifiers",
            });
        }
        Ok(())
    }
}

/// Why the Fairness Enforcer refused an action
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FairnessViolation {
    #[error("Actor already has {active} of {max} active modifiers")]
    TooManyModifiers { active: usize, max: usize },

    #[error("Requested modifier is not a finite number")]
    InvalidModifier,

    #[error("Item action without an itemID")]
    MissingItem,

    #[error("Invalid itemID '{item_id}'")]
    InvalidItem { item_id: String },

    #[error("A participant cannot attack itself")]
    SelfTarget,

    #[error("Target is not a participant in this battle")]
    UnknownTarget,

    #[error("Target has already been defeated")]
    TargetDefeated,
}

/// Clamped effect plus an optional rejection. When `rejection` is set the
/// effect is empty and the action must not be applied.
#[derive(Clone, Debug, PartialEq)]
pub struct FairnessVerdict {
    pub effect: Effect,
    pub rejection: Option<FairnessViolation>,
}

impl FairnessVerdict {
    fn accept(effect: Effect) -> Self {
        Self {
            effect,
            rejection: None,
        }
    }

    fn reject(violation: FairnessViolation) -> Self {
        Self {
            effect: Effect::default(),
            rejection: Some(violation),
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn into_result(self) -> Result<Effect, FairnessViolation> {
        match self.rejection {
            Some(violation) => Err(violation),
            None => Ok(self.effect),
        }
    }
}

/// Rounds a requested multiplier to three decimals so every peer feeds the
/// same value into the rules regardless of float text round-tripping
pub fn quantize(modifier: f64) -> f64 {
    (modifier * 1000.0).round() / 1000.0
}

pub fn validate_item_id(item_id: &str) -> Result<(), FairnessViolation> {
    if item_id.is_empty()
        || item_id.chars().count() > MAX_ITEM_ID_LEN
        || item_id.contains(MARKUP_CHARACTERS)
    {
        return Err(FairnessViolation::InvalidItem {
            item_id: item_id.chars().take(MAX_ITEM_ID_LEN).collect(),
        });
    }
    Ok(())
}

fn clamp(requested: f64, cap: f64) -> (f64, bool) {
    let applied = requested.clamp(0.0, cap);
    (applied, applied != requested)
}

/// Validates `action` against `constraint` and computes its nominal effect.
///
/// `target` is the combatant named by the action, if it is a participant.
/// Damage and healing in the returned effect are before guard and hp limits.
pub fn enforce(
    constraint: &FairnessConstraint,
    rules: &BattleRules,
    action: &BattleAction,
    actor: &Combatant,
    target: Option<&Combatant>,
) -> FairnessVerdict {
    if action.action_type == ActionType::Forfeit {
        return FairnessVerdict::accept(Effect::default());
    }

    if !action.modifier.is_finite() {
        return FairnessVerdict::reject(FairnessViolation::InvalidModifier);
    }
    let requested = quantize(action.modifier);

    if action.action_type.adds_modifier() && actor.modifiers.len() >= constraint.max_active_modifiers
    {
        return FairnessVerdict::reject(FairnessViolation::TooManyModifiers {
            active: actor.modifiers.len(),
            max: constraint.max_active_modifiers,
        });
    }

    match action.action_type {
        ActionType::Attack => {
            let Some(target) = target else {
                return FairnessVerdict::reject(FairnessViolation::UnknownTarget);
            };
            if target.id == actor.id {
                return FairnessVerdict::reject(FairnessViolation::SelfTarget);
            }
            if !target.is_alive() {
                return FairnessVerdict::reject(FairnessViolation::TargetDefeated);
            }
            let combined = requested * actor.charge_multiplier();
            let (multiplier, clamped) = clamp(combined, constraint.max_damage_modifier);
            FairnessVerdict::accept(Effect {
                multiplier,
                clamped,
                damage: rules.base_attack * multiplier,
                ..Effect::default()
            })
        }
        ActionType::Defend => {
            let (multiplier, clamped) = clamp(requested, constraint.max_defense_modifier);
            FairnessVerdict::accept(Effect {
                multiplier,
                clamped,
                modifier: Some(ModifierKind::Guard),
                ..Effect::default()
            })
        }
        ActionType::Item => {
            let Some(item_id) = action.item_id.as_deref() else {
                return FairnessVerdict::reject(FairnessViolation::MissingItem);
            };
            if let Err(violation) = validate_item_id(item_id) {
                return FairnessVerdict::reject(violation);
            }
            let (multiplier, clamped) = clamp(requested, constraint.max_heal_modifier);
            FairnessVerdict::accept(Effect {
                multiplier,
                clamped,
                healing: rules.base_heal * multiplier,
                modifier: Some(ModifierKind::ItemEffect),
                ..Effect::default()
            })
        }
        ActionType::Special => FairnessVerdict::accept(Effect {
            multiplier: rules.special_multiplier,
            modifier: Some(ModifierKind::Charge),
            ..Effect::default()
        }),
        ActionType::Forfeit => FairnessVerdict::accept(Effect::default()),
    }
}

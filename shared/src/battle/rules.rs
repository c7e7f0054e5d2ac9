use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Base magnitudes for each action type
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BattleRules {
    pub base_attack: f64,
    /// Fraction of attack damage absorbed by an active guard
    pub guard_reduction: f64,
    pub base_heal: f64,
    /// Multiplier a `special` puts on the actor's next attack
    pub special_multiplier: f64,
    pub starting_hp: f64,
    /// Rounds an item effect occupies a modifier slot
    pub item_rounds: u64,
    /// Rounds an unused charge stays active
    pub charge_rounds: u64,
}

impl Default for BattleRules {
    fn default() -> Self {
        Self {
            base_attack: 20.0,
            guard_reduction: 0.5,
            base_heal: 25.0,
            special_multiplier: 1.5,
            starting_hp: 100.0,
            item_rounds: 3,
            charge_rounds: 2,
        }
    }
}

impl BattleRules {
    pub fn with_base_attack(mut self, base_attack: f64) -> Self {
        self.base_attack = base_attack;
        self
    }

    pub fn with_starting_hp(mut self, starting_hp: f64) -> Self {
        self.starting_hp = starting_hp;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("baseAttack", self.base_attack)?;
        positive("baseHeal", self.base_heal)?;
        positive("specialMultiplier", self.special_multiplier)?;
        positive("startingHp", self.starting_hp)?;
        if !(0.0..1.0).contains(&self.guard_reduction) {
            return Err(ConfigError::OutOfRange {
                field: "guardReduction",
                value: self.guard_reduction.to_string(),
                min: "0".to_string(),
                max: "1".to_string(),
            });
        }
        if self.item_rounds == 0 {
            return Err(ConfigError::NotPositive { field: "itemRounds" });
        }
        if self.charge_rounds == 0 {
            return Err(ConfigError::NotPositive {
                field: "chargeRounds",
            });
        }
        Ok(())
    }
}

pub(crate) fn positive(field: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { field })
    }
}

use serde::{Deserialize, Serialize};

use crate::{battle::fairness::quantize, identity::PeerId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Attack,
    Defend,
    Item,
    Special,
    /// Recorded in place of a silent actor's turn
    Forfeit,
}

impl ActionType {
    /// Action types a participant may choose
    pub const PLAYABLE: [ActionType; 4] = [
        ActionType::Attack,
        ActionType::Defend,
        ActionType::Item,
        ActionType::Special,
    ];

    /// Whether resolving this action occupies a modifier slot on the actor
    pub fn adds_modifier(&self) -> bool {
        matches!(
            self,
            ActionType::Defend | ActionType::Item | ActionType::Special
        )
    }
}

fn default_modifier() -> f64 {
    1.0
}

/// One participant's move. Immutable once it is in the log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BattleAction {
    #[serde(rename = "actorID")]
    pub actor: PeerId,
    #[serde(rename = "actionType")]
    pub action_type: ActionType,
    /// Opponent for `attack`; the actor itself for self-targeted actions
    #[serde(rename = "targetID")]
    pub target: PeerId,
    #[serde(rename = "itemID", default, skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    /// Requested effect multiplier, clamped by the fairness caps
    #[serde(default = "default_modifier")]
    pub modifier: f64,
    #[serde(rename = "clientTimestamp")]
    pub client_timestamp: u64,
}

impl BattleAction {
    pub fn new(actor: PeerId, action_type: ActionType, target: PeerId) -> Self {
        Self {
            actor,
            action_type,
            target,
            item_id: None,
            modifier: 1.0,
            client_timestamp: 0,
        }
    }

    pub fn forfeit(actor: PeerId) -> Self {
        let target = actor.clone();
        Self::new(actor, ActionType::Forfeit, target)
    }

    pub fn with_item(mut self, item_id: &str) -> Self {
        self.item_id = Some(item_id.to_string());
        self
    }

    pub fn with_modifier(mut self, modifier: f64) -> Self {
        self.modifier = modifier;
        self
    }

    pub fn at(mut self, client_timestamp: u64) -> Self {
        self.client_timestamp = client_timestamp;
        self
    }

    /// Whether both describe the same move. The modifier is compared after
    /// quantizing, so a JSON round trip does not count as a change.
    pub fn same_move(&self, other: &BattleAction) -> bool {
        self.actor == other.actor
            && self.action_type == other.action_type
            && self.target == other.target
            && self.item_id == other.item_id
            && self.client_timestamp == other.client_timestamp
            && quantize(self.modifier) == quantize(other.modifier)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifierKind {
    /// Reduces incoming attack damage
    Guard,
    /// Multiplies the next attack
    Charge,
    /// Lingering item effect; only occupies a slot
    ItemEffect,
}

/// Resolved outcome of an action, filled in after fairness and replay
#[derive(Clone, Debug, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Effect {
    /// Multiplier actually applied after clamping
    pub multiplier: f64,
    /// Whether the requested multiplier was reduced to a cap
    pub clamped: bool,
    pub damage: f64,
    pub healing: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifier: Option<ModifierKind>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LoggedAction {
    pub turn: u64,
    pub action: BattleAction,
    pub effect: Effect,
}

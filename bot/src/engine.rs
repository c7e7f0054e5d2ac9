//! Pure decision functions. Everything random draws from the caller's
//! generator so a seeded bot replays the same choices.

use std::time::Duration;

use fastrand::Rng;

use duel_peer::ActionRequest;
use duel_shared::{
    battle::{ActionType, BattleAction, BattleView},
    messages::PhaseChoice,
    PeerId,
};

use crate::personality::Personality;

/// Item a bot uses for its heal
pub const DEFAULT_ITEM: &str = "potion";

const GREETINGS: [&str; 3] = ["hi", "hello", "hey"];
const GREETING_REPLIES: [&str; 3] = ["Hello there!", "Hey! Ready for a duel?", "Hi, good to see you."];
const REPLIES: [&str; 4] = ["Good luck out there.", "Interesting...", "Ha, fair enough.", "Let's battle sometime!"];

/// Picks the local participant's action for the current turn, or `None` when
/// it is not the local turn or nothing would pass the fairness caps.
///
/// Attack weight grows with aggression; defend and heal weights grow with
/// caution as health drops. Only action types the view reports as allowed
/// are considered.
pub fn choose_action(
    view: &BattleView,
    personality: &Personality,
    rng: &mut Rng,
) -> Option<ActionRequest> {
    if !view.is_my_turn() {
        return None;
    }
    let state = view.state.as_ref()?;
    let hp_ratio = state.combatant(&view.local)?.hp_ratio();
    let hurt = 1.0 - hp_ratio;
    let target = weakest_opponent(view);

    let allowed = view.allowed_actions(DEFAULT_ITEM);
    let weighted: Vec<(ActionType, f64)> = allowed
        .into_iter()
        .filter_map(|action_type| {
            let weight = match action_type {
                ActionType::Attack if target.is_some() => 0.4 + personality.aggression,
                ActionType::Attack => return None,
                ActionType::Defend => 0.1 + personality.caution * (0.3 + hurt),
                ActionType::Item if hurt > 0.1 => personality.caution * hurt * 2.0,
                ActionType::Item => return None,
                ActionType::Special => 0.1 + personality.aggression * 0.4,
                ActionType::Forfeit => return None,
            };
            (weight > 0.0).then_some((action_type, weight))
        })
        .collect();

    let action_type = weighted_pick(&weighted, rng)?;
    let request = match action_type {
        ActionType::Attack => ActionRequest::attack(target?),
        ActionType::Item => ActionRequest::item(DEFAULT_ITEM),
        ActionType::Defend => ActionRequest::defend(),
        _ => ActionRequest::special(),
    };

    // re-check the concrete action; the allowed list previews a generic one
    let preview_target = request.target.clone().unwrap_or_else(|| view.local.clone());
    let mut action = BattleAction::new(view.local.clone(), request.action_type, preview_target);
    if let Some(item_id) = &request.item_id {
        action = action.with_item(item_id);
    }
    match view.preview(&action) {
        Some(verdict) if verdict.is_accepted() => Some(request),
        _ => None,
    }
}

fn weakest_opponent(view: &BattleView) -> Option<PeerId> {
    let state = view.state.as_ref()?;
    view.opponents()
        .into_iter()
        .filter_map(|id| state.combatant(&id).map(|c| (id, c.hp)))
        .min_by(|(a_id, a_hp), (b_id, b_hp)| a_hp.total_cmp(b_hp).then_with(|| a_id.cmp(b_id)))
        .map(|(id, _)| id)
}

fn weighted_pick<T: Copy>(options: &[(T, f64)], rng: &mut Rng) -> Option<T> {
    let total: f64 = options.iter().map(|(_, weight)| weight).sum();
    if options.is_empty() || total <= 0.0 {
        return None;
    }
    let mut roll = rng.f64() * total;
    for (option, weight) in options {
        if roll < *weight {
            return Some(*option);
        }
        roll -= weight;
    }
    options.last().map(|(option, _)| *option)
}

pub fn should_accept_battle(personality: &Personality, rng: &mut Rng) -> bool {
    let chance = 0.2 + 0.8 * personality.aggression - 0.2 * personality.caution;
    rng.f64() < chance.clamp(0.05, 1.0)
}

pub fn should_join_activity(personality: &Personality, rng: &mut Rng) -> bool {
    rng.f64() < (0.1 + 0.9 * personality.sociability).min(1.0)
}

/// The choice a bot votes for in a ceremony phase. Ambitious bots go for
/// the most points; the rest pick at random.
pub fn choose_vote(
    personality: &Personality,
    choices: &[PhaseChoice],
    rng: &mut Rng,
) -> Option<String> {
    if choices.is_empty() {
        return None;
    }
    let chosen = if rng.f64() < personality.aggression {
        choices.iter().max_by_key(|choice| choice.points)
    } else {
        choices.get(rng.usize(..choices.len()))
    };
    chosen.map(|choice| choice.id.clone())
}

/// A reply to `incoming`, if the bot feels like talking
pub fn chat_reply(personality: &Personality, incoming: &str, rng: &mut Rng) -> Option<String> {
    if rng.f64() >= personality.chattiness {
        return None;
    }
    let lowered = incoming.to_lowercase();
    let greeted = lowered
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| GREETINGS.contains(&word));
    let lines: &[&str] = if greeted { &GREETING_REPLIES } else { &REPLIES };
    Some(lines[rng.usize(..lines.len())].to_string())
}

/// Human-like pause before acting: uniform between the personality's
/// bounds, never more than half of the time left on the turn
pub fn think_delay(
    personality: &Personality,
    turn_time_left: Option<Duration>,
    rng: &mut Rng,
) -> Duration {
    let spread = personality.max_delay.saturating_sub(personality.min_delay);
    let delay = personality.min_delay + spread.mul_f64(rng.f64());
    match turn_time_left {
        Some(left) => delay.min(left / 2),
        None => delay,
    }
}

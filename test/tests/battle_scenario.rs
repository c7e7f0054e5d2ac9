use duel_peer::{
    ActionAppliedEvent, ActionRequest, BattleAbortedEvent, BattleError, BattleResolvedEvent, BattleStartedEvent,
    FairnessRejectedEvent, Node, PeerError,
};
use duel_shared::{
    battle::{ActionType, BattleRules, FairnessViolation, SessionPhase},
    messages::{AbortReason, SessionId},
    PeerId,
};
use duel_test::{
    connect, current_actor, expect_event, in_phase, spawn_node_with, start_duel, test_config,
    wait_for_turns,
};

async fn duelists(base_attack: f64) -> (Node, Node) {
    let config = test_config();
    let battle = config
        .battle
        .clone()
        .with_rules(BattleRules::default().with_base_attack(base_attack));
    let config = config.with_battle(battle);
    let a = spawn_node_with(config.clone()).await;
    let b = spawn_node_with(config).await;
    connect(&a, &b).await;
    (a, b)
}

/// The node whose turn it is, and the other one
fn by_turn<'a>(a: &'a Node, b: &'a Node, session_id: &SessionId) -> (&'a Node, &'a Node) {
    let actor = current_actor(a, session_id).expect("battle has a current actor");
    if &actor == a.local_id() {
        (a, b)
    } else {
        (b, a)
    }
}

fn hp(node: &Node, session_id: &SessionId, peer: &PeerId) -> f64 {
    node.battle_view(session_id)
        .and_then(|view| view.state)
        .and_then(|state| state.combatant(peer).map(|combatant| combatant.hp))
        .expect("combatant exists")
}

#[tokio::test]
async fn both_sides_learn_the_turn_order() {
    let (a, b) = duelists(10.0).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    let session_id = start_duel(&a, &b).await;

    let a_start = expect_event!(a_events, BattleStartedEvent);
    let b_start = expect_event!(b_events, BattleStartedEvent);
    assert_eq!(a_start.session_id, session_id);
    assert_eq!(a_start.order, b_start.order);
    assert_eq!(a_start.order.len(), 2);
}

#[tokio::test]
async fn boosted_attack_lands_clamped_on_every_replica() {
    let (a, b) = duelists(10.0).await;
    let session_id = start_duel(&a, &b).await;
    let (actor, target) = by_turn(&a, &b, &session_id);
    let mut target_events = target.subscribe();

    let entry = actor
        .submit_battle_action(
            &session_id,
            ActionRequest::attack(target.local_id().clone()).with_modifier(1.5),
        )
        .unwrap();
    assert!(entry.effect.clamped);
    assert!((entry.effect.damage - 12.0).abs() < 1e-9);

    let applied = expect_event!(target_events, ActionAppliedEvent);
    assert_eq!(applied.entry, entry);
    assert!(wait_for_turns(&[&a, &b], &session_id, 1).await);
    for node in [&a, &b] {
        assert!((hp(node, &session_id, target.local_id()) - 88.0).abs() < 1e-9);
    }
}

#[tokio::test]
async fn out_of_turn_and_unfair_actions_are_refused() {
    let (a, b) = duelists(10.0).await;
    let session_id = start_duel(&a, &b).await;
    let (actor, waiting) = by_turn(&a, &b, &session_id);
    let mut actor_events = actor.subscribe();

    let result =
        waiting.submit_battle_action(&session_id, ActionRequest::attack(actor.local_id().clone()));
    assert!(matches!(
        result,
        Err(PeerError::Battle(BattleError::NotYourTurn { current: Some(ref current) }))
            if current == actor.local_id()
    ));

    let result =
        actor.submit_battle_action(&session_id, ActionRequest::attack(actor.local_id().clone()));
    assert_eq!(
        result,
        Err(PeerError::Battle(BattleError::Fairness(
            FairnessViolation::SelfTarget
        )))
    );
    let rejection = expect_event!(actor_events, FairnessRejectedEvent);
    assert_eq!(rejection.violation, FairnessViolation::SelfTarget);

    // the turn is still the actor's to play
    assert_eq!(
        current_actor(&a, &session_id).as_ref(),
        Some(actor.local_id())
    );
}

#[tokio::test]
async fn exchange_of_blows_resolves_identically() {
    let (a, b) = duelists(20.0).await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let session_id = start_duel(&a, &b).await;

    let max_turns = a.config().battle.max_turns;
    for turn in 0..max_turns {
        if in_phase(&a, &session_id, SessionPhase::Resolved) {
            break;
        }
        let (actor, target) = by_turn(&a, &b, &session_id);
        actor
            .submit_battle_action(&session_id, ActionRequest::attack(target.local_id().clone()))
            .unwrap();
        assert!(wait_for_turns(&[&a, &b], &session_id, turn + 1).await);
    }

    let a_result = expect_event!(a_events, BattleResolvedEvent);
    let b_result = expect_event!(b_events, BattleResolvedEvent);
    assert!(a_result.agrees_with(&b_result));
    assert!(!a_result.draw);
    assert!(a_result.winner_id.is_some());
}

#[tokio::test]
async fn silent_actor_forfeits_its_turn() {
    let (a, b) = duelists(10.0).await;
    let session_id = start_duel(&a, &b).await;
    let (silent, _) = by_turn(&a, &b, &session_id);
    let silent_id = silent.local_id().clone();
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    for events in [&mut a_events, &mut b_events] {
        let applied = expect_event!(*events, ActionAppliedEvent);
        assert_eq!(applied.entry.action.action_type, ActionType::Forfeit);
        assert_eq!(applied.entry.action.actor, silent_id);
        assert_eq!(applied.entry.turn, 0);
    }
    assert_ne!(current_actor(&a, &session_id), Some(silent_id));
}

#[tokio::test]
async fn cancelled_battle_aborts_on_both_sides() {
    let (a, b) = duelists(10.0).await;
    let mut b_events = b.subscribe();
    let session_id = start_duel(&a, &b).await;

    a.cancel_battle(&session_id).unwrap();

    let aborted = expect_event!(b_events, BattleAbortedEvent);
    assert_eq!(aborted.session_id, session_id);
    assert_eq!(
        aborted.reason,
        AbortReason::Cancelled {
            peer: a.local_id().clone()
        }
    );
    assert!(in_phase(&a, &session_id, SessionPhase::Aborted));
    assert!(matches!(
        a.cancel_battle(&session_id),
        Err(PeerError::Battle(BattleError::WrongPhase { .. }))
    ));
}

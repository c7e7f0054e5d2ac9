use duel_peer::{BattleInvitedEvent, Node};
use duel_shared::{
    battle::{BattleView, SessionPhase},
    messages::SessionId,
    PeerId,
};

use crate::wait::{next_event, wait_for, DEFAULT_TIMEOUT};

/// `proposer` challenges `opponent`, who accepts; returns once both replicas
/// are in progress
pub async fn start_duel(proposer: &Node, opponent: &Node) -> SessionId {
    let mut invites = opponent.subscribe();
    let session_id = proposer
        .propose_battle(opponent.local_id())
        .expect("opponent is connected");
    let invitation = next_event::<BattleInvitedEvent>(&mut invites, DEFAULT_TIMEOUT)
        .await
        .expect("invitation arrives");
    assert_eq!(invitation.session_id, session_id);
    opponent
        .accept_battle(&session_id)
        .expect("invitation can be accepted");

    let started = wait_for(DEFAULT_TIMEOUT, || {
        in_phase(proposer, &session_id, SessionPhase::InProgress)
            && in_phase(opponent, &session_id, SessionPhase::InProgress)
    })
    .await;
    assert!(started, "battle {} never started on both sides", session_id);
    session_id
}

pub fn in_phase(node: &Node, session_id: &SessionId, phase: SessionPhase) -> bool {
    node.battle_view(session_id)
        .map_or(false, |view| view.phase == phase)
}

pub fn current_actor(node: &Node, session_id: &SessionId) -> Option<PeerId> {
    let view = node.battle_view(session_id)?;
    view.state?.current_actor().cloned()
}

/// Actions committed to the replica behind `view`
pub fn committed_turns(view: &BattleView) -> u64 {
    view.state.as_ref().map_or(0, |state| state.turn())
}

/// Waits until every node's replica has committed `turns` actions or ended
pub async fn wait_for_turns(nodes: &[&Node], session_id: &SessionId, turns: u64) -> bool {
    wait_for(DEFAULT_TIMEOUT, || {
        nodes.iter().all(|node| {
            node.battle_view(session_id).map_or(false, |view| {
                view.phase.is_terminal() || committed_turns(&view) >= turns
            })
        })
    })
    .await
}

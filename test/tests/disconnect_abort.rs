use std::time::Duration;

use duel_peer::{
    BattleAbortedEvent, BattleInvitedEvent, PeerDisconnectedEvent, PeerError, PeerLeftEvent,
};
use duel_shared::{battle::SessionPhase, messages::AbortReason};
use duel_test::{
    connect, connected_mesh, expect_event, in_phase, next_event, spawn_node, start_duel, wait_for,
};

#[tokio::test]
async fn departed_participant_aborts_the_battle() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;
    let session_id = start_duel(&a, &b).await;
    let mut events = a.subscribe();
    let b_id = b.local_id().clone();

    b.shutdown();

    let lost = expect_event!(events, PeerDisconnectedEvent);
    assert_eq!(lost, b_id);
    let aborted = expect_event!(events, BattleAbortedEvent);
    assert_eq!(aborted.session_id, session_id);
    assert_eq!(aborted.reason, AbortReason::Disconnect { peer: b_id.clone() });
    assert!(in_phase(&a, &session_id, SessionPhase::Aborted));

    // reconnection gives up once the schedule runs out
    let left = next_event::<PeerLeftEvent>(&mut events, Duration::from_secs(10)).await;
    assert_eq!(left, Some(b_id.clone()));
    assert!(a.connection_state(&b_id).is_none());
}

#[tokio::test]
async fn one_departure_aborts_the_brawl_for_everyone_left() {
    let nodes = connected_mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut b_invites = b.subscribe();
    let mut c_invites = c.subscribe();

    let session_id = a
        .propose_battle_with(vec![b.local_id().clone(), c.local_id().clone()])
        .unwrap();
    for (node, invites) in [(b, &mut b_invites), (c, &mut c_invites)] {
        let invitation = expect_event!(*invites, BattleInvitedEvent);
        assert_eq!(invitation.session_id, session_id);
        node.accept_battle(&session_id).unwrap();
    }
    assert!(
        wait_for(Duration::from_secs(5), || nodes
            .iter()
            .all(|node| in_phase(node, &session_id, SessionPhase::InProgress)))
        .await
    );

    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    let c_id = c.local_id().clone();
    c.shutdown();

    for (node, events) in [(a, &mut a_events), (b, &mut b_events)] {
        let aborted = expect_event!(*events, BattleAbortedEvent);
        assert_eq!(aborted.session_id, session_id);
        assert_eq!(aborted.reason, AbortReason::Disconnect { peer: c_id.clone() });
        assert!(in_phase(node, &session_id, SessionPhase::Aborted));
    }
}

#[tokio::test]
async fn shut_down_node_refuses_work() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;

    a.shutdown();
    assert!(a.is_shut_down());
    assert!(wait_for(Duration::from_secs(5), || b.connected_peers().is_empty()).await);
    assert_eq!(
        a.send_chat("anyone?", None),
        Err(PeerError::Shutdown)
    );
}

#[tokio::test]
async fn dropping_the_last_handle_closes_links() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    connect(&a, &b).await;
    let mut events = a.subscribe();
    let b_id = b.local_id().clone();

    drop(b);

    let lost = expect_event!(events, PeerDisconnectedEvent);
    assert_eq!(lost, b_id);
}

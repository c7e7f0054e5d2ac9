use std::{collections::BTreeMap, time::Duration};

use duel_peer::{
    GroupError, GroupEventTriggeredEvent, GroupInvitedEvent, GroupPhaseOpenedEvent, Node,
    PeerError,
};
use duel_shared::{
    messages::{CeremonyKind, CeremonyPhase, CeremonyState},
    GroupConfig, PeerId,
};
use duel_test::{connect, expect_event, spawn_node_with, test_config};

/// Three linked nodes whose activities need all three
async fn party() -> Vec<Node> {
    let group = GroupConfig::default()
        .with_invitation_timeout(Duration::from_secs(2))
        .with_min_participants(3);
    let config = test_config().with_group(group);
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(spawn_node_with(config.clone()).await);
    }
    connect(&nodes[0], &nodes[1]).await;
    connect(&nodes[0], &nodes[2]).await;
    connect(&nodes[1], &nodes[2]).await;
    nodes
}

fn sorted(nodes: &[&Node]) -> Vec<PeerId> {
    let mut ids: Vec<PeerId> = nodes.iter().map(|node| node.local_id().clone()).collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn activity_triggers_once_everyone_accepts() {
    let nodes = party().await;
    let (host, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut host_events = host.subscribe();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let ceremony_id = host
        .invite_to_activity("raid", vec![b.local_id().clone(), c.local_id().clone()])
        .unwrap();

    for (node, events) in [(b, &mut b_events), (c, &mut c_events)] {
        let invitation = expect_event!(*events, GroupInvitedEvent);
        assert_eq!(invitation.ceremony_id, ceremony_id);
        assert_eq!(invitation.kind, CeremonyKind::Activity);
        assert_eq!(&invitation.from, host.local_id());
        node.respond_to_ceremony(&ceremony_id, true).unwrap();
    }

    for events in [&mut host_events, &mut b_events, &mut c_events] {
        let outcome = expect_event!(*events, GroupEventTriggeredEvent);
        assert_eq!(outcome.ceremony_id, ceremony_id);
        assert_eq!(outcome.state, CeremonyState::Accepted);
        assert_eq!(outcome.participants, sorted(&[host, b, c]));
    }
}

#[tokio::test]
async fn one_decline_makes_the_activity_unreachable() {
    let nodes = party().await;
    let (host, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut host_events = host.subscribe();
    let mut b_events = b.subscribe();

    let ceremony_id = host
        .invite_to_activity("tournament", vec![b.local_id().clone(), c.local_id().clone()])
        .unwrap();
    expect_event!(b_events, GroupInvitedEvent);
    b.respond_to_ceremony(&ceremony_id, false).unwrap();

    let outcome = expect_event!(host_events, GroupEventTriggeredEvent);
    assert_eq!(outcome.state, CeremonyState::Declined);
    assert_eq!(outcome.participants, vec![host.local_id().clone()]);

    assert_eq!(
        b.respond_to_ceremony(&ceremony_id, true),
        Err(PeerError::Group(GroupError::AlreadyResponded {
            ceremony_id: ceremony_id.clone()
        }))
    );
}

#[tokio::test]
async fn unanswered_invitation_expires() {
    let nodes = party().await;
    let (host, b) = (&nodes[0], &nodes[1]);
    let mut host_events = host.subscribe();
    let mut b_events = b.subscribe();

    let ceremony_id = host.invite_peer(b.local_id(), "fishing").unwrap();
    let invitation = expect_event!(b_events, GroupInvitedEvent);
    assert_eq!(invitation.kind, CeremonyKind::Invitation);

    let outcome = expect_event!(host_events, GroupEventTriggeredEvent);
    assert_eq!(outcome.ceremony_id, ceremony_id);
    assert_eq!(outcome.state, CeremonyState::Expired);
    let outcome = expect_event!(b_events, GroupEventTriggeredEvent);
    assert_eq!(outcome.state, CeremonyState::Expired);
    assert_eq!(b.ceremony_state(&ceremony_id), Some(CeremonyState::Expired));
}

#[tokio::test]
async fn undersized_activity_is_refused_up_front() {
    let nodes = party().await;
    let (host, b) = (&nodes[0], &nodes[1]);

    assert_eq!(
        host.invite_to_activity("raid", vec![b.local_id().clone()]),
        Err(PeerError::Group(GroupError::Unreachable {
            invitees: 1,
            min: 3
        }))
    );
}

#[tokio::test]
async fn phased_activity_scores_every_vote_the_same_everywhere() {
    let nodes = party().await;
    let (host, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut host_events = host.subscribe();
    let mut b_events = b.subscribe();
    let mut c_events = c.subscribe();

    let phases = vec![
        CeremonyPhase::new("route", Duration::from_secs(5))
            .with_choice("left", "Take the river", 2)
            .with_choice("right", "Take the ridge", 5)
            .with_min_votes(3),
        CeremonyPhase::new("camp", Duration::from_secs(5))
            .with_choice("fire", "Light a fire", 1)
            .with_min_votes(1),
    ];
    let invitees = vec![b.local_id().clone(), c.local_id().clone()];
    let ceremony_id = host
        .invite_to_phased_activity("expedition", invitees, phases)
        .unwrap();
    for (node, events) in [(b, &mut b_events), (c, &mut c_events)] {
        expect_event!(*events, GroupInvitedEvent);
        node.respond_to_ceremony(&ceremony_id, true).unwrap();
    }

    for (node, events, choice) in [
        (b, &mut b_events, "left"),
        (c, &mut c_events, "right"),
        (host, &mut host_events, "right"),
    ] {
        let opening = expect_event!(*events, GroupPhaseOpenedEvent);
        assert_eq!(opening.ceremony_id, ceremony_id);
        assert_eq!(opening.index, 0);
        node.vote_in_ceremony(&ceremony_id, choice).unwrap();
    }

    let mut expected = BTreeMap::from([
        (host.local_id().clone(), 5),
        (b.local_id().clone(), 2),
        (c.local_id().clone(), 5),
    ]);
    for events in [&mut host_events, &mut b_events, &mut c_events] {
        let outcome = expect_event!(*events, GroupEventTriggeredEvent);
        assert_eq!(outcome.state, CeremonyState::Accepted);
        let summary = outcome.phase.unwrap();
        assert_eq!((summary.index, summary.last), (0, false));
        assert_eq!(
            summary.tally,
            BTreeMap::from([("left".to_string(), 1), ("right".to_string(), 2)])
        );
        assert_eq!(summary.scores, expected);
    }

    let opening = expect_event!(b_events, GroupPhaseOpenedEvent);
    assert_eq!(opening.name, "camp");
    b.vote_in_ceremony(&ceremony_id, "fire").unwrap();
    *expected.entry(b.local_id().clone()).or_default() += 1;

    for events in [&mut host_events, &mut b_events, &mut c_events] {
        let outcome = expect_event!(*events, GroupEventTriggeredEvent);
        let summary = outcome.phase.unwrap();
        assert!(summary.last);
        assert_eq!(summary.scores, expected);
    }
    for node in [host, b, c] {
        let history = node.ceremony_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].ceremony_id, ceremony_id);
        assert_eq!(history[0].scores, expected);
    }
    assert_eq!(
        c.vote_in_ceremony(&ceremony_id, "fire"),
        Err(PeerError::Group(GroupError::NoOpenPhase { ceremony_id }))
    );
}

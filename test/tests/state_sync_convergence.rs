use duel_peer::StateUpdatedEvent;
use duel_shared::messages::{CharacterFields, Position};
use duel_test::{assert_eventually, connect, connected_mesh, expect_event, spawn_node};

fn walking_to(x: f32, y: f32) -> CharacterFields {
    CharacterFields {
        position: Position::new(x, y),
        animation: "walk".to_string(),
        ..CharacterFields::default()
    }
}

#[tokio::test]
async fn update_reaches_every_peer() {
    let nodes = connected_mesh(3).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut b_events = b.subscribe();

    let snapshot = a.update_character(walking_to(3.0, 4.0)).unwrap();
    assert_eq!(snapshot.owner, *a.local_id());

    // the join greeting may still be in flight
    let seen = loop {
        let seen = expect_event!(b_events, StateUpdatedEvent);
        if seen.version == snapshot.version {
            break seen;
        }
    };
    assert_eq!(seen, snapshot);
    assert_eventually!(
        c.peer_snapshot(a.local_id()).as_ref() == Some(&snapshot),
        "third peer never caught up"
    );
}

#[tokio::test]
async fn unchanged_fields_are_not_rebroadcast() {
    let a = spawn_node().await;
    let first = a.update_character(walking_to(1.0, 1.0)).unwrap();
    assert_eq!(a.update_character(walking_to(1.0, 1.0)), None);
    assert_eq!(a.local_character().version, first.version);
}

#[tokio::test]
async fn latest_version_wins_everywhere() {
    let nodes = connected_mesh(2).await;
    let (a, b) = (&nodes[0], &nodes[1]);

    a.update_character(walking_to(1.0, 0.0));
    a.update_character(walking_to(2.0, 0.0));
    let last = a.update_character(walking_to(3.0, 0.0)).unwrap();

    assert_eventually!(
        b.peer_snapshot(a.local_id()).map(|s| s.version) == Some(last.version),
        "peer stuck on an old version"
    );
    let mirrored = b.peer_snapshot(a.local_id()).unwrap();
    assert_eq!(mirrored.position, Position::new(3.0, 0.0));
}

#[tokio::test]
async fn late_joiner_receives_current_state() {
    let a = spawn_node().await;
    let snapshot = a.update_character(walking_to(7.0, 2.0)).unwrap();

    let late = spawn_node().await;
    connect(&a, &late).await;

    assert_eventually!(
        late.peer_snapshot(a.local_id()).as_ref() == Some(&snapshot),
        "late joiner never got the greeting"
    );
    assert_eventually!(
        a.peer_snapshot(late.local_id()).is_some(),
        "greeting only went one way"
    );
}

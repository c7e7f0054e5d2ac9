use std::net::SocketAddr;

use duel_peer::{DiscoveryOutcome, IgnoreReason, PeerJoinedEvent};
use duel_shared::{NetworkConfig, NodeConfig};
use duel_test::{connect, expect_event, spawn_node, spawn_node_with, test_config};

fn source() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40_000))
}

#[tokio::test]
async fn first_announcement_admits_then_refreshes() {
    let a = spawn_node().await;
    let b = spawn_node().await;

    let announcement = a.local_announcement().unwrap();
    assert_eq!(
        b.handle_discovery_packet(&announcement, a.local_address()),
        DiscoveryOutcome::Admitted(a.local_id().clone())
    );
    assert_eq!(
        b.handle_discovery_packet(&announcement, a.local_address()),
        DiscoveryOutcome::Refreshed(a.local_id().clone())
    );
    assert_eq!(b.peers().len(), 1);
}

#[tokio::test]
async fn own_and_foreign_announcements_are_ignored() {
    let a = spawn_node().await;
    let stranger = spawn_node_with(test_config().with_network(
        NetworkConfig::new("another_network")
            .with_discovery_enabled(false)
            .with_listen_address("127.0.0.1:0".parse().unwrap()),
    ))
    .await;

    let own = a.local_announcement().unwrap();
    assert_eq!(
        a.handle_discovery_packet(&own, source()),
        DiscoveryOutcome::Ignored(IgnoreReason::SelfAnnouncement)
    );

    let foreign = stranger.local_announcement().unwrap();
    assert_eq!(
        a.handle_discovery_packet(&foreign, source()),
        DiscoveryOutcome::Ignored(IgnoreReason::NetworkMismatch)
    );

    assert_eq!(
        a.handle_discovery_packet(b"{\"networkID\":", source()),
        DiscoveryOutcome::Ignored(IgnoreReason::Malformed)
    );
    assert!(a.peers().is_empty());
}

#[tokio::test]
async fn full_registry_turns_newcomers_away() {
    let config: NodeConfig = test_config();
    let network = config.network.clone().with_max_peers(1);
    let crowded = spawn_node_with(config.with_network(network)).await;
    let first = spawn_node().await;
    let second = spawn_node().await;

    let outcome = crowded.handle_discovery_packet(&first.local_announcement().unwrap(), source());
    assert_eq!(outcome, DiscoveryOutcome::Admitted(first.local_id().clone()));

    let outcome = crowded.handle_discovery_packet(&second.local_announcement().unwrap(), source());
    assert_eq!(outcome, DiscoveryOutcome::Ignored(IgnoreReason::RegistryFull));
}

#[tokio::test]
async fn mutual_discovery_links_both_sides() {
    let a = spawn_node().await;
    let b = spawn_node().await;
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();

    connect(&a, &b).await;

    let joined = expect_event!(a_events, PeerJoinedEvent);
    assert_eq!(&joined.peer, b.local_id());
    let joined = expect_event!(b_events, PeerJoinedEvent);
    assert_eq!(&joined.peer, a.local_id());
    assert_eq!(a.connected_peers(), vec![b.local_id().clone()]);
}

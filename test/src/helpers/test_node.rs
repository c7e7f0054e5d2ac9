use std::time::Duration;

use duel_peer::Node;
use duel_shared::{
    BattleConfig, GroupConfig, LocalIdentity, NetworkConfig, NodeConfig, ReconnectConfig,
};

use crate::wait::{wait_for, DEFAULT_TIMEOUT};

pub const NETWORK_ID: &str = "duel_test";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loopback node with discovery off and every timeout shortened so failure
/// paths finish within a test's patience
pub fn test_config() -> NodeConfig {
    NodeConfig::new(NETWORK_ID)
        .with_network(
            NetworkConfig::new(NETWORK_ID)
                .with_discovery_enabled(false)
                .with_handshake_timeout(Duration::from_millis(500))
                .with_listen_address("127.0.0.1:0".parse().expect("loopback address")),
        )
        .with_reconnect(
            ReconnectConfig::default()
                .with_base_delay(Duration::from_millis(50))
                .with_max_delay(Duration::from_millis(200))
                .with_max_attempts(3),
        )
        .with_battle(
            BattleConfig::default()
                .with_turn_timeout(Duration::from_secs(2))
                .with_forfeit_grace(Duration::from_millis(200))
                .with_invite_timeout(Duration::from_secs(3)),
        )
        .with_group(GroupConfig::default().with_invitation_timeout(Duration::from_secs(2)))
}

pub async fn spawn_node() -> Node {
    spawn_node_with(test_config()).await
}

pub async fn spawn_node_with(config: NodeConfig) -> Node {
    init_logging();
    Node::start(config, LocalIdentity::generate())
        .await
        .expect("node starts on loopback")
}

/// Hands each node the other's discovery announcement, as if both had
/// heard the other's broadcast
pub fn introduce(a: &Node, b: &Node) {
    let from_a = a.local_announcement().expect("announcement encodes");
    let from_b = b.local_announcement().expect("announcement encodes");
    b.handle_discovery_packet(&from_a, a.local_address());
    a.handle_discovery_packet(&from_b, b.local_address());
}

/// Introduces the pair and waits until both report the link
pub async fn connect(a: &Node, b: &Node) {
    introduce(a, b);
    let linked = wait_for(DEFAULT_TIMEOUT, || {
        a.connected_peers().contains(b.local_id()) && b.connected_peers().contains(a.local_id())
    })
    .await;
    assert!(linked, "{} and {} never linked", a.local_id(), b.local_id());
}

/// `count` nodes, all linked to each other
pub async fn connected_mesh(count: usize) -> Vec<Node> {
    let mut nodes = Vec::with_capacity(count);
    for _ in 0..count {
        nodes.push(spawn_node().await);
    }
    for i in 0..count {
        for j in (i + 1)..count {
            connect(&nodes[i], &nodes[j]).await;
        }
    }
    nodes
}

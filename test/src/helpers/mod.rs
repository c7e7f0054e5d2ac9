pub mod assertions;
pub mod battle;
pub mod raw_peer;
pub mod test_node;
pub mod wait;

pub use battle::{committed_turns, current_actor, in_phase, start_duel, wait_for_turns};
pub use raw_peer::RawPeer;
pub use test_node::{
    connect, connected_mesh, init_logging, introduce, spawn_node, spawn_node_with, test_config,
    NETWORK_ID,
};
pub use wait::{next_event, wait_for, DEFAULT_TIMEOUT};

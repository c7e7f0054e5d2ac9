//! Loopback harness for end-to-end tests of duel peers.

pub mod helpers;

pub use helpers::*;

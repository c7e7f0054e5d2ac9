use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// The literal `"discovery"` type tag
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DiscoveryTag {
    #[default]
    #[serde(rename = "discovery")]
    Discovery,
}

/// Presence announcement broadcast over UDP.
///
/// Unsigned: it only tells a node where to dial. Everything after that goes
/// through signed envelopes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryPacket {
    #[serde(rename = "type")]
    pub tag: DiscoveryTag,
    #[serde(rename = "networkID")]
    pub network_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: PeerId,
    /// Stream listening address of the announcing node
    pub address: SocketAddr,
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
}

impl DiscoveryPacket {
    pub fn new(network_id: &str, public_key: PeerId, address: SocketAddr, timestamp: u64) -> Self {
        Self {
            tag: DiscoveryTag::Discovery,
            network_id: network_id.to_string(),
            public_key,
            address,
            timestamp,
            capabilities: Vec::new(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Address to dial, given the datagram's source
    pub fn dial_address(&self, source: SocketAddr) -> SocketAddr {
        super::resolve_announced_address(self.address, source)
    }
}

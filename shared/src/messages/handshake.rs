use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// First envelope sent in each direction on a new stream
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakePayload {
    #[serde(rename = "networkID")]
    pub network_id: String,
    #[serde(rename = "publicKey")]
    pub public_key: PeerId,
    pub address: SocketAddr,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl HandshakePayload {
    /// Address to reconnect to, given the stream's remote address
    pub fn dial_address(&self, source: SocketAddr) -> SocketAddr {
        super::resolve_announced_address(self.address, source)
    }
}

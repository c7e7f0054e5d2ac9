use std::{net::SocketAddr, sync::Arc};

use log::{debug, info, trace, warn};
use tokio::{net::UdpSocket, sync::watch, time};

use duel_shared::{
    decode_discovery, encode_discovery, messages::DiscoveryPacket, CodecError, NetworkConfig, PeerId,
    PeerIdentity, Timestamp, MAX_DISCOVERY_PACKET_SIZE,
};

use crate::registry::{Admission, PeerRegistry};

/// Why an announcement did not change the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    NetworkMismatch,
    SelfAnnouncement,
    RegistryFull,
    Malformed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// New peer, ready to be handed to the connection manager
    Admitted(PeerId),
    /// Known peer, last-seen refreshed
    Refreshed(PeerId),
    Ignored(IgnoreReason),
}

/// Admission control for presence announcements
pub struct Discovery {
    local: PeerId,
    config: NetworkConfig,
    registry: Arc<PeerRegistry>,
}

impl Discovery {
    pub fn new(local: PeerId, config: NetworkConfig, registry: Arc<PeerRegistry>) -> Self {
        Self {
            local,
            config,
            registry,
        }
    }

    /// Evaluates one datagram received from `source`
    pub fn handle_packet(&self, bytes: &[u8], source: SocketAddr) -> DiscoveryOutcome {
        let packet = match decode_discovery(bytes) {
            Ok(packet) => packet,
            Err(err) => {
                trace!("discarding discovery datagram from {}: {}", source, err);
                return DiscoveryOutcome::Ignored(IgnoreReason::Malformed);
            }
        };

        if packet.network_id != self.config.network_id {
            trace!(
                "ignoring announcement for network '{}' from {}",
                packet.network_id,
                source
            );
            return DiscoveryOutcome::Ignored(IgnoreReason::NetworkMismatch);
        }
        if packet.public_key == self.local {
            return DiscoveryOutcome::Ignored(IgnoreReason::SelfAnnouncement);
        }

        let identity = match PeerIdentity::new(
            packet.public_key.clone(),
            &packet.network_id,
            packet.dial_address(source),
            Timestamp::now(),
        ) {
            Ok(identity) => identity.with_capabilities(packet.capabilities.clone()),
            Err(err) => {
                debug!("announcement from {} has a bad key: {}", source, err);
                return DiscoveryOutcome::Ignored(IgnoreReason::Malformed);
            }
        };

        match self.registry.admit(identity) {
            Admission::Admitted => {
                info!(
                    "discovered peer {} at {}",
                    packet.public_key.short(),
                    packet.dial_address(source)
                );
                DiscoveryOutcome::Admitted(packet.public_key)
            }
            Admission::Refreshed => DiscoveryOutcome::Refreshed(packet.public_key),
            Admission::Full => {
                debug!(
                    "registry full, ignoring peer {}",
                    packet.public_key.short()
                );
                DiscoveryOutcome::Ignored(IgnoreReason::RegistryFull)
            }
        }
    }
}

/// Broadcasts `announcement()` every interval and feeds received datagrams
/// to `on_packet` until shutdown
pub(crate) async fn run_discovery_loop<A, H>(
    socket: UdpSocket,
    config: NetworkConfig,
    announcement: A,
    on_packet: H,
    mut shutdown: watch::Receiver<bool>,
) where
    A: Fn() -> Result<Vec<u8>, CodecError>,
    H: Fn(&[u8], SocketAddr),
{
    let target = SocketAddr::new(config.broadcast_address, config.discovery_port);
    let mut ticker = time::interval(config.discovery_interval);
    let mut buffer = vec![0u8; MAX_DISCOVERY_PACKET_SIZE];

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match announcement() {
                    Ok(bytes) => {
                        if let Err(err) = socket.send_to(&bytes, target).await {
                            warn!("discovery broadcast to {} failed: {}", target, err);
                        }
                    }
                    Err(err) => warn!("could not encode announcement: {}", err),
                }
            }
            received = socket.recv_from(&mut buffer) => match received {
                Ok((len, source)) => on_packet(&buffer[..len], source),
                Err(err) => debug!("discovery receive failed: {}", err),
            },
        }
    }
    debug!("discovery loop stopped");
}

/// Encodes the local announcement
pub(crate) fn announcement_bytes(
    local: &PeerId,
    config: &NetworkConfig,
    address: SocketAddr,
) -> Result<Vec<u8>, CodecError> {
    let packet = DiscoveryPacket::new(
        &config.network_id,
        local.clone(),
        address,
        Timestamp::now(),
    )
    .with_capabilities(config.capabilities());
    encode_discovery(&packet)
}

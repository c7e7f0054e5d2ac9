use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::{
        mpsc::{self, error::TrySendError},
        watch,
    },
    time,
};

use duel_shared::{
    decode_envelope, encode_frame, CodecError, Envelope, LocalIdentity, MessageType,
    NetworkConfig, PeerId, PeerIdentity, ReconnectConfig, Timestamp,
};

use crate::{
    backoff::Backoff,
    error::PeerError,
    outbox::{Outgoing, Recipients},
    registry::{Admission, PeerRegistry},
};

use super::{
    handshake::{self, Greeting, HandshakeError},
    link::read_frame,
    Inbound,
};

const LINK_QUEUE_CAPACITY: usize = 256;

struct LinkHandle {
    id: u64,
    frames: mpsc::Sender<Vec<u8>>,
    // dropping this stops the link's reader
    _closed: watch::Sender<()>,
}

/// Owns every live stream link.
///
/// The lower of two peer ids dials; the other side accepts and, if the link
/// drops, waits for the dialer to come back before abandoning the peer.
pub(crate) struct ConnectionManager {
    identity: Arc<LocalIdentity>,
    network: NetworkConfig,
    reconnect: ReconnectConfig,
    registry: Arc<PeerRegistry>,
    advertised: SocketAddr,
    links: Mutex<HashMap<PeerId, LinkHandle>>,
    inbound: mpsc::Sender<Inbound>,
    next_link: AtomicU64,
    shutdown: watch::Receiver<bool>,
}

impl ConnectionManager {
    pub(crate) fn new(
        identity: Arc<LocalIdentity>,
        network: NetworkConfig,
        reconnect: ReconnectConfig,
        registry: Arc<PeerRegistry>,
        advertised: SocketAddr,
        inbound: mpsc::Sender<Inbound>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            network,
            reconnect,
            registry,
            advertised,
            links: Mutex::new(HashMap::new()),
            inbound,
            next_link: AtomicU64::new(1),
            shutdown,
        })
    }

    pub(crate) fn local(&self) -> &PeerId {
        self.identity.peer_id()
    }

    pub(crate) fn advertised(&self) -> SocketAddr {
        self.advertised
    }

    pub(crate) fn is_linked(&self, peer: &PeerId) -> bool {
        self.links.lock().contains_key(peer)
    }

    /// Seals the message once and queues it on every addressed live link.
    /// Returns how many links took it.
    ///
    /// Sealing happens under the links lock so every receiver sees strictly
    /// increasing sequence numbers.
    pub(crate) fn send(&self, outgoing: &Outgoing) -> usize {
        let links = self.links.lock();
        let targets: Vec<(&PeerId, &LinkHandle)> = match &outgoing.to {
            Recipients::All => links.iter().collect(),
            Recipients::Peers(peers) => peers
                .iter()
                .filter_map(|peer| {
                    let target = links.get_key_value(peer);
                    if target.is_none() {
                        debug!(
                            "no link to {}, skipping {}",
                            peer.short(),
                            outgoing.message_type.as_str()
                        );
                    }
                    target
                })
                .collect(),
        };
        if targets.is_empty() {
            return 0;
        }

        let frame = match self.seal(outgoing.message_type, outgoing.payload.clone()) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(
                    "could not seal {} message: {}",
                    outgoing.message_type.as_str(),
                    err
                );
                return 0;
            }
        };

        let mut delivered = 0;
        for (peer, link) in targets {
            match link.frames.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => warn!(
                    "outgoing queue to {} is full, dropping {}",
                    peer.short(),
                    outgoing.message_type.as_str()
                ),
                Err(TrySendError::Closed(_)) => debug!("link to {} is closing", peer.short()),
            }
        }
        delivered
    }

    fn seal(&self, message_type: MessageType, payload: Value) -> Result<Vec<u8>, CodecError> {
        let envelope = Envelope::seal_value(
            &self.identity,
            message_type,
            payload,
            self.identity.next_sequence(),
            Timestamp::now(),
        )?;
        encode_frame(&envelope, self.network.max_frame_size)
    }

    fn dials(&self, peer: &PeerId) -> bool {
        self.identity.peer_id() < peer
    }

    /// Connects to a discovered peer if the local side is the one that dials
    pub(crate) fn connect(self: &Arc<Self>, peer: PeerId) {
        if !self.dials(&peer) || !self.registry.begin_connect(&peer) {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(err) = manager.dial(&peer).await {
                debug!("dial to {} failed: {}", peer.short(), err);
                manager.registry.connect_failed(&peer);
                if !manager.registry.is_connected(&peer) {
                    manager.spawn_recovery(peer);
                }
            }
        });
    }

    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.clone();
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let manager = self.clone();
                        tokio::spawn(async move {
                            if let Err(err) = manager.accept(stream, remote).await {
                                debug!("inbound connection from {} refused: {}", remote, err);
                            }
                        });
                    }
                    Err(err) => warn!("accept failed: {}", err),
                },
            }
        }
        debug!("accept loop stopped");
    }

    async fn accept(
        self: Arc<Self>,
        mut stream: TcpStream,
        remote: SocketAddr,
    ) -> Result<(), HandshakeError> {
        let greeting = self.handshake(&mut stream, None).await?;
        let hello = &greeting.payload;
        let identity = PeerIdentity::new(
            hello.public_key.clone(),
            &hello.network_id,
            hello.dial_address(remote),
            Timestamp::now(),
        )?
        .with_capabilities(hello.capabilities.clone());

        if self.registry.admit(identity) == Admission::Full {
            return Err(HandshakeError::Refused);
        }
        self.register(stream, greeting).await
    }

    async fn dial(self: &Arc<Self>, peer: &PeerId) -> Result<(), HandshakeError> {
        let address = self
            .registry
            .identity(peer)
            .map(|identity| identity.address)
            .ok_or(HandshakeError::Refused)?;

        let mut stream = time::timeout(self.network.handshake_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| HandshakeError::Timeout)?
            .map_err(|err| PeerError::io("connecting", err))?;
        let greeting = self.handshake(&mut stream, Some(peer)).await?;
        self.register(stream, greeting).await
    }

    async fn handshake(
        &self,
        stream: &mut TcpStream,
        expected: Option<&PeerId>,
    ) -> Result<Greeting, HandshakeError> {
        time::timeout(
            self.network.handshake_timeout,
            handshake::exchange(
                stream,
                &self.identity,
                &self.network,
                self.advertised,
                expected,
            ),
        )
        .await
        .map_err(|_| HandshakeError::Timeout)?
    }

    async fn register(
        self: &Arc<Self>,
        stream: TcpStream,
        greeting: Greeting,
    ) -> Result<(), HandshakeError> {
        let peer = greeting.payload.public_key.clone();
        if let Err(rejection) = self.registry.verify_handshake(&greeting.envelope) {
            debug!("handshake from {} rejected: {}", peer.short(), rejection);
            return Err(HandshakeError::Refused);
        }

        let link_id = self.next_link.fetch_add(1, Ordering::Relaxed);
        let (frames_tx, frames_rx) = mpsc::channel(LINK_QUEUE_CAPACITY);
        let (closed_tx, closed_rx) = watch::channel(());
        {
            let mut links = self.links.lock();
            if !self.registry.mark_connected(&peer, link_id) {
                debug!("already linked to {}, dropping duplicate", peer.short());
                return Err(HandshakeError::Refused);
            }
            links.insert(
                peer.clone(),
                LinkHandle {
                    id: link_id,
                    frames: frames_tx,
                    _closed: closed_tx,
                },
            );
        }
        info!("connected to {}", peer.short());

        // joined must reach the dispatcher before anything the link reads
        self.notify(Inbound::Joined(peer.clone())).await;

        let (reader, writer) = stream.into_split();
        tokio::spawn(
            self.clone()
                .write_loop(peer.clone(), link_id, writer, frames_rx),
        );
        tokio::spawn(self.clone().read_loop(peer, link_id, reader, closed_rx));
        Ok(())
    }

    async fn read_loop(
        self: Arc<Self>,
        peer: PeerId,
        link_id: u64,
        mut reader: OwnedReadHalf,
        mut closed: watch::Receiver<()>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => return,
                _ = closed.changed() => return,
                frame = read_frame(&mut reader, self.network.max_frame_size) => frame,
            };
            match frame {
                Ok(Some(body)) => self.receive(&peer, &body).await,
                Ok(None) => {
                    debug!("{} closed the link", peer.short());
                    break;
                }
                Err(err) => {
                    debug!("link to {} failed: {}", peer.short(), err);
                    break;
                }
            }
        }
        self.link_closed(peer, link_id).await;
    }

    async fn receive(&self, peer: &PeerId, body: &[u8]) {
        let envelope = match decode_envelope(body) {
            Ok(envelope) => envelope,
            Err(err) => {
                debug!("malformed frame from {}: {}", peer.short(), err);
                return;
            }
        };
        if envelope.sender_id() != peer {
            debug!(
                "{} forwarded an envelope signed by {}, dropping",
                peer.short(),
                envelope.sender_id().short()
            );
            return;
        }
        match self.registry.verify(&envelope) {
            Ok(()) => self.notify(Inbound::Envelope(envelope)).await,
            Err(rejection) => debug!(
                "dropping {} from {}: {}",
                envelope.message_type().as_str(),
                peer.short(),
                rejection
            ),
        }
    }

    async fn write_loop(
        self: Arc<Self>,
        peer: PeerId,
        link_id: u64,
        mut writer: OwnedWriteHalf,
        mut frames: mpsc::Receiver<Vec<u8>>,
    ) {
        let mut shutdown = self.shutdown.clone();
        loop {
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                frame = frames.recv() => frame,
            };
            let Some(frame) = frame else {
                break;
            };
            if let Err(err) = writer.write_all(&frame).await {
                debug!("write to {} failed: {}", peer.short(), err);
                self.link_closed(peer.clone(), link_id).await;
                break;
            }
        }
        let _ = writer.shutdown().await;
    }

    async fn link_closed(self: &Arc<Self>, peer: PeerId, link_id: u64) {
        {
            let mut links = self.links.lock();
            if links.get(&peer).map(|link| link.id) == Some(link_id) {
                links.remove(&peer);
            }
        }
        if !self.registry.mark_lost(&peer, link_id) || *self.shutdown.borrow() {
            return;
        }
        info!("lost link to {}", peer.short());
        self.notify(Inbound::Lost(peer.clone())).await;
        self.spawn_recovery(peer);
    }

    fn spawn_recovery(self: &Arc<Self>, peer: PeerId) {
        let manager = self.clone();
        let recovery: Pin<Box<dyn Future<Output = ()> + Send>> = Box::pin(async move {
            if manager.dials(&peer) {
                manager.redial(peer).await;
            } else {
                manager.await_return(peer).await;
            }
        });
        tokio::spawn(recovery);
    }

    async fn redial(self: Arc<Self>, peer: PeerId) {
        let mut backoff = Backoff::new(self.reconnect.clone());
        let mut shutdown = self.shutdown.clone();

        while let Some(delay) = backoff.next_delay() {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = time::sleep(delay) => {}
            }
            if self.registry.is_connected(&peer) {
                return;
            }
            if !self.registry.begin_connect(&peer) {
                if !self.registry.contains(&peer) {
                    return;
                }
                continue;
            }
            match self.dial(&peer).await {
                Ok(()) => return,
                Err(err) => {
                    debug!(
                        "reconnect attempt {} to {} failed: {}",
                        backoff.attempt(),
                        peer.short(),
                        err
                    );
                    self.registry.connect_failed(&peer);
                }
            }
        }
        self.abandon(&peer).await;
    }

    /// Waits out the dialer's whole reconnection schedule
    async fn await_return(self: Arc<Self>, peer: PeerId) {
        let generation = self.registry.generation(&peer);
        let attempts = self.reconnect.max_attempts;
        let budget = Backoff::total_budget(&self.reconnect)
            + self.network.handshake_timeout.saturating_mul(attempts);

        let mut shutdown = self.shutdown.clone();
        tokio::select! {
            _ = shutdown.changed() => return,
            _ = time::sleep(budget) => {}
        }
        if self.registry.is_connected(&peer) || self.registry.generation(&peer) != generation {
            return;
        }
        self.abandon(&peer).await;
    }

    async fn abandon(&self, peer: &PeerId) {
        if self.registry.is_connected(peer) {
            return;
        }
        match self.registry.abandon(peer) {
            Some(true) => {
                warn!("giving up on {}", peer.short());
                self.notify(Inbound::Left(peer.clone())).await;
            }
            Some(false) => debug!("forgetting unreachable peer {}", peer.short()),
            None => {}
        }
    }

    async fn notify(&self, inbound: Inbound) {
        if self.inbound.send(inbound).await.is_err() {
            debug!("dispatcher is gone, dropping connection notification");
        }
    }
}

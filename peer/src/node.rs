use std::{
    collections::BTreeMap,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, trace};
use parking_lot::Mutex;
use tokio::{
    net::{TcpListener, UdpSocket},
    sync::{mpsc, watch},
    task::JoinHandle,
    time,
};

use duel_shared::{
    battle::{BattleView, LoggedAction},
    messages::{
        CeremonyId, CeremonyKind, CeremonyPhase, CeremonyState, CharacterFields,
        CharacterStateSnapshot, ChatPayload, GroupEventPayload, SessionId,
    },
    Envelope, LocalIdentity, MessageType, NodeConfig, PeerId, Timestamp,
};

use crate::{
    battle::{ActionRequest, BattleCoordinator},
    connection::{ConnectionManager, Inbound},
    discovery::{announcement_bytes, run_discovery_loop, Discovery, DiscoveryOutcome},
    error::{BattleError, GroupError, PeerError},
    events::{ChatMessage, Event, EventBus, EventSubscription, PeerEvent, PeerJoined},
    group::{CompletedCeremony, GroupCoordinator},
    outbox::Outbox,
    registry::{ConnectionState, PeerInfo, PeerRegistry},
    sync::StateSynchronizer,
};

const INBOUND_CAPACITY: usize = 1024;
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(100);

/// State machines driven by inbound envelopes and timers. Always accessed
/// under one lock so outgoing messages leave in the order they were decided.
struct NodeCore {
    sync: StateSynchronizer,
    groups: GroupCoordinator,
    battles: BattleCoordinator,
}

struct NodeInner {
    identity: Arc<LocalIdentity>,
    config: NodeConfig,
    local_address: SocketAddr,
    registry: Arc<PeerRegistry>,
    discovery: Discovery,
    connections: Arc<ConnectionManager>,
    core: Mutex<NodeCore>,
    events: EventBus,
    shutdown: watch::Receiver<bool>,
}

/// A running peer: discovery, authenticated links, state mirroring, group
/// ceremonies and battles, behind one handle.
///
/// Cloning is cheap and every clone drives the same peer. Background tasks
/// stop on [`Node::shutdown`] or once the last clone is dropped.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl Node {
    /// Binds the stream listener (and the discovery socket when enabled) and
    /// spawns the background tasks. Must be called inside a tokio runtime.
    pub async fn start(config: NodeConfig, identity: LocalIdentity) -> Result<Self, PeerError> {
        config.validate()?;
        let identity = Arc::new(identity);
        let local = identity.peer_id().clone();
        let network = config.network.clone();

        let listener = TcpListener::bind(network.listen_address)
            .await
            .map_err(|err| PeerError::io("binding stream listener", err))?;
        let local_address = listener
            .local_addr()
            .map_err(|err| PeerError::io("reading listener address", err))?;
        let discovery_socket = if network.discovery_enabled {
            Some(bind_discovery(network.discovery_port).await?)
        } else {
            None
        };

        let registry = Arc::new(PeerRegistry::new(
            local.clone(),
            network.max_peers,
            network.max_message_age,
            network.max_clock_skew,
        ));
        let (shutdown_sender, shutdown) = watch::channel(false);
        let (inbound_sender, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let connections = ConnectionManager::new(
            identity.clone(),
            network.clone(),
            config.reconnect.clone(),
            registry.clone(),
            local_address,
            inbound_sender,
            shutdown.clone(),
        );

        let now = Instant::now();
        let core = NodeCore {
            sync: StateSynchronizer::new(local.clone(), &config.sync, now),
            groups: GroupCoordinator::new(local.clone(), config.group.clone()),
            battles: BattleCoordinator::new(local.clone(), config.battle.clone()),
        };
        let inner = Arc::new(NodeInner {
            discovery: Discovery::new(local.clone(), network.clone(), registry.clone()),
            identity,
            config,
            local_address,
            registry,
            connections: connections.clone(),
            core: Mutex::new(core),
            events: EventBus::new(),
            shutdown: shutdown.clone(),
        });

        tokio::spawn(connections.accept_loop(listener));
        tokio::spawn(dispatch_loop(inner.clone(), inbound));
        tokio::spawn(maintenance_loop(inner.clone()));
        if let Some(socket) = discovery_socket {
            let announcer = inner.clone();
            let receiver = inner.clone();
            tokio::spawn(run_discovery_loop(
                socket,
                network,
                move || announcer.announcement(),
                move |bytes, source| {
                    receiver.handle_discovery(bytes, source);
                },
                shutdown,
            ));
        }

        info!("node {} listening on {}", local.short(), local_address);
        Ok(Self {
            inner,
            shutdown: Arc::new(shutdown_sender),
        })
    }

    /// Stops every background task and closes all links. Does not wait for
    /// the tasks to finish.
    pub fn shutdown(&self) {
        if !*self.shutdown.borrow() {
            info!("node {} shutting down", self.local_id().short());
            let _ = self.shutdown.send(true);
        }
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub fn local_id(&self) -> &PeerId {
        self.inner.identity.peer_id()
    }

    /// Address of the stream listener
    pub fn local_address(&self) -> SocketAddr {
        self.inner.local_address
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Every known peer, ordered by id
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.inner.registry.peers()
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers = self.inner.registry.connected();
        peers.sort();
        peers
    }

    pub fn connection_state(&self, peer: &PeerId) -> Option<ConnectionState> {
        self.inner.registry.state(peer)
    }

    pub fn subscribe(&self) -> EventSubscription {
        self.inner.events.subscribe()
    }

    /// Calls `handler` for every event of kind `V` until shutdown
    pub fn on<V, F>(&self, mut handler: F) -> JoinHandle<()>
    where
        V: Event + Send + 'static,
        V::Item: Send + 'static,
        F: FnMut(V::Item) + Send + 'static,
    {
        let mut subscription = self.subscribe();
        let mut shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    item = subscription.recv_kind::<V>() => match item {
                        Some(item) => handler(item),
                        None => break,
                    },
                }
            }
        })
    }

    // Discovery

    /// Feeds one discovery datagram through admission and dials the peer if
    /// it is new (or known but unlinked) and the local side is the dialer
    pub fn handle_discovery_packet(&self, bytes: &[u8], source: SocketAddr) -> DiscoveryOutcome {
        self.inner.handle_discovery(bytes, source)
    }

    /// The datagram this node broadcasts
    pub fn local_announcement(&self) -> Result<Vec<u8>, PeerError> {
        Ok(self.inner.announcement()?)
    }

    // State

    /// Replaces the local character fields, broadcasting them if they changed
    pub fn update_character(&self, fields: CharacterFields) -> Option<CharacterStateSnapshot> {
        self.inner
            .with_core(|core, now, outbox| core.sync.update_local(fields, now, outbox))
    }

    pub fn local_character(&self) -> CharacterStateSnapshot {
        self.inner.core.lock().sync.local_snapshot()
    }

    pub fn peer_snapshot(&self, peer: &PeerId) -> Option<CharacterStateSnapshot> {
        self.inner.core.lock().sync.snapshot(peer).cloned()
    }

    // Chat

    /// Broadcasts `text`, or sends it to `to` only
    pub fn send_chat(&self, text: &str, to: Option<&PeerId>) -> Result<(), PeerError> {
        self.inner.running()?;
        let payload = ChatPayload {
            text: text.to_string(),
            to: to.cloned(),
        };
        let mut outbox = Outbox::new();
        match to {
            Some(peer) => {
                self.inner.require_connected(peer)?;
                outbox.send(vec![peer.clone()], MessageType::Chat, &payload);
            }
            None => outbox.broadcast(MessageType::Chat, &payload),
        }
        self.inner.flush(outbox);
        Ok(())
    }

    // Battles

    pub fn propose_battle(&self, opponent: &PeerId) -> Result<SessionId, PeerError> {
        self.propose_battle_with(vec![opponent.clone()])
    }

    /// Invites every opponent into one session
    pub fn propose_battle_with(&self, opponents: Vec<PeerId>) -> Result<SessionId, PeerError> {
        self.inner.running()?;
        for peer in &opponents {
            if peer != self.local_id() && !self.inner.registry.is_connected(peer) {
                return Err(BattleError::ParticipantNotConnected { peer: peer.clone() }.into());
            }
        }
        let session_id = self
            .inner
            .with_core(|core, now, outbox| core.battles.propose(opponents, now, outbox))?;
        Ok(session_id)
    }

    pub fn accept_battle(&self, session_id: &SessionId) -> Result<(), PeerError> {
        self.inner.running()?;
        self.inner
            .with_core(|core, now, outbox| core.battles.accept(session_id, now, outbox))?;
        Ok(())
    }

    pub fn decline_battle(&self, session_id: &SessionId) -> Result<(), PeerError> {
        self.inner.running()?;
        self.inner
            .with_core(|core, now, outbox| core.battles.decline(session_id, now, outbox))?;
        Ok(())
    }

    pub fn cancel_battle(&self, session_id: &SessionId) -> Result<(), PeerError> {
        self.inner.running()?;
        self.inner
            .with_core(|core, now, outbox| core.battles.cancel(session_id, now, outbox))?;
        Ok(())
    }

    /// Submits the local action for the current turn. A fairness rejection
    /// leaves the turn open for another attempt.
    pub fn submit_battle_action(
        &self,
        session_id: &SessionId,
        request: ActionRequest,
    ) -> Result<LoggedAction, PeerError> {
        self.inner.running()?;
        let entry = self.inner.with_core(|core, now, outbox| {
            core.battles.submit(session_id, request, now, outbox)
        })?;
        Ok(entry)
    }

    pub fn battle_view(&self, session_id: &SessionId) -> Option<BattleView> {
        self.inner
            .core
            .lock()
            .battles
            .view(session_id, Instant::now())
    }

    pub fn battles(&self) -> Vec<BattleView> {
        self.inner.core.lock().battles.views(Instant::now())
    }

    // Group ceremonies

    /// One-to-one invitation into `activity`
    pub fn invite_peer(&self, peer: &PeerId, activity: &str) -> Result<CeremonyId, PeerError> {
        self.open_ceremony(CeremonyKind::Invitation, activity, vec![peer.clone()])
    }

    /// Gathers a group for `activity`; it triggers once enough invitees
    /// accept before the deadline
    pub fn invite_to_activity(
        &self,
        activity: &str,
        invitees: Vec<PeerId>,
    ) -> Result<CeremonyId, PeerError> {
        self.open_ceremony(CeremonyKind::Activity, activity, invitees)
    }

    /// Like [`Node::invite_to_activity`]; once accepted, the participants
    /// vote through `phases` in order
    pub fn invite_to_phased_activity(
        &self,
        activity: &str,
        invitees: Vec<PeerId>,
        phases: Vec<CeremonyPhase>,
    ) -> Result<CeremonyId, PeerError> {
        self.check_invitees(&invitees)?;
        let ceremony_id = self.inner.with_core(|core, now, outbox| {
            core.groups.invite_phased(activity, invitees, phases, now, outbox)
        })?;
        Ok(ceremony_id)
    }

    /// Votes in the ceremony's open phase; a later vote replaces this one
    pub fn vote_in_ceremony(
        &self,
        ceremony_id: &CeremonyId,
        choice: &str,
    ) -> Result<(), PeerError> {
        self.inner.running()?;
        self.inner
            .with_core(|core, now, outbox| core.groups.vote(ceremony_id, choice, now, outbox))?;
        Ok(())
    }

    pub fn respond_to_ceremony(&self, ceremony_id: &CeremonyId, accept: bool) -> Result<(), PeerError> {
        self.inner.running()?;
        self.inner
            .with_core(|core, _, outbox| core.groups.respond(ceremony_id, accept, outbox))?;
        Ok(())
    }

    pub fn ceremony_state(&self, ceremony_id: &CeremonyId) -> Option<CeremonyState> {
        self.inner.core.lock().groups.state(ceremony_id)
    }

    pub fn ceremony_scores(&self, ceremony_id: &CeremonyId) -> Option<BTreeMap<PeerId, i64>> {
        self.inner.core.lock().groups.scores(ceremony_id)
    }

    /// Phased activities that ran through their last phase, oldest first
    pub fn ceremony_history(&self) -> Vec<CompletedCeremony> {
        self.inner.core.lock().groups.history()
    }

    fn open_ceremony(
        &self,
        kind: CeremonyKind,
        activity: &str,
        invitees: Vec<PeerId>,
    ) -> Result<CeremonyId, PeerError> {
        self.check_invitees(&invitees)?;
        let ceremony_id = self.inner.with_core(|core, now, outbox| {
            core.groups.invite(kind, activity, invitees, now, outbox)
        })?;
        Ok(ceremony_id)
    }

    fn check_invitees(&self, invitees: &[PeerId]) -> Result<(), PeerError> {
        self.inner.running()?;
        for peer in invitees {
            if peer != self.local_id() && !self.inner.registry.is_connected(peer) {
                return Err(GroupError::InviteeNotConnected { peer: peer.clone() }.into());
            }
        }
        Ok(())
    }
}

impl NodeInner {
    /// Runs `f` against the core and flushes what it produced, even when it
    /// fails: rejections still publish events
    fn with_core<T>(&self, f: impl FnOnce(&mut NodeCore, Instant, &mut Outbox) -> T) -> T {
        let mut outbox = Outbox::new();
        let mut core = self.core.lock();
        let result = f(&mut core, Instant::now(), &mut outbox);
        self.flush(outbox);
        result
    }

    fn flush(&self, outbox: Outbox) {
        for message in &outbox.messages {
            self.connections.send(message);
        }
        for event in outbox.events {
            self.events.publish(event);
        }
    }

    fn running(&self) -> Result<(), PeerError> {
        if *self.shutdown.borrow() {
            Err(PeerError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn require_connected(&self, peer: &PeerId) -> Result<(), PeerError> {
        if self.registry.is_connected(peer) {
            Ok(())
        } else {
            Err(PeerError::NotConnected { peer: peer.clone() })
        }
    }

    fn announcement(&self) -> Result<Vec<u8>, duel_shared::CodecError> {
        announcement_bytes(
            self.identity.peer_id(),
            &self.config.network,
            self.local_address,
        )
    }

    fn handle_discovery(&self, bytes: &[u8], source: SocketAddr) -> DiscoveryOutcome {
        let outcome = self.discovery.handle_packet(bytes, source);
        match &outcome {
            DiscoveryOutcome::Admitted(peer) => self.connections.connect(peer.clone()),
            DiscoveryOutcome::Refreshed(peer)
                if self.registry.state(peer) == Some(ConnectionState::Disconnected) =>
            {
                self.connections.connect(peer.clone())
            }
            _ => {}
        }
        outcome
    }

    fn dispatch(&self, inbound: Inbound) {
        self.with_core(|core, now, outbox| match inbound {
            Inbound::Joined(peer) => {
                let info = self
                    .registry
                    .peers()
                    .into_iter()
                    .find(|info| info.peer_id == peer);
                if let Some(info) = info {
                    outbox.emit(PeerEvent::PeerJoined(PeerJoined {
                        bot: info.is_bot(),
                        address: info.address,
                        peer: peer.clone(),
                    }));
                }
                core.sync.greet(&peer, outbox);
            }
            Inbound::Lost(peer) => {
                outbox.emit(PeerEvent::PeerDisconnected(peer.clone()));
                core.battles.peer_lost(&peer, now, outbox);
            }
            Inbound::Left(peer) => {
                core.battles.peer_lost(&peer, now, outbox);
                core.groups.peer_left(&peer, now, outbox);
                core.sync.evict(&peer);
                outbox.emit(PeerEvent::PeerLeft(peer));
            }
            Inbound::Envelope(envelope) => self.route(core, envelope, now, outbox),
        });
    }

    fn route(&self, core: &mut NodeCore, envelope: Envelope, now: Instant, outbox: &mut Outbox) {
        let sender = envelope.sender_id().clone();
        let message_type = envelope.message_type();
        match message_type {
            MessageType::StateSync => match envelope.open(message_type) {
                Ok(snapshot) => {
                    core.sync.apply_remote(&sender, snapshot, outbox);
                }
                Err(err) => debug!("bad state sync from {}: {}", sender.short(), err),
            },
            MessageType::Chat => match envelope.open::<ChatPayload>(message_type) {
                Ok(chat) => {
                    let local = self.identity.peer_id();
                    if chat.to.as_ref().is_some_and(|to| to != local) {
                        trace!("chat from {} addressed elsewhere", sender.short());
                        return;
                    }
                    outbox.emit(PeerEvent::ChatReceived(ChatMessage {
                        from: sender,
                        text: chat.text,
                        direct: chat.to.is_some(),
                    }));
                }
                Err(err) => debug!("bad chat from {}: {}", sender.short(), err),
            },
            MessageType::GroupEvent => match envelope.open::<GroupEventPayload>(message_type) {
                Ok(payload) => core.groups.on_event(&sender, payload, now, outbox),
                Err(err) => debug!("bad group event from {}: {}", sender.short(), err),
            },
            battle if battle.is_battle() => {
                core.battles
                    .on_message(&sender, battle, envelope.payload().clone(), now, outbox)
            }
            other => debug!(
                "unexpected {} envelope on a live link from {}",
                other.as_str(),
                sender.short()
            ),
        }
    }

    /// Timers: state rebroadcast, battle deadlines, ceremony expiry and
    /// forgetting discovered peers that went quiet
    fn maintain(&self) {
        self.with_core(|core, now, outbox| {
            core.sync.tick(now, outbox);
            core.battles.tick(now, outbox);
            core.groups.expire(now, outbox);
        });

        let silence = self.config.network.peer_silence_timeout.as_millis() as u64;
        let cutoff = Timestamp::now().saturating_sub(silence);
        for peer in self.registry.purge_silent(cutoff) {
            debug!("forgot silent peer {}", peer.short());
        }
    }
}

async fn bind_discovery(port: u16) -> Result<UdpSocket, PeerError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))
        .await
        .map_err(|err| PeerError::io("binding discovery socket", err))?;
    socket
        .set_broadcast(true)
        .map_err(|err| PeerError::io("enabling broadcast", err))?;
    Ok(socket)
}

async fn dispatch_loop(inner: Arc<NodeInner>, mut inbound: mpsc::Receiver<Inbound>) {
    let mut shutdown = inner.shutdown.clone();
    loop {
        let next = tokio::select! {
            _ = shutdown.changed() => break,
            next = inbound.recv() => next,
        };
        let Some(next) = next else {
            break;
        };
        inner.dispatch(next);
    }
    debug!("dispatcher stopped");
}

async fn maintenance_loop(inner: Arc<NodeInner>) {
    let mut shutdown = inner.shutdown.clone();
    let mut ticker = time::interval(MAINTENANCE_INTERVAL);
    ticker.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => inner.maintain(),
        }
    }
    debug!("maintenance stopped");
}

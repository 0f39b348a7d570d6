//! Per-topic gossip session
//!
//! One actor task per joined topic owns the neighbor links, the dedup
//! cache, reorder buffers and the local sequence counter. Everything else
//! (sender handles, receivers, link tasks, the node) talks to it through
//! its command queue and reads state through [`SessionShared`].
//!
//! Each neighbor link runs a writer task fed by a bounded outbox and a
//! reader task that forwards decoded frames back to the actor. Local
//! broadcasts wait for room in every outbox; a neighbor that cannot keep up
//! with relayed traffic is disconnected.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cache::{message_id, ReorderBuffer, SeenCache};
use super::dial::{Connected, Dialer};
use super::events::{CloseReason, Event, EventDispatcher, GossipMessage, SessionState};
use super::wire::{Frame, FrameSink, FrameStream, Link, LinkGuard, RejectReason};
use crate::address_book::AddressBook;
use crate::config::GossipConfig;
use crate::error::{BroadcastError, DialError};
use crate::types::{NodeId, PeerAddress, TopicId};

const COMMAND_QUEUE: usize = 256;

/// Identifies one session instance; a topic joined again after `leave`
/// gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Session state readable without going through the actor
#[derive(Debug)]
pub(crate) struct SessionShared {
    pub id: SessionId,
    pub topic: TopicId,
    pub closed: CancellationToken,
    pub dispatcher: EventDispatcher,
    state: watch::Sender<SessionState>,
    close_reason: RwLock<Option<CloseReason>>,
    neighbors: RwLock<BTreeSet<NodeId>>,
}

impl SessionShared {
    pub fn new(id: SessionId, topic: TopicId, event_capacity: usize) -> Self {
        let (state, _) = watch::channel(SessionState::Joining);
        Self {
            id,
            topic,
            closed: CancellationToken::new(),
            dispatcher: EventDispatcher::new(event_capacity),
            state,
            close_reason: RwLock::new(None),
            neighbors: RwLock::new(BTreeSet::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.read()
    }

    pub fn neighbors(&self) -> Vec<NodeId> {
        self.neighbors.read().iter().copied().collect()
    }

    fn set_neighbors(&self, neighbors: impl IntoIterator<Item = NodeId>) {
        *self.neighbors.write() = neighbors.into_iter().collect();
    }

    fn mark_closed(&self, reason: CloseReason) {
        *self.close_reason.write() = Some(reason);
        self.state.send_replace(SessionState::Closed);
        self.closed.cancel();
        self.dispatcher.close();
    }
}

/// A live session as seen by the node
#[derive(Debug, Clone)]
pub(crate) struct SessionHandle {
    pub shared: Arc<SessionShared>,
    pub commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn is_live(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    /// Ask the actor to close and wait until it has
    pub async fn close(&self, reason: CloseReason) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(Command::Leave {
                reason,
                reply: Some(reply),
            })
            .await
            .is_ok()
        {
            let _ = done.await;
        }
    }
}

/// Live sessions of a node by topic
pub(crate) type SessionRegistry = Arc<RwLock<HashMap<TopicId, SessionHandle>>>;

/// Messages to a session actor
pub(crate) enum Command {
    Broadcast {
        payload: Bytes,
        reply: oneshot::Sender<Result<Flood, BroadcastError>>,
    },
    /// Outbound handshake accepted
    Connected {
        peer: NodeId,
        link: Link,
        peers: Vec<PeerAddress>,
    },
    DialFailed {
        peer: NodeId,
        error: DialError,
    },
    /// Inbound handshake for this topic, not yet answered
    Admit {
        peer: NodeId,
        link: Link,
    },
    Dial {
        peers: Vec<NodeId>,
    },
    Frame {
        peer: NodeId,
        link_id: u64,
        frame: Frame,
    },
    LinkClosed {
        peer: NodeId,
        link_id: u64,
    },
    /// The neighbor stopped draining its outbox
    Evict {
        peer: NodeId,
        link_id: u64,
    },
    Leave {
        reason: CloseReason,
        reply: Option<oneshot::Sender<()>>,
    },
}

struct Neighbor {
    link_id: u64,
    initiator: NodeId,
    outbox: mpsc::Sender<Frame>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Neighbor {
    /// Stop reading and let the writer drain; returns the writer task
    fn release(self) -> JoinHandle<()> {
        self.reader.abort();
        drop(self.outbox);
        self.writer
    }
}

/// A locally originated frame and the outboxes it still has to reach
///
/// Delivered by the broadcasting task so a slow neighbor holds up the
/// caller rather than the session actor.
pub(crate) struct Flood {
    frame: Frame,
    targets: Vec<FloodTarget>,
    send_timeout: Duration,
}

struct FloodTarget {
    peer: NodeId,
    link_id: u64,
    outbox: mpsc::Sender<Frame>,
}

impl Flood {
    /// Queue the frame on every target, waiting for room.
    ///
    /// A neighbor that does not make room within the send timeout is
    /// reported to the session for eviction.
    pub async fn deliver(self, commands: &mpsc::Sender<Command>) {
        for target in self.targets {
            match target
                .outbox
                .send_timeout(self.frame.clone(), self.send_timeout)
                .await
            {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    let _ = commands
                        .send(Command::Evict {
                            peer: target.peer,
                            link_id: target.link_id,
                        })
                        .await;
                }
                // Link already gone; the reader reports it
                Err(SendTimeoutError::Closed(_)) => {}
            }
        }
    }
}

/// Everything a new session actor needs
pub(crate) struct SessionContext {
    pub local: NodeId,
    pub config: Arc<GossipConfig>,
    pub address_book: AddressBook,
    pub dialer: Dialer,
    pub registry: SessionRegistry,
}

/// Start the actor for `shared` and return its command sender.
///
/// An empty `bootstrap` activates the session at once; otherwise the
/// bootstrap peers are dialed and the session fails once all of them have.
pub(crate) fn spawn(
    shared: Arc<SessionShared>,
    ctx: SessionContext,
    bootstrap: Vec<NodeId>,
) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(COMMAND_QUEUE);
    let epoch = rand::random::<u64>();

    let actor = SessionActor {
        seen: SeenCache::new(ctx.config.seen_cache_capacity),
        reorder: ReorderBuffer::new(ctx.config.reorder_window),
        shared,
        local: ctx.local,
        config: ctx.config,
        address_book: ctx.address_book,
        dialer: ctx.dialer,
        registry: ctx.registry,
        commands: tx.downgrade(),
        neighbors: HashMap::new(),
        pending_dials: HashSet::new(),
        dials: JoinSet::new(),
        epoch,
        seq: 0,
        next_link_id: 0,
    };
    tokio::spawn(actor.run(rx, bootstrap));
    tx
}

struct SessionActor {
    shared: Arc<SessionShared>,
    local: NodeId,
    config: Arc<GossipConfig>,
    address_book: AddressBook,
    dialer: Dialer,
    registry: SessionRegistry,
    commands: mpsc::WeakSender<Command>,
    neighbors: HashMap<NodeId, Neighbor>,
    pending_dials: HashSet<NodeId>,
    dials: JoinSet<()>,
    seen: SeenCache,
    reorder: ReorderBuffer<(NodeId, Bytes)>,
    epoch: u64,
    seq: u64,
    next_link_id: u64,
}

impl SessionActor {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>, bootstrap: Vec<NodeId>) {
        info!(
            topic = ?self.shared.topic,
            session = %self.shared.id,
            bootstrap = bootstrap.len(),
            "Session started"
        );

        if bootstrap.is_empty() {
            self.activate();
        } else {
            self.dial(bootstrap);
        }

        let mut gap_check = tokio::time::interval(
            (self.config.reorder_timeout() / 2).max(Duration::from_millis(1)),
        );
        gap_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.close(CloseReason::Shutdown).await;
                        break;
                    };
                    if self.handle(command).await {
                        break;
                    }
                }
                Some(result) = self.dials.join_next(), if !self.dials.is_empty() => {
                    if let Err(e) = result {
                        if e.is_panic() {
                            warn!(error = %e, "Dial task panicked");
                        }
                    }
                }
                _ = gap_check.tick() => self.release_stalled(),
            }
        }

        debug!(topic = ?self.shared.topic, session = %self.shared.id, "Session actor stopped");
    }

    /// Handle one command; returns `true` once the session has closed
    async fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Broadcast { payload, reply } => {
                let _ = reply.send(self.broadcast(payload));
            }
            Command::Connected { peer, link, peers } => {
                self.pending_dials.remove(&peer);
                self.attach(peer, link, self.local, None);
                self.exchange(peers);
            }
            Command::DialFailed { peer, error } => {
                self.pending_dials.remove(&peer);
                warn!(
                    topic = ?self.shared.topic,
                    peer = %peer.fmt_short(),
                    error = %error,
                    "Failed to connect to peer"
                );
                if self.shared.state() == SessionState::Joining
                    && self.pending_dials.is_empty()
                    && self.neighbors.is_empty()
                {
                    self.close(CloseReason::JoinFailed).await;
                    return true;
                }
            }
            Command::Admit { peer, link } => self.admit(peer, link),
            Command::Dial { peers } => self.dial(peers),
            Command::Frame {
                peer,
                link_id,
                frame,
            } => self.on_frame(peer, link_id, frame),
            Command::LinkClosed { peer, link_id } => {
                if self.is_current(&peer, link_id) {
                    self.remove_neighbor(peer);
                }
            }
            Command::Evict { peer, link_id } => {
                if self.is_current(&peer, link_id) {
                    warn!(
                        peer = %peer.fmt_short(),
                        "Neighbor not draining its link, disconnecting"
                    );
                    self.remove_neighbor(peer);
                }
            }
            Command::Leave { reason, reply } => {
                self.close(reason).await;
                if let Some(reply) = reply {
                    let _ = reply.send(());
                }
                return true;
            }
        }
        false
    }

    fn activate(&mut self) {
        if self.shared.state() != SessionState::Joining {
            return;
        }
        self.shared.state.send_replace(SessionState::Active);
        info!(topic = ?self.shared.topic, session = %self.shared.id, "Session active");
        self.shared.dispatcher.emit(Event::Joined);
    }

    fn dial(&mut self, peers: impl IntoIterator<Item = NodeId>) {
        let Some(commands) = self.commands.upgrade() else {
            return;
        };

        for peer in peers {
            if peer == self.local
                || self.neighbors.contains_key(&peer)
                || !self.pending_dials.insert(peer)
            {
                continue;
            }

            let dialer = self.dialer.clone();
            let topic = self.shared.topic;
            let cancel = self.shared.closed.clone();
            let commands = commands.clone();
            self.dials.spawn(async move {
                let command = match dialer.connect(peer, topic, &cancel).await {
                    Ok(Connected { link, peers }) => Command::Connected { peer, link, peers },
                    Err(error) => Command::DialFailed { peer, error },
                };
                let _ = commands.send(command).await;
            });
        }
    }

    /// Dial peers learned from a `Welcome` until the neighbor target is met
    fn exchange(&mut self, peers: Vec<PeerAddress>) {
        let have = self.neighbors.len() + self.pending_dials.len();
        let want = self.config.target_neighbors.saturating_sub(have);
        if want == 0 {
            return;
        }

        let candidates: Vec<NodeId> = peers
            .iter()
            .map(PeerAddress::id)
            .filter(|id| {
                *id != self.local
                    && !self.neighbors.contains_key(id)
                    && !self.pending_dials.contains(id)
            })
            .take(want)
            .collect();

        if !candidates.is_empty() {
            debug!(topic = ?self.shared.topic, count = candidates.len(), "Dialing exchanged peers");
            self.dial(candidates);
        }
    }

    fn admit(&mut self, peer: NodeId, link: Link) {
        if self.neighbors.len() >= self.config.max_neighbors && !self.neighbors.contains_key(&peer)
        {
            debug!(topic = ?self.shared.topic, peer = %peer.fmt_short(), "Topic full, rejecting");
            tokio::spawn(link.reject(RejectReason::TopicFull));
            return;
        }

        let peers = self
            .neighbors
            .keys()
            .filter(|id| **id != peer)
            .filter_map(|id| self.address_book.lookup(id))
            .filter(PeerAddress::is_reachable)
            .collect();
        self.attach(peer, link, peer, Some(Frame::Welcome { peers }));
    }

    /// Install a link as the neighbor link to `peer`.
    ///
    /// When a link to `peer` already exists, both ends keep the link that
    /// was initiated by the smaller node id and drop the other.
    fn attach(&mut self, peer: NodeId, link: Link, initiator: NodeId, first: Option<Frame>) {
        let Link {
            sink,
            stream,
            guard,
        } = link;

        let (outbox, outbox_rx) = mpsc::channel(self.config.link_queue_capacity);
        if let Some(frame) = first {
            let _ = outbox.try_send(frame);
        }
        let writer = tokio::spawn(run_writer(sink, outbox_rx, guard));

        if let Some(existing) = self.neighbors.get(&peer) {
            let preferred = self.local.min(peer);
            if existing.initiator == initiator || initiator != preferred {
                debug!(peer = %peer.fmt_short(), "Dropping duplicate link");
                return;
            }
        }

        let Some(commands) = self.commands.upgrade() else {
            return;
        };
        self.next_link_id += 1;
        let link_id = self.next_link_id;
        let reader = tokio::spawn(run_reader(stream, peer, link_id, commands));

        let neighbor = Neighbor {
            link_id,
            initiator,
            outbox,
            writer,
            reader,
        };
        if let Some(replaced) = self.neighbors.insert(peer, neighbor) {
            debug!(peer = %peer.fmt_short(), "Replaced duplicate link");
            drop(replaced.release());
            return;
        }

        self.activate();
        self.shared.set_neighbors(self.neighbors.keys().copied());
        info!(topic = ?self.shared.topic, peer = %peer.fmt_short(), "Neighbor up");
        self.shared.dispatcher.emit(Event::NeighborUp(peer));
    }

    /// Whether `link_id` is still the live link to `peer`
    fn is_current(&self, peer: &NodeId, link_id: u64) -> bool {
        self.neighbors
            .get(peer)
            .is_some_and(|n| n.link_id == link_id)
    }

    fn remove_neighbor(&mut self, peer: NodeId) {
        let Some(neighbor) = self.neighbors.remove(&peer) else {
            return;
        };
        drop(neighbor.release());
        self.shared.set_neighbors(self.neighbors.keys().copied());
        info!(topic = ?self.shared.topic, peer = %peer.fmt_short(), "Neighbor down");
        self.shared.dispatcher.emit(Event::NeighborDown(peer));
    }

    fn on_frame(&mut self, peer: NodeId, link_id: u64, frame: Frame) {
        if !self.is_current(&peer, link_id) {
            return;
        }

        match frame {
            Frame::Gossip {
                origin,
                epoch,
                seq,
                hops,
                payload,
            } => self.on_gossip(peer, origin, epoch, seq, hops, payload),
            other => {
                debug!(
                    peer = %peer.fmt_short(),
                    frame = ?other,
                    "Unexpected frame on established link"
                );
            }
        }
    }

    fn on_gossip(
        &mut self,
        peer: NodeId,
        origin: NodeId,
        epoch: u64,
        seq: u64,
        hops: u8,
        payload: Vec<u8>,
    ) {
        if origin == self.local {
            return;
        }
        if payload.len() > self.config.max_payload_size {
            warn!(
                peer = %peer.fmt_short(),
                size = payload.len(),
                "Oversized gossip payload ignored"
            );
            return;
        }
        if !self.seen.insert(message_id(&origin, epoch, seq, &payload)) {
            return;
        }

        if hops > 1 {
            let frame = Frame::Gossip {
                origin,
                epoch,
                seq,
                hops: hops - 1,
                payload: payload.clone(),
            };
            self.forward(&frame, |id| id != peer && id != origin);
        }

        let ready = self
            .reorder
            .push(origin, epoch, seq, (peer, Bytes::from(payload)));
        for (delivered_from, content) in ready {
            self.deliver(origin, delivered_from, content);
        }
    }

    fn deliver(&self, origin: NodeId, delivered_from: NodeId, content: Bytes) {
        debug!(
            topic = ?self.shared.topic,
            from = %origin.fmt_short(),
            len = content.len(),
            "Received message"
        );
        self.shared.dispatcher.emit(Event::Received(GossipMessage {
            from: origin,
            delivered_from,
            content,
        }));
    }

    fn release_stalled(&mut self) {
        let released = self.reorder.release_stalled(self.config.reorder_timeout());
        for (origin, (delivered_from, content)) in released {
            self.deliver(origin, delivered_from, content);
        }
    }

    fn broadcast(&mut self, payload: Bytes) -> Result<Flood, BroadcastError> {
        if payload.len() > self.config.max_payload_size {
            return Err(BroadcastError::PayloadTooLarge {
                size: payload.len(),
                max: self.config.max_payload_size,
            });
        }

        self.seq += 1;
        self.seen
            .insert(message_id(&self.local, self.epoch, self.seq, &payload));

        let frame = Frame::Gossip {
            origin: self.local,
            epoch: self.epoch,
            seq: self.seq,
            hops: self.config.max_hops,
            payload: payload.to_vec(),
        };
        let targets = self
            .neighbors
            .iter()
            .map(|(peer, neighbor)| FloodTarget {
                peer: *peer,
                link_id: neighbor.link_id,
                outbox: neighbor.outbox.clone(),
            })
            .collect();
        debug!(
            topic = ?self.shared.topic,
            seq = self.seq,
            neighbors = self.neighbors.len(),
            "Flooding message"
        );
        Ok(Flood {
            frame,
            targets,
            send_timeout: self.config.send_timeout(),
        })
    }

    /// Relay a frame without waiting; neighbors whose outbox is full are
    /// disconnected
    fn forward(&mut self, frame: &Frame, include: impl Fn(NodeId) -> bool) {
        let mut lagging = Vec::new();
        for (id, neighbor) in &self.neighbors {
            if !include(*id) {
                continue;
            }
            match neighbor.outbox.try_send(frame.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => lagging.push(*id),
                Err(TrySendError::Closed(_)) => {}
            }
        }
        for peer in lagging {
            warn!(peer = %peer.fmt_short(), "Neighbor outbox full, disconnecting");
            self.remove_neighbor(peer);
        }
    }

    async fn close(&mut self, reason: CloseReason) {
        info!(
            topic = ?self.shared.topic,
            session = %self.shared.id,
            ?reason,
            "Closing session"
        );
        self.shared.mark_closed(reason);

        self.dials.abort_all();
        self.pending_dials.clear();

        let writers: Vec<JoinHandle<()>> = self
            .neighbors
            .drain()
            .map(|(_, neighbor)| neighbor.release())
            .collect();
        self.shared.set_neighbors(std::iter::empty());

        let aborts: Vec<_> = writers.iter().map(JoinHandle::abort_handle).collect();
        let flush = futures::future::join_all(writers);
        if tokio::time::timeout(self.config.leave_flush_timeout(), flush)
            .await
            .is_err()
        {
            warn!(topic = ?self.shared.topic, "Timed out flushing neighbor links");
            for abort in aborts {
                abort.abort();
            }
        }

        let mut registry = self.registry.write();
        if registry
            .get(&self.shared.topic)
            .is_some_and(|h| h.shared.id == self.shared.id)
        {
            registry.remove(&self.shared.topic);
        }
    }
}

async fn run_writer(
    mut sink: FrameSink,
    mut outbox: mpsc::Receiver<Frame>,
    guard: Option<LinkGuard>,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = sink.send(&frame).await {
            debug!(error = %e, "Link write failed");
            break;
        }
    }
    let _ = sink.close().await;
    drop(guard);
}

async fn run_reader(
    mut stream: FrameStream,
    peer: NodeId,
    link_id: u64,
    commands: mpsc::Sender<Command>,
) {
    loop {
        match stream.recv().await {
            Ok(Some(frame)) => {
                let command = Command::Frame {
                    peer,
                    link_id,
                    frame,
                };
                if commands.send(command).await.is_err() {
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(peer = %peer.fmt_short(), error = %e, "Link read failed");
                break;
            }
        }
    }
    let _ = commands.send(Command::LinkClosed { peer, link_id }).await;
}

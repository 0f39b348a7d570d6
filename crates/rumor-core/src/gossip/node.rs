//! Gossip node: the per-process session manager
//!
//! A [`GossipNode`] binds one transport and one address book to a set of
//! topic sessions. It runs the accept loop that handshakes incoming links
//! and hands them to the session of the requested topic.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::dial::Dialer;
use super::events::{CloseReason, SessionState, TopicReceiver};
use super::sender::TopicSender;
use super::session::{
    self, Command, SessionContext, SessionHandle, SessionId, SessionRegistry, SessionShared,
};
use super::wire::{Frame, Link, RejectReason};
use crate::address_book::AddressBook;
use crate::config::{GossipConfig, RejoinPolicy};
use crate::error::JoinError;
use crate::transport::{IncomingStream, Transport, GOSSIP_ALPN};
use crate::types::{Endpoint, NodeId, PeerAddress, TopicId, TOPIC_ID_LEN};

/// Session manager for one local identity
///
/// Cheap to clone; all clones share the same sessions.
#[derive(Clone)]
pub struct GossipNode {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    local: NodeId,
    transport: Arc<dyn Transport>,
    address_book: AddressBook,
    config: Arc<GossipConfig>,
    dialer: Dialer,
    sessions: SessionRegistry,
    next_session: AtomicU64,
    shutdown: CancellationToken,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for GossipNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipNode")
            .field("local", &self.inner.local)
            .field("sessions", &self.inner.sessions.read().len())
            .finish()
    }
}

impl GossipNode {
    /// Create a node over `transport` and start accepting links
    pub fn spawn(
        transport: Arc<dyn Transport>,
        address_book: AddressBook,
        config: GossipConfig,
    ) -> Self {
        let local = transport.local_id();
        let config = Arc::new(config);
        let sessions: SessionRegistry = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let acceptor = Acceptor {
            local,
            transport: transport.clone(),
            address_book: address_book.clone(),
            config: config.clone(),
            sessions: sessions.clone(),
        };
        let accept_task = tokio::spawn(acceptor.run(shutdown.clone()));

        info!(node = %local.fmt_short(), "Gossip node started");

        Self {
            inner: Arc::new(NodeInner {
                local,
                dialer: Dialer::new(transport.clone(), address_book.clone(), config.clone()),
                transport,
                address_book,
                config,
                sessions,
                next_session: AtomicU64::new(1),
                shutdown,
                accept_task: Mutex::new(Some(accept_task)),
            }),
        }
    }

    /// This node's identity
    pub fn local_id(&self) -> NodeId {
        self.inner.local
    }

    /// Endpoints this node is reachable at
    pub fn local_endpoints(&self) -> Vec<Endpoint> {
        self.inner.transport.local_endpoints()
    }

    /// The address book shared by every session of this node
    pub fn address_book(&self) -> &AddressBook {
        &self.inner.address_book
    }

    /// The configuration the node runs with
    pub fn config(&self) -> &GossipConfig {
        &self.inner.config
    }

    /// Join a topic.
    ///
    /// `topic` must be exactly 32 bytes. Every bootstrap peer other than
    /// this node must be in the address book with at least one endpoint.
    /// With an empty bootstrap list the session is active at once;
    /// otherwise this returns after the first accepted handshake, while the
    /// remaining bootstrap peers keep being dialed in the background.
    ///
    /// # Errors
    ///
    /// - [`JoinError::InvalidTopicLength`] for a topic of the wrong size
    /// - [`JoinError::UnknownBootstrapPeer`] before anything is dialed
    /// - [`JoinError::AlreadyJoined`] under [`RejoinPolicy::Reject`]
    /// - [`JoinError::NoReachablePeers`] when every bootstrap dial failed
    /// - [`JoinError::Cancelled`] if the topic was left while dialing
    /// - [`JoinError::ShuttingDown`] if the node is shutting down
    pub async fn join(
        &self,
        topic: impl AsRef<[u8]>,
        bootstrap: &[NodeId],
    ) -> Result<(TopicSender, TopicReceiver), JoinError> {
        let bytes = topic.as_ref();
        let topic = TopicId::from_slice(bytes).ok_or(JoinError::InvalidTopicLength {
            expected: TOPIC_ID_LEN,
            actual: bytes.len(),
        })?;

        if self.inner.shutdown.is_cancelled() {
            return Err(JoinError::ShuttingDown);
        }

        let mut peers: Vec<NodeId> = Vec::new();
        for id in bootstrap {
            if *id != self.inner.local && !peers.contains(id) {
                peers.push(*id);
            }
        }
        for id in &peers {
            let reachable = self
                .inner
                .address_book
                .lookup(id)
                .is_some_and(|addr| addr.is_reachable());
            if !reachable {
                return Err(JoinError::UnknownBootstrapPeer(*id));
            }
        }

        let (handle, events, reused) = {
            let mut sessions = self.inner.sessions.write();
            match sessions.get(&topic).filter(|h| h.is_live()) {
                Some(existing) => {
                    if self.inner.config.rejoin_policy == RejoinPolicy::Reject {
                        return Err(JoinError::AlreadyJoined);
                    }
                    let events = existing.shared.dispatcher.register();
                    (existing.clone(), events, true)
                }
                None => {
                    let id =
                        SessionId::new(self.inner.next_session.fetch_add(1, Ordering::Relaxed));
                    let shared = Arc::new(SessionShared::new(
                        id,
                        topic,
                        self.inner.config.event_queue_capacity,
                    ));
                    let events = shared.dispatcher.register();
                    let commands =
                        session::spawn(shared.clone(), self.session_context(), peers.clone());
                    let handle = SessionHandle { shared, commands };
                    sessions.insert(topic, handle.clone());
                    (handle, events, false)
                }
            }
        };

        if reused {
            debug!(topic = ?topic, session = %handle.shared.id, "Reusing joined session");
            if !peers.is_empty() {
                let _ = handle
                    .commands
                    .send(Command::Dial {
                        peers: peers.clone(),
                    })
                    .await;
            }
        }

        let mut state = handle.shared.subscribe_state();
        let outcome = state
            .wait_for(|s| *s != SessionState::Joining)
            .await
            .map(|s| *s)
            .unwrap_or(SessionState::Closed);

        if outcome == SessionState::Active {
            info!(topic = ?topic, session = %handle.shared.id, "Joined topic");
            let sender = TopicSender::new(
                handle.shared.clone(),
                handle.commands.clone(),
                self.inner.config.max_payload_size,
            );
            let receiver = TopicReceiver::new(events, handle.shared);
            return Ok((sender, receiver));
        }

        Err(match handle.shared.close_reason() {
            Some(CloseReason::JoinFailed) => JoinError::NoReachablePeers {
                attempted: peers.len(),
            },
            Some(CloseReason::Left) => JoinError::Cancelled,
            _ => JoinError::ShuttingDown,
        })
    }

    /// Leave a topic. Idempotent; leaving an unknown topic does nothing.
    pub async fn leave(&self, topic: TopicId) {
        let handle = self.inner.sessions.read().get(&topic).cloned();
        if let Some(handle) = handle {
            handle.close(CloseReason::Left).await;
        }
    }

    /// State of the session for `topic`; `None` once it has closed
    pub fn session_state(&self, topic: &TopicId) -> Option<SessionState> {
        self.inner
            .sessions
            .read()
            .get(topic)
            .filter(|h| h.is_live())
            .map(|h| h.shared.state())
    }

    /// Current neighbors on `topic`
    pub fn neighbors(&self, topic: &TopicId) -> Vec<NodeId> {
        self.inner
            .sessions
            .read()
            .get(topic)
            .map(|h| h.shared.neighbors())
            .unwrap_or_default()
    }

    /// Topics with a live session
    pub fn topics(&self) -> Vec<TopicId> {
        self.inner
            .sessions
            .read()
            .iter()
            .filter(|(_, h)| h.is_live())
            .map(|(topic, _)| *topic)
            .collect()
    }

    /// Close every session and the transport
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!(node = %self.inner.local.fmt_short(), "Shutting down gossip node");
        self.inner.shutdown.cancel();

        close_all(&self.inner.sessions, CloseReason::Shutdown).await;
        self.inner.transport.close().await;

        let accept_task = self.inner.accept_task.lock().take();
        if let Some(task) = accept_task {
            let _ = task.await;
        }
        info!("Gossip node shutdown complete");
    }

    fn session_context(&self) -> SessionContext {
        SessionContext {
            local: self.inner.local,
            config: self.inner.config.clone(),
            address_book: self.inner.address_book.clone(),
            dialer: self.inner.dialer.clone(),
            registry: self.inner.sessions.clone(),
        }
    }
}

async fn close_all(sessions: &SessionRegistry, reason: CloseReason) {
    let handles: Vec<SessionHandle> = sessions.read().values().cloned().collect();
    for handle in handles {
        handle.close(reason).await;
    }
}

/// Accept loop state, shared with every incoming handshake task
#[derive(Clone)]
struct Acceptor {
    local: NodeId,
    transport: Arc<dyn Transport>,
    address_book: AddressBook,
    config: Arc<GossipConfig>,
    sessions: SessionRegistry,
}

impl Acceptor {
    async fn run(self, shutdown: CancellationToken) {
        loop {
            let incoming = tokio::select! {
                _ = shutdown.cancelled() => break,
                incoming = self.transport.accept() => incoming,
            };

            let Some(incoming) = incoming else {
                if !shutdown.is_cancelled() {
                    warn!("Transport stopped accepting, closing all sessions");
                    close_all(&self.sessions, CloseReason::TransportClosed).await;
                }
                break;
            };

            let acceptor = self.clone();
            tokio::spawn(async move { acceptor.handshake(incoming).await });
        }
        debug!("Accept loop finished");
    }

    async fn handshake(self, incoming: IncomingStream) {
        let IncomingStream { peer, stream } = incoming;
        let mut link = Link::new(stream, self.config.max_frame_length());

        let hello = match timeout(self.config.handshake_timeout(), link.stream.recv()).await {
            Ok(Ok(Some(frame))) => frame,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                debug!(peer = %peer.fmt_short(), error = %e, "Bad handshake");
                return;
            }
            Err(_) => {
                debug!(peer = %peer.fmt_short(), "Handshake timed out");
                return;
            }
        };

        let Frame::Hello {
            protocol,
            topic,
            from,
            endpoints,
        } = hello
        else {
            debug!(peer = %peer.fmt_short(), "Expected hello");
            return;
        };

        if protocol != GOSSIP_ALPN {
            link.reject(RejectReason::ProtocolMismatch).await;
            return;
        }
        if from != peer || from == self.local {
            warn!(
                peer = %peer.fmt_short(),
                claimed = %from.fmt_short(),
                "Identity mismatch in hello"
            );
            link.reject(RejectReason::IdentityMismatch).await;
            return;
        }

        self.address_book
            .add_or_merge(PeerAddress::with_endpoints(from, endpoints));

        let handle = self
            .sessions
            .read()
            .get(&topic)
            .filter(|h| h.is_live())
            .cloned();
        let Some(handle) = handle else {
            debug!(peer = %peer.fmt_short(), topic = ?topic, "Hello for unknown topic");
            link.reject(RejectReason::UnknownTopic).await;
            return;
        };

        if handle
            .commands
            .send(Command::Admit { peer: from, link })
            .await
            .is_err()
        {
            debug!(peer = %peer.fmt_short(), "Session closed during handshake");
        }
    }
}

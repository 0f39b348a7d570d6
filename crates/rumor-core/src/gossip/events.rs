//! Session events and their delivery
//!
//! Each session feeds exactly one observer through a bounded queue. The
//! observer is a [`TopicReceiver`]; it can be polled with
//! [`recv`](TopicReceiver::recv) or turned into a callback with
//! [`dispatch`](TopicReceiver::dispatch).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::session::{SessionId, SessionShared};
use crate::types::{NodeId, TopicId};

/// Message received from a gossip topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GossipMessage {
    /// The node that broadcast the message
    pub from: NodeId,
    /// The neighbor that relayed it to us
    pub delivered_from: NodeId,
    /// The raw message content
    pub content: Bytes,
}

/// Event from a gossip session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The session became active
    Joined,
    /// A neighbor link came up
    NeighborUp(NodeId),
    /// A neighbor link went down
    NeighborDown(NodeId),
    /// A message was delivered
    Received(GossipMessage),
}

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Joining => write!(f, "joining"),
            SessionState::Active => write!(f, "active"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Why a session closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// `leave` was called
    Left,
    /// Every bootstrap dial failed
    JoinFailed,
    /// The transport stopped accepting
    TransportClosed,
    /// The node shut down
    Shutdown,
}

/// Bounded single-observer event queue of one session
#[derive(Debug)]
pub(crate) struct EventDispatcher {
    capacity: usize,
    observer: Mutex<Option<mpsc::Sender<Event>>>,
    dropped: AtomicU64,
}

impl EventDispatcher {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            observer: Mutex::new(None),
            dropped: AtomicU64::new(0),
        }
    }

    /// Install a new observer queue, releasing the previous one
    pub fn register(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if self.observer.lock().replace(tx).is_some() {
            debug!("Replaced session observer");
        }
        rx
    }

    /// Queue an event for the observer; dropped and counted if the queue is full
    pub fn emit(&self, event: Event) {
        let observer = self.observer.lock();
        let Some(tx) = observer.as_ref() else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(?event, dropped, "Event queue full, dropping event");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Release the observer registration
    pub fn close(&self) {
        self.observer.lock().take();
    }
}

/// Handle to receive events from a joined topic
///
/// Yields events until the session closes; after that
/// [`recv`](Self::recv) returns `None` immediately, even if events were
/// still queued.
pub struct TopicReceiver {
    events: mpsc::Receiver<Event>,
    shared: Arc<SessionShared>,
}

impl TopicReceiver {
    pub(crate) fn new(events: mpsc::Receiver<Event>, shared: Arc<SessionShared>) -> Self {
        Self { events, shared }
    }

    /// Receive the next event, or `None` once the session has closed or
    /// this receiver was replaced by a later `join`
    pub async fn recv(&mut self) -> Option<Event> {
        if self.shared.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.shared.closed.cancelled() => None,
            event = self.events.recv() => event,
        }
    }

    /// Hand every event to `callback` on a spawned task.
    ///
    /// The task ends when the session closes.
    pub fn dispatch<F>(mut self, mut callback: F) -> JoinHandle<()>
    where
        F: FnMut(Event) + Send + 'static,
    {
        tokio::spawn(async move {
            while let Some(event) = self.recv().await {
                callback(event);
            }
            debug!(topic = ?self.shared.topic, "Event dispatch finished");
        })
    }

    /// Events lost to a full queue over the session's lifetime
    pub fn dropped_events(&self) -> u64 {
        self.shared.dispatcher.dropped()
    }

    /// Why the session closed, once it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason()
    }

    /// Current session state
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// The topic this receiver belongs to
    pub fn topic(&self) -> TopicId {
        self.shared.topic
    }

    /// Identifier of the underlying session
    pub fn session_id(&self) -> SessionId {
        self.shared.id
    }

    /// Current neighbors of the session
    pub fn neighbors(&self) -> Vec<NodeId> {
        self.shared.neighbors()
    }
}

impl fmt::Debug for TopicReceiver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicReceiver")
            .field("topic", &self.shared.topic)
            .field("session", &self.shared.id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_observer_is_noop() {
        let dispatcher = EventDispatcher::new(4);
        dispatcher.emit(Event::Joined);
        assert_eq!(dispatcher.dropped(), 0);
    }

    #[tokio::test]
    async fn test_events_arrive_in_order() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.register();
        let peer = NodeId::from_bytes([1; 32]);

        dispatcher.emit(Event::Joined);
        dispatcher.emit(Event::NeighborUp(peer));

        assert_eq!(rx.recv().await, Some(Event::Joined));
        assert_eq!(rx.recv().await, Some(Event::NeighborUp(peer)));
    }

    #[tokio::test]
    async fn test_overflow_drops_newest() {
        let dispatcher = EventDispatcher::new(2);
        let mut rx = dispatcher.register();
        let peer = NodeId::from_bytes([1; 32]);

        dispatcher.emit(Event::Joined);
        dispatcher.emit(Event::NeighborUp(peer));
        dispatcher.emit(Event::NeighborDown(peer));

        assert_eq!(dispatcher.dropped(), 1);
        assert_eq!(rx.recv().await, Some(Event::Joined));
        assert_eq!(rx.recv().await, Some(Event::NeighborUp(peer)));
    }

    #[tokio::test]
    async fn test_register_releases_previous_observer() {
        let dispatcher = EventDispatcher::new(4);
        let mut first = dispatcher.register();
        let mut second = dispatcher.register();

        dispatcher.emit(Event::Joined);
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, Some(Event::Joined));
    }

    #[tokio::test]
    async fn test_close_ends_observer() {
        let dispatcher = EventDispatcher::new(4);
        let mut rx = dispatcher.register();
        dispatcher.close();
        dispatcher.emit(Event::Joined);
        assert_eq!(rx.recv().await, None);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Active.to_string(), "active");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}

//! Dedup and ordering state for flooded messages

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::types::NodeId;

/// Fingerprint identifying one broadcast across the mesh
pub(crate) fn message_id(origin: &NodeId, epoch: u64, seq: u64, payload: &[u8]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(origin.as_bytes());
    hasher.update(&epoch.to_le_bytes());
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

/// Bounded FIFO set of recently seen message ids
#[derive(Debug)]
pub(crate) struct SeenCache {
    capacity: usize,
    order: VecDeque<blake3::Hash>,
    ids: HashSet<blake3::Hash>,
}

impl SeenCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    /// Record `id`; returns `true` the first time it is seen.
    ///
    /// The oldest id is evicted once the cache is full.
    pub fn insert(&mut self, id: blake3::Hash) -> bool {
        if !self.ids.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        true
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.order.len()
    }
}

#[derive(Debug)]
struct OriginState<T> {
    epoch: u64,
    next: u64,
    pending: BTreeMap<u64, T>,
    /// When the current gap started holding messages back
    stalled_since: Option<Instant>,
}

impl<T> OriginState<T> {
    fn new(epoch: u64, next: u64) -> Self {
        Self {
            epoch,
            next,
            pending: BTreeMap::new(),
            stalled_since: None,
        }
    }

    /// Jump over the gap to the oldest waiting message
    fn skip_gap(&mut self, origin: &NodeId) {
        if let Some(&first) = self.pending.keys().next() {
            debug!(
                origin = %origin.fmt_short(),
                from = self.next,
                to = first,
                "Skipping sequence gap"
            );
            self.next = first;
        }
    }

    /// Pop every message that is now in order
    fn drain(&mut self) -> Vec<T> {
        let mut ready = Vec::new();
        while let Some(item) = self.pending.remove(&self.next) {
            ready.push(item);
            self.next += 1;
        }
        self.stalled_since = if self.pending.is_empty() {
            None
        } else {
            self.stalled_since.or_else(|| Some(Instant::now()))
        };
        ready
    }
}

/// Per-originator reorder buffer
///
/// The first sequence number seen from an `(origin, epoch)` becomes the
/// baseline; earlier numbers are stale and dropped. Later numbers wait for
/// the gap to fill. The gap is skipped once more than `window` messages are
/// waiting, or once it has held messages back for longer than the stall
/// timeout passed to [`release_stalled`](Self::release_stalled).
#[derive(Debug)]
pub(crate) struct ReorderBuffer<T> {
    window: usize,
    origins: HashMap<NodeId, OriginState<T>>,
}

impl<T> ReorderBuffer<T> {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            origins: HashMap::new(),
        }
    }

    /// Accept one message and return everything now deliverable, in order
    pub fn push(&mut self, origin: NodeId, epoch: u64, seq: u64, item: T) -> Vec<T> {
        let state = self
            .origins
            .entry(origin)
            .or_insert_with(|| OriginState::new(epoch, seq));

        // New epoch means the originator rejoined; start over
        if state.epoch != epoch {
            *state = OriginState::new(epoch, seq);
        }

        if seq < state.next {
            return Vec::new();
        }
        state.pending.insert(seq, item);

        if state.pending.len() > self.window {
            state.skip_gap(&origin);
        }
        state.drain()
    }

    /// Skip every gap that has stalled for at least `timeout` and return
    /// the released messages with their originators, in order per originator
    pub fn release_stalled(&mut self, timeout: Duration) -> Vec<(NodeId, T)> {
        let mut released = Vec::new();
        for (origin, state) in self.origins.iter_mut() {
            let stalled = state
                .stalled_since
                .is_some_and(|since| since.elapsed() >= timeout);
            if !stalled {
                continue;
            }
            state.stalled_since = None;
            state.skip_gap(origin);
            released.extend(state.drain().into_iter().map(|item| (*origin, item)));
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn origin(n: u8) -> NodeId {
        NodeId::from_bytes([n; 32])
    }

    fn b(s: &'static str) -> Bytes {
        Bytes::from_static(s.as_bytes())
    }

    #[test]
    fn test_seen_cache_dedups() {
        let mut cache = SeenCache::new(8);
        let id = message_id(&origin(1), 7, 1, b"hola");
        assert!(cache.insert(id));
        assert!(!cache.insert(id));
    }

    #[test]
    fn test_seen_cache_evicts_oldest() {
        let mut cache = SeenCache::new(2);
        let ids: Vec<_> = (1..=3).map(|seq| message_id(&origin(1), 7, seq, b"x")).collect();
        for id in &ids {
            assert!(cache.insert(*id));
        }
        assert_eq!(cache.len(), 2);
        // First id was evicted and counts as new again
        assert!(cache.insert(ids[0]));
        assert!(!cache.insert(ids[2]));
    }

    #[test]
    fn test_message_id_covers_every_field() {
        let base = message_id(&origin(1), 7, 1, b"x");
        assert_ne!(base, message_id(&origin(2), 7, 1, b"x"));
        assert_ne!(base, message_id(&origin(1), 8, 1, b"x"));
        assert_ne!(base, message_id(&origin(1), 7, 2, b"x"));
        assert_ne!(base, message_id(&origin(1), 7, 1, b"y"));
    }

    #[test]
    fn test_in_order_delivery_is_immediate() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.push(origin(1), 1, 1, b("a")), vec![b("a")]);
        assert_eq!(buffer.push(origin(1), 1, 2, b("b")), vec![b("b")]);
    }

    #[test]
    fn test_gap_is_held_then_released() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.push(origin(1), 1, 1, b("a")), vec![b("a")]);
        assert!(buffer.push(origin(1), 1, 3, b("c")).is_empty());
        assert_eq!(buffer.push(origin(1), 1, 2, b("b")), vec![b("b"), b("c")]);
    }

    #[test]
    fn test_baseline_is_first_seen() {
        let mut buffer = ReorderBuffer::new(4);
        assert_eq!(buffer.push(origin(1), 1, 10, b("j")), vec![b("j")]);
        assert!(buffer.push(origin(1), 1, 9, b("i")).is_empty(), "stale");
    }

    #[test]
    fn test_gap_skipped_past_window() {
        let mut buffer = ReorderBuffer::new(2);
        buffer.push(origin(1), 1, 1, b("a"));
        assert!(buffer.push(origin(1), 1, 3, b("c")).is_empty());
        assert!(buffer.push(origin(1), 1, 4, b("d")).is_empty());
        assert_eq!(
            buffer.push(origin(1), 1, 5, b("e")),
            vec![b("c"), b("d"), b("e")]
        );
    }

    #[test]
    fn test_new_epoch_resets_origin() {
        let mut buffer = ReorderBuffer::new(4);
        buffer.push(origin(1), 1, 5, b("old"));
        assert_eq!(buffer.push(origin(1), 2, 1, b("new")), vec![b("new")]);
    }

    #[test]
    fn test_origins_are_independent() {
        let mut buffer = ReorderBuffer::new(4);
        buffer.push(origin(1), 1, 1, b("a"));
        assert!(buffer.push(origin(1), 1, 3, b("c")).is_empty());
        assert_eq!(buffer.push(origin(2), 9, 1, b("x")), vec![b("x")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_gap_released_after_timeout() {
        let timeout = Duration::from_millis(500);
        let mut buffer = ReorderBuffer::new(64);
        buffer.push(origin(1), 1, 1, b("a"));
        assert!(buffer.push(origin(1), 1, 3, b("c")).is_empty());
        assert!(buffer.push(origin(1), 1, 4, b("d")).is_empty());

        tokio::time::advance(Duration::from_millis(100)).await;
        assert!(buffer.release_stalled(timeout).is_empty(), "too early");

        tokio::time::advance(Duration::from_millis(400)).await;
        assert_eq!(
            buffer.release_stalled(timeout),
            vec![(origin(1), b("c")), (origin(1), b("d"))]
        );

        // Nothing left waiting
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.release_stalled(timeout).is_empty());
        assert_eq!(buffer.push(origin(1), 1, 5, b("e")), vec![b("e")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_filled_gap_clears_stall() {
        let timeout = Duration::from_millis(500);
        let mut buffer = ReorderBuffer::new(64);
        buffer.push(origin(1), 1, 1, b("a"));
        buffer.push(origin(1), 1, 3, b("c"));
        assert_eq!(buffer.push(origin(1), 1, 2, b("b")), vec![b("b"), b("c")]);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(buffer.release_stalled(timeout).is_empty());
    }
}

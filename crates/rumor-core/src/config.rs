//! Gossip tuning knobs
//!
//! Every bound the session manager enforces lives here. Defaults are chosen
//! for small interactive meshes; all fields can be overridden from JSON
//! (missing fields fall back to the defaults).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default maximum broadcast payload (64 KiB)
pub const DEFAULT_MAX_PAYLOAD_SIZE: usize = 64 * 1024;
/// Default cap on neighbors per topic
pub const DEFAULT_MAX_NEIGHBORS: usize = 8;
/// Default number of neighbors a session tries to reach through peer exchange
pub const DEFAULT_TARGET_NEIGHBORS: usize = 4;
/// Default dial attempts per peer
pub const DEFAULT_DIAL_ATTEMPTS: u32 = 3;
/// Default base backoff between dial attempts (doubles per attempt)
pub const DEFAULT_DIAL_BACKOFF_MS: u64 = 100;
/// Default timeout for a single dial
pub const DEFAULT_DIAL_TIMEOUT_MS: u64 = 5_000;
/// Default timeout for the Hello/Welcome exchange
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;
/// Default time a broadcast waits for a neighbor's queue to accept a frame
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;
/// Default time `leave` waits for neighbor writes to flush
pub const DEFAULT_LEAVE_FLUSH_TIMEOUT_MS: u64 = 1_000;
/// Default per-session event queue capacity
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
/// Default per-neighbor outbound frame queue capacity
pub const DEFAULT_LINK_QUEUE_CAPACITY: usize = 1024;
/// Default size of the recently-seen message cache
pub const DEFAULT_SEEN_CACHE_CAPACITY: usize = 4096;
/// Default number of out-of-order messages held per originator
pub const DEFAULT_REORDER_WINDOW: usize = 64;
/// Default time a sequence gap may hold back later messages
pub const DEFAULT_REORDER_TIMEOUT_MS: u64 = 2_000;
/// Default hop budget for a flooded message
pub const DEFAULT_MAX_HOPS: u8 = 16;

/// What `join` does when the topic is already joined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejoinPolicy {
    /// Return a new handle to the existing session
    #[default]
    Reuse,
    /// Fail with `JoinError::AlreadyJoined`
    Reject,
}

/// Configuration for a [`GossipNode`](crate::GossipNode)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub max_payload_size: usize,
    pub max_neighbors: usize,
    pub target_neighbors: usize,
    pub dial_attempts: u32,
    pub dial_backoff_ms: u64,
    pub dial_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub leave_flush_timeout_ms: u64,
    pub event_queue_capacity: usize,
    pub link_queue_capacity: usize,
    pub seen_cache_capacity: usize,
    pub reorder_window: usize,
    pub reorder_timeout_ms: u64,
    pub max_hops: u8,
    pub rejoin_policy: RejoinPolicy,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            max_neighbors: DEFAULT_MAX_NEIGHBORS,
            target_neighbors: DEFAULT_TARGET_NEIGHBORS,
            dial_attempts: DEFAULT_DIAL_ATTEMPTS,
            dial_backoff_ms: DEFAULT_DIAL_BACKOFF_MS,
            dial_timeout_ms: DEFAULT_DIAL_TIMEOUT_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            leave_flush_timeout_ms: DEFAULT_LEAVE_FLUSH_TIMEOUT_MS,
            event_queue_capacity: DEFAULT_EVENT_QUEUE_CAPACITY,
            link_queue_capacity: DEFAULT_LINK_QUEUE_CAPACITY,
            seen_cache_capacity: DEFAULT_SEEN_CACHE_CAPACITY,
            reorder_window: DEFAULT_REORDER_WINDOW,
            reorder_timeout_ms: DEFAULT_REORDER_TIMEOUT_MS,
            max_hops: DEFAULT_MAX_HOPS,
            rejoin_policy: RejoinPolicy::default(),
        }
    }
}

impl GossipConfig {
    /// Set the maximum broadcast payload size
    pub fn with_max_payload_size(mut self, bytes: usize) -> Self {
        self.max_payload_size = bytes;
        self
    }

    /// Set the neighbor cap per topic
    pub fn with_max_neighbors(mut self, n: usize) -> Self {
        self.max_neighbors = n;
        self
    }

    /// Set dial attempts and base backoff
    pub fn with_dial_retries(mut self, attempts: u32, backoff_ms: u64) -> Self {
        self.dial_attempts = attempts;
        self.dial_backoff_ms = backoff_ms;
        self
    }

    /// Set the handshake timeout
    pub fn with_handshake_timeout_ms(mut self, ms: u64) -> Self {
        self.handshake_timeout_ms = ms;
        self
    }

    /// Set the event queue capacity
    pub fn with_event_queue_capacity(mut self, capacity: usize) -> Self {
        self.event_queue_capacity = capacity;
        self
    }

    /// Set the rejoin policy
    pub fn with_rejoin_policy(mut self, policy: RejoinPolicy) -> Self {
        self.rejoin_policy = policy;
        self
    }

    /// Set the per-neighbor outbound queue capacity
    pub fn with_link_queue_capacity(mut self, capacity: usize) -> Self {
        self.link_queue_capacity = capacity;
        self
    }

    /// Set how long a sequence gap may hold back later messages
    pub fn with_reorder_timeout_ms(mut self, ms: u64) -> Self {
        self.reorder_timeout_ms = ms;
        self
    }

    /// Check that every bound is usable.
    ///
    /// Reports the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_payload_size", self.max_payload_size as u64),
            ("max_neighbors", self.max_neighbors as u64),
            ("dial_attempts", u64::from(self.dial_attempts)),
            ("event_queue_capacity", self.event_queue_capacity as u64),
            ("link_queue_capacity", self.link_queue_capacity as u64),
            ("seen_cache_capacity", self.seen_cache_capacity as u64),
            ("send_timeout_ms", self.send_timeout_ms),
            ("reorder_timeout_ms", self.reorder_timeout_ms),
            ("max_hops", u64::from(self.max_hops)),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero { field: *field });
        }
        if self.target_neighbors > self.max_neighbors {
            return Err(ConfigError::TargetAboveMax {
                target: self.target_neighbors,
                max: self.max_neighbors,
            });
        }
        Ok(())
    }

    pub(crate) fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub(crate) fn leave_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.leave_flush_timeout_ms)
    }

    pub(crate) fn reorder_timeout(&self) -> Duration {
        Duration::from_millis(self.reorder_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based): base, 2x base, 4x base, ...
    pub(crate) fn dial_backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.dial_backoff_ms.saturating_mul(factor))
    }

    /// Largest frame a link accepts: payload plus header room
    pub(crate) fn max_frame_length(&self) -> usize {
        self.max_payload_size + 4 * 1024
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = GossipConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload_size, 64 * 1024);
        assert_eq!(config.rejoin_policy, RejoinPolicy::Reuse);
    }

    #[test]
    fn test_backoff_doubles() {
        let config = GossipConfig::default().with_dial_retries(4, 100);
        assert_eq!(config.dial_backoff(1), Duration::from_millis(100));
        assert_eq!(config.dial_backoff(2), Duration::from_millis(200));
        assert_eq!(config.dial_backoff(3), Duration::from_millis(400));
    }

    #[test]
    fn test_validate_rejects_zero_bounds() {
        let config = GossipConfig::default().with_max_payload_size(0);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "max_payload_size"
            })
        );

        let config = GossipConfig::default().with_dial_retries(0, 10);
        assert_eq!(
            config.validate(),
            Err(ConfigError::Zero {
                field: "dial_attempts"
            })
        );

        let config = GossipConfig::default().with_link_queue_capacity(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_target_above_max() {
        let config = GossipConfig::default().with_max_neighbors(2);
        assert_eq!(
            config.validate(),
            Err(ConfigError::TargetAboveMax { target: 4, max: 2 })
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: GossipConfig =
            serde_json::from_str(r#"{"max_neighbors": 12, "rejoin_policy": "reject"}"#).unwrap();
        assert_eq!(config.max_neighbors, 12);
        assert_eq!(config.rejoin_policy, RejoinPolicy::Reject);
        assert_eq!(config.dial_attempts, DEFAULT_DIAL_ATTEMPTS);
    }
}

//! Error types for Rumor

use thiserror::Error;

use crate::types::NodeId;

/// Failure decoding a textual (hex) identifier
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Cleaned input has an odd number of hex characters
    #[error("Hex string has odd length ({len} characters)")]
    OddLength { len: usize },

    /// A character remaining after cleaning is not a hex digit
    #[error("Invalid hex digit {ch:?} at position {index}")]
    InvalidDigit { ch: char, index: usize },

    /// Decoded bytes do not have the required length
    #[error("Expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

/// Failure turning user-supplied text into a [`PeerAddress`](crate::PeerAddress)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The public key string is not a valid node identity
    #[error("Invalid identity: {0}")]
    InvalidIdentity(#[source] DecodeError),

    /// The endpoint string is empty or unusable
    #[error("Invalid endpoint: {0:?}")]
    InvalidEndpoint(String),
}

/// Failure joining a topic
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Topic identifier has the wrong byte length
    #[error("Topic must be {expected} bytes (got {actual})")]
    InvalidTopicLength { expected: usize, actual: usize },

    /// A bootstrap identity has no known endpoints in the address book
    #[error("Unknown bootstrap peer: {0}")]
    UnknownBootstrapPeer(NodeId),

    /// Every dial attempt to every bootstrap peer failed
    #[error("No reachable peers ({attempted} bootstrap peer(s) tried)")]
    NoReachablePeers { attempted: usize },

    /// Topic already joined and the rejoin policy rejects duplicates
    #[error("Topic already joined")]
    AlreadyJoined,

    /// The session was left while the join was still dialing
    #[error("Join cancelled")]
    Cancelled,

    /// The node is shutting down
    #[error("Node is shutting down")]
    ShuttingDown,
}

/// Failure broadcasting through a [`TopicSender`](crate::TopicSender)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
    /// The session bound to the sender has closed
    #[error("Session closed")]
    SessionClosed,

    /// Payload exceeds the configured maximum
    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

/// Failure dialing a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DialError {
    /// Connect or handshake did not finish in time
    #[error("Dial timed out")]
    Timeout,

    /// The peer could not be reached or refused the connection
    #[error("Connection refused: {0}")]
    Refused(String),

    /// The peer does not speak the same gossip protocol version
    #[error("Protocol mismatch")]
    ProtocolMismatch,

    /// The dial was abandoned because the session closed
    #[error("Dial cancelled")]
    Cancelled,
}

impl DialError {
    /// Whether retrying the same peer may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, DialError::Timeout | DialError::Refused(_))
    }
}

/// A [`GossipConfig`](crate::GossipConfig) bound that cannot work
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A size, count or duration that must be positive is zero
    #[error("{field} must be greater than 0")]
    Zero { field: &'static str },

    /// More neighbors are sought than a topic admits
    #[error("target_neighbors ({target}) must not exceed max_neighbors ({max})")]
    TargetAboveMax { target: usize, max: usize },
}

/// Failure constructing or operating a transport
#[derive(Error, Debug)]
pub enum TransportError {
    /// The local endpoint could not be bound
    #[error("Failed to bind endpoint: {0}")]
    Bind(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Framing or encoding error on a neighbor link
#[derive(Error, Debug)]
pub enum WireError {
    /// Underlying stream error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame bytes could not be decoded
    #[error("Codec error: {0}")]
    Codec(#[from] postcard::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DecodeError::OddLength { len: 3 };
        assert_eq!(format!("{}", err), "Hex string has odd length (3 characters)");

        let err = JoinError::InvalidTopicLength {
            expected: 32,
            actual: 4,
        };
        assert_eq!(format!("{}", err), "Topic must be 32 bytes (got 4)");

        let err = BroadcastError::PayloadTooLarge { size: 10, max: 5 };
        assert_eq!(format!("{}", err), "Payload too large: 10 bytes (max 5)");

        let err = ConfigError::Zero {
            field: "max_payload_size",
        };
        assert_eq!(format!("{}", err), "max_payload_size must be greater than 0");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TransportError = io_err.into();
        assert!(matches!(err, TransportError::Io(_)));
    }

    #[test]
    fn test_dial_error_transience() {
        assert!(DialError::Timeout.is_transient());
        assert!(DialError::Refused("nope".into()).is_transient());
        assert!(!DialError::ProtocolMismatch.is_transient());
        assert!(!DialError::Cancelled.is_transient());
    }

    #[test]
    fn test_address_error_keeps_source() {
        use std::error::Error as _;

        let err = AddressError::InvalidIdentity(DecodeError::OddLength { len: 1 });
        assert!(err.source().is_some());
    }
}

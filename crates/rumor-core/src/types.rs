//! Core types for Rumor
//!
//! Identity, addressing and topic value types. These carry no behavior
//! beyond their invariants.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;
use crate::hex;

/// Length of a node identity (public key) in bytes
pub const NODE_ID_LEN: usize = 32;

/// Length of a topic identifier in bytes
pub const TOPIC_ID_LEN: usize = 32;

/// Public-key identity of a node
///
/// Ordered lexicographically on the raw bytes; the ordering is used for
/// deterministic tie-breaks between peers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Create a NodeId from raw bytes
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the NodeId
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Parse from a hex string (optional `0x`, whitespace tolerated)
    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        hex::decode_fixed::<NODE_ID_LEN>(s).map(Self)
    }

    /// Canonical lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short form for logs and prompts (first 5 bytes)
    pub fn fmt_short(&self) -> String {
        hex::encode(&self.0[..5])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.fmt_short())
    }
}

impl std::str::FromStr for NodeId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Identifier of a gossip topic
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicId([u8; TOPIC_ID_LEN]);

impl TopicId {
    /// Create a TopicId from raw bytes
    pub const fn from_bytes(bytes: [u8; TOPIC_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Create a TopicId from a slice, `None` unless it is exactly
    /// [`TOPIC_ID_LEN`] bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    /// Get the raw bytes of the TopicId
    pub fn as_bytes(&self) -> &[u8; TOPIC_ID_LEN] {
        &self.0
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self, DecodeError> {
        hex::decode_fixed::<TOPIC_ID_LEN>(s).map(Self)
    }

    /// Canonical lowercase hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl AsRef<[u8]> for TopicId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for TopicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TopicId({})", hex::encode(&self.0[..5]))
    }
}

impl std::str::FromStr for TopicId {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Transport-level reachability hint for a node
///
/// Usually a `host:port` socket address or a relay URL; in-memory
/// transports use arbitrary names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(String);

impl Endpoint {
    /// Create an endpoint from any string form
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the endpoint as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Parse as a direct socket address, if it is one
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        self.0.parse().ok()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for Endpoint {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }
}

/// A node identity together with the endpoints it is known to be reachable at
///
/// The identity is fixed at construction; endpoints only grow through
/// [`PeerAddress::merge`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    id: NodeId,
    endpoints: Vec<Endpoint>,
}

impl PeerAddress {
    /// Create an address with no endpoints
    pub fn new(id: NodeId) -> Self {
        Self {
            id,
            endpoints: Vec::new(),
        }
    }

    /// Create an address with the given endpoints (duplicates dropped)
    pub fn with_endpoints(id: NodeId, endpoints: impl IntoIterator<Item = Endpoint>) -> Self {
        let mut addr = Self::new(id);
        addr.merge(endpoints);
        addr
    }

    /// Add a single endpoint (builder style)
    pub fn with_endpoint(mut self, endpoint: impl Into<Endpoint>) -> Self {
        let endpoint: Endpoint = endpoint.into();
        self.merge([endpoint]);
        self
    }

    /// The node identity
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Known endpoints in first-seen order
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Whether any endpoint is known
    pub fn is_reachable(&self) -> bool {
        !self.endpoints.is_empty()
    }

    /// Append endpoints not already present, preserving first-seen order.
    ///
    /// Returns `true` if anything was added.
    pub fn merge(&mut self, endpoints: impl IntoIterator<Item = Endpoint>) -> bool {
        let before = self.endpoints.len();
        for endpoint in endpoints {
            if !self.endpoints.contains(&endpoint) {
                self.endpoints.push(endpoint);
            }
        }
        self.endpoints.len() != before
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_hex_roundtrip() {
        let id = NodeId::from_bytes([0xab; NODE_ID_LEN]);
        let parsed = NodeId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
        assert_eq!(id.fmt_short(), "ababababab");
    }

    #[test]
    fn test_node_id_rejects_wrong_length() {
        assert_eq!(
            NodeId::from_hex("01af"),
            Err(DecodeError::InvalidLength {
                expected: 32,
                actual: 2
            })
        );
    }

    #[test]
    fn test_node_id_ordering_is_bytewise() {
        let mut low = [0u8; NODE_ID_LEN];
        low[0] = 1;
        let mut high = [0u8; NODE_ID_LEN];
        high[0] = 2;
        assert!(NodeId::from_bytes(low) < NodeId::from_bytes(high));
    }

    #[test]
    fn test_topic_from_slice() {
        assert!(TopicId::from_slice(&[0u8; 32]).is_some());
        assert!(TopicId::from_slice(&[0u8; 31]).is_none());
        assert!(TopicId::from_slice(&[0u8; 33]).is_none());
    }

    #[test]
    fn test_topic_from_hex() {
        let topic =
            TopicId::from_hex("0xfbfdf8a045484d2f57bb678ffb792e0db647aa1c996e559937d6529aefdbf5bf")
                .unwrap();
        assert_eq!(topic.as_bytes()[0], 0xfb);
        assert_eq!(
            topic.to_string(),
            "fbfdf8a045484d2f57bb678ffb792e0db647aa1c996e559937d6529aefdbf5bf"
        );
    }

    #[test]
    fn test_peer_address_merge_preserves_order() {
        let id = NodeId::from_bytes([1; NODE_ID_LEN]);
        let mut addr = PeerAddress::with_endpoints(
            id,
            [Endpoint::from("a"), Endpoint::from("b"), Endpoint::from("a")],
        );
        assert_eq!(addr.endpoints(), &[Endpoint::from("a"), Endpoint::from("b")]);

        assert!(addr.merge([Endpoint::from("c"), Endpoint::from("b")]));
        assert_eq!(
            addr.endpoints(),
            &[Endpoint::from("a"), Endpoint::from("b"), Endpoint::from("c")]
        );

        assert!(!addr.merge(Vec::new()));
        assert_eq!(addr.id(), id);
    }

    #[test]
    fn test_endpoint_socket_addr() {
        let endpoint = Endpoint::from("192.168.1.35:56648");
        assert!(endpoint.socket_addr().is_some());
        assert!(Endpoint::from("mem:a").socket_addr().is_none());
    }
}

//! Address book mapping node identities to known endpoints
//!
//! A single book is shared by every session of a node. Entries are added
//! explicitly (for example from CLI arguments) or learned from the
//! handshakes of incoming gossip links. Endpoint lists only ever grow.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::error::AddressError;
use crate::types::{Endpoint, NodeId, PeerAddress};

/// Shared, internally synchronized peer address registry
///
/// Cloning yields another handle to the same book.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    peers: Arc<RwLock<HashMap<NodeId, PeerAddress>>>,
}

impl AddressBook {
    /// Create an empty address book
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an unknown peer or merge endpoints into a known one.
    ///
    /// Returns `true` if the book changed. An address without endpoints
    /// never clears endpoints already recorded.
    pub fn add_or_merge(&self, addr: PeerAddress) -> bool {
        let id = addr.id();
        let mut peers = self.peers.write();
        match peers.get_mut(&id) {
            Some(existing) => {
                let changed = existing.merge(addr.endpoints().iter().cloned());
                if changed {
                    debug!(
                        peer = %id.fmt_short(),
                        endpoints = existing.endpoints().len(),
                        "Merged peer endpoints"
                    );
                }
                changed
            }
            None => {
                debug!(
                    peer = %id.fmt_short(),
                    endpoints = addr.endpoints().len(),
                    "Added peer address"
                );
                peers.insert(id, addr);
                true
            }
        }
    }

    /// Look up the address recorded for a peer
    pub fn lookup(&self, id: &NodeId) -> Option<PeerAddress> {
        self.peers.read().get(id).cloned()
    }

    /// Whether the peer is known (with or without endpoints)
    pub fn contains(&self, id: &NodeId) -> bool {
        self.peers.read().contains_key(id)
    }

    /// Snapshot of every known peer address
    pub fn known_peers(&self) -> Vec<PeerAddress> {
        self.peers.read().values().cloned().collect()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    /// Whether the book is empty
    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Parse a textual public key and endpoint into a [`PeerAddress`].
    ///
    /// Does not modify any book; pass the result to [`add_or_merge`](Self::add_or_merge).
    ///
    /// # Errors
    ///
    /// - [`AddressError::InvalidIdentity`] if the key is not 32 bytes of hex
    /// - [`AddressError::InvalidEndpoint`] if the endpoint is blank
    pub fn resolve_from_string(
        identity: &str,
        endpoint: &str,
    ) -> Result<PeerAddress, AddressError> {
        let id = NodeId::from_hex(identity).map_err(AddressError::InvalidIdentity)?;

        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(AddressError::InvalidEndpoint(endpoint.to_string()));
        }

        Ok(PeerAddress::new(id).with_endpoint(Endpoint::new(endpoint)))
    }
}

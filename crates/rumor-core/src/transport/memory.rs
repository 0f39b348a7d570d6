//! In-memory transport
//!
//! Uses `tokio::io::DuplexStream` pairs for links and a shared
//! [`MemoryNetwork`] broker that maps endpoint names to listening nodes.
//! Every node of a simulated mesh binds to the same network.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{BiStream, IncomingStream, Transport, GOSSIP_ALPN};
use crate::error::{DialError, TransportError};
use crate::types::{Endpoint, NodeId};

const DUPLEX_BUF_SIZE: usize = 64 * 1024;
const ACCEPT_QUEUE: usize = 64;

#[derive(Debug)]
struct Listener {
    identity: NodeId,
    protocol: Vec<u8>,
    accept_tx: mpsc::Sender<IncomingStream>,
}

#[derive(Debug, Default)]
struct NetworkState {
    listeners: HashMap<Endpoint, Listener>,
    dial_attempts: u64,
}

/// Shared broker routing dials between [`MemoryTransport`]s
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a node speaking the gossip protocol at `endpoint`
    pub fn bind(
        &self,
        identity: NodeId,
        endpoint: impl Into<Endpoint>,
    ) -> Result<MemoryTransport, TransportError> {
        self.bind_with_protocol(identity, endpoint, GOSSIP_ALPN)
    }

    /// Bind a node that only accepts `protocol`
    pub fn bind_with_protocol(
        &self,
        identity: NodeId,
        endpoint: impl Into<Endpoint>,
        protocol: &[u8],
    ) -> Result<MemoryTransport, TransportError> {
        let endpoint = endpoint.into();
        let (accept_tx, accept_rx) = mpsc::channel(ACCEPT_QUEUE);

        {
            let mut state = self.state.lock();
            if state.listeners.contains_key(&endpoint) {
                return Err(TransportError::Bind(format!(
                    "endpoint {} already in use",
                    endpoint
                )));
            }
            state.listeners.insert(
                endpoint.clone(),
                Listener {
                    identity,
                    protocol: protocol.to_vec(),
                    accept_tx,
                },
            );
        }
        debug!(node = %identity.fmt_short(), %endpoint, "Memory transport bound");

        Ok(MemoryTransport {
            identity,
            endpoint,
            network: self.clone(),
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            closed: CancellationToken::new(),
        })
    }

    /// Total dial attempts made on this network, successful or not
    pub fn dial_attempts(&self) -> u64 {
        self.state.lock().dial_attempts
    }

    fn unregister(&self, endpoint: &Endpoint, identity: &NodeId) {
        let mut state = self.state.lock();
        if state
            .listeners
            .get(endpoint)
            .is_some_and(|l| l.identity == *identity)
        {
            state.listeners.remove(endpoint);
        }
    }
}

/// In-memory [`Transport`] implementation
#[derive(Debug)]
pub struct MemoryTransport {
    identity: NodeId,
    endpoint: Endpoint,
    network: MemoryNetwork,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<IncomingStream>>,
    closed: CancellationToken,
}

fn duplex_stream(stream: tokio::io::DuplexStream) -> BiStream {
    let (read, write) = tokio::io::split(stream);
    BiStream::new(Box::new(write), Box::new(read))
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_id(&self) -> NodeId {
        self.identity
    }

    fn local_endpoints(&self) -> Vec<Endpoint> {
        if self.closed.is_cancelled() {
            return Vec::new();
        }
        vec![self.endpoint.clone()]
    }

    async fn dial(
        &self,
        endpoint: &Endpoint,
        identity: &NodeId,
        protocol: &[u8],
    ) -> Result<BiStream, DialError> {
        if self.closed.is_cancelled() {
            return Err(DialError::Refused("transport closed".into()));
        }

        let accept_tx = {
            let mut state = self.network.state.lock();
            state.dial_attempts += 1;
            let listener = state
                .listeners
                .get(endpoint)
                .ok_or_else(|| DialError::Refused(format!("nothing listening at {}", endpoint)))?;
            if listener.identity != *identity {
                return Err(DialError::Refused(format!(
                    "identity mismatch at {}",
                    endpoint
                )));
            }
            if listener.protocol != protocol {
                return Err(DialError::ProtocolMismatch);
            }
            listener.accept_tx.clone()
        };

        let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
        accept_tx
            .send(IncomingStream {
                peer: self.identity,
                stream: duplex_stream(theirs),
            })
            .await
            .map_err(|_| DialError::Refused(format!("{} stopped accepting", endpoint)))?;

        Ok(duplex_stream(mine))
    }

    async fn accept(&self) -> Option<IncomingStream> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            incoming = async { self.accept_rx.lock().await.recv().await } => incoming,
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        self.network.unregister(&self.endpoint, &self.identity);
        debug!(node = %self.identity.fmt_short(), "Memory transport closed");
    }
}

//! Transport abstraction for gossip links
//!
//! Decouples the session manager from iroh. Production nodes run on
//! [`IrohTransport`] (QUIC); tests and simulations use the in-memory
//! [`MemoryTransport`] on a shared [`MemoryNetwork`].
//!
//! A transport only has to do three things: dial a peer at an endpoint and
//! hand back a bidirectional byte stream, surface incoming streams, and
//! report the local identity and endpoints. Framing, handshakes and peer
//! verification happen above it.

mod memory;
mod quic;

pub use self::memory::{MemoryNetwork, MemoryTransport};
pub use self::quic::{IrohOptions, IrohTransport};

use std::any::Any;
use std::fmt;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DialError;
use crate::types::{Endpoint, NodeId};

/// ALPN identifying gossip links
pub const GOSSIP_ALPN: &[u8] = b"/rumor-gossip/1";

/// Boxed send half of a link
pub type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// Boxed receive half of a link
pub type BoxedRead = Box<dyn AsyncRead + Send + Unpin>;

/// A bidirectional byte stream to one peer
///
/// The optional guard keeps transport resources (such as the QUIC
/// connection the stream belongs to) alive for as long as the stream is.
pub struct BiStream {
    pub send: BoxedWrite,
    pub recv: BoxedRead,
    guard: Option<Box<dyn Any + Send + Sync>>,
}

impl BiStream {
    /// Wrap a send and receive half
    pub fn new(send: BoxedWrite, recv: BoxedRead) -> Self {
        Self {
            send,
            recv,
            guard: None,
        }
    }

    /// Attach a value that must outlive the stream
    pub fn with_guard(mut self, guard: impl Any + Send + Sync) -> Self {
        self.guard = Some(Box::new(guard));
        self
    }

    /// Split into halves plus the guard
    pub(crate) fn into_parts(self) -> (BoxedWrite, BoxedRead, Option<Box<dyn Any + Send + Sync>>) {
        (self.send, self.recv, self.guard)
    }
}

impl fmt::Debug for BiStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BiStream")
            .field("guarded", &self.guard.is_some())
            .finish()
    }
}

/// A stream opened by a remote peer
///
/// `peer` is the identity the transport authenticated (or, for transports
/// without authentication, the identity the dialer claimed).
#[derive(Debug)]
pub struct IncomingStream {
    pub peer: NodeId,
    pub stream: BiStream,
}

/// Transport layer abstraction
///
/// Object safe so a node can hold `Arc<dyn Transport>`.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    /// This node's identity
    fn local_id(&self) -> NodeId;

    /// Endpoints at which this node can currently be reached
    fn local_endpoints(&self) -> Vec<Endpoint>;

    /// Open a stream to `identity` at `endpoint` speaking `protocol`.
    ///
    /// Fails if nothing answers at the endpoint, if a different identity
    /// answers, or if the remote does not speak `protocol`.
    async fn dial(
        &self,
        endpoint: &Endpoint,
        identity: &NodeId,
        protocol: &[u8],
    ) -> Result<BiStream, DialError>;

    /// Wait for the next incoming stream; `None` once the transport is closed
    async fn accept(&self) -> Option<IncomingStream>;

    /// Stop accepting and release the local endpoint
    async fn close(&self);
}

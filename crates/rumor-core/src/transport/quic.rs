//! QUIC transport via iroh
//!
//! Gossip links are iroh connections negotiated with [`GOSSIP_ALPN`]. The
//! node's iroh public key *is* its [`NodeId`], so identity verification of
//! dialed peers comes from the QUIC handshake itself.
//!
//! Peer endpoints are either direct socket addresses (`ip:port`) or relay
//! URLs. Dialing registers them with a [`StaticProvider`] so iroh can use
//! them without any external discovery service.

use std::sync::Arc;

use async_trait::async_trait;
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::{AcceptError, ProtocolHandler, Router};
use iroh::{EndpointAddr, PublicKey, RelayMode, RelayUrl, SecretKey};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{BiStream, IncomingStream, Transport, GOSSIP_ALPN};
use crate::error::{DialError, TransportError};
use crate::types::{Endpoint, NodeId};

const INCOMING_QUEUE: usize = 64;

impl From<PublicKey> for NodeId {
    fn from(key: PublicKey) -> Self {
        NodeId::from_bytes(*key.as_bytes())
    }
}

impl TryFrom<NodeId> for PublicKey {
    type Error = DialError;

    fn try_from(id: NodeId) -> Result<Self, Self::Error> {
        PublicKey::from_bytes(id.as_bytes())
            .map_err(|e| DialError::Refused(format!("invalid public key: {}", e)))
    }
}

/// Options for binding an [`IrohTransport`]
#[derive(Debug, Clone)]
pub struct IrohOptions {
    /// Use the default relay servers. Disable for purely local meshes.
    pub relay: bool,
}

impl Default for IrohOptions {
    fn default() -> Self {
        Self { relay: true }
    }
}

/// Router handler forwarding incoming gossip streams to the transport
#[derive(Debug, Clone)]
struct GossipAcceptor {
    incoming_tx: mpsc::Sender<IncomingStream>,
}

impl ProtocolHandler for GossipAcceptor {
    async fn accept(&self, conn: Connection) -> Result<(), AcceptError> {
        let peer = NodeId::from(conn.remote_id());
        debug!(peer = %peer.fmt_short(), "Accepting gossip connection");

        let (send, recv) = conn.accept_bi().await.map_err(AcceptError::from_err)?;
        let stream = BiStream::new(Box::new(send), Box::new(recv)).with_guard(conn);

        if self
            .incoming_tx
            .send(IncomingStream { peer, stream })
            .await
            .is_err()
        {
            debug!(peer = %peer.fmt_short(), "Transport closed, dropping incoming link");
        }
        Ok(())
    }
}

/// [`Transport`] over iroh QUIC connections
pub struct IrohTransport {
    endpoint: iroh::Endpoint,
    router: Router,
    static_provider: StaticProvider,
    secret_key: SecretKey,
    incoming_rx: Mutex<mpsc::Receiver<IncomingStream>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("node", &NodeId::from(self.endpoint.id()))
            .finish()
    }
}

impl IrohTransport {
    /// Bind an endpoint, generating a secret key when none is given.
    pub async fn bind(
        secret_key: Option<SecretKey>,
        options: IrohOptions,
    ) -> Result<Arc<Self>, TransportError> {
        let secret_key = secret_key.unwrap_or_else(|| SecretKey::generate(&mut rand::rng()));
        let static_provider = StaticProvider::new();

        let mut builder = iroh::Endpoint::builder()
            .secret_key(secret_key.clone())
            .alpns(vec![GOSSIP_ALPN.to_vec()])
            .discovery(static_provider.clone());
        if !options.relay {
            builder = builder.relay_mode(RelayMode::Disabled);
        }

        let endpoint = builder
            .bind()
            .await
            .map_err(|e| TransportError::Bind(e.to_string()))?;

        let node = NodeId::from(endpoint.id());
        info!(node = %node.fmt_short(), relay = options.relay, "Endpoint bound");

        let (incoming_tx, incoming_rx) = mpsc::channel(INCOMING_QUEUE);
        let router = Router::builder(endpoint.clone())
            .accept(GOSSIP_ALPN, GossipAcceptor { incoming_tx })
            .spawn();

        Ok(Arc::new(Self {
            endpoint,
            router,
            static_provider,
            secret_key,
            incoming_rx: Mutex::new(incoming_rx),
            closed: CancellationToken::new(),
        }))
    }

    /// The secret key backing this node's identity
    pub fn secret_key(&self) -> &SecretKey {
        &self.secret_key
    }

    fn endpoint_addr(
        &self,
        endpoint: &Endpoint,
        identity: &NodeId,
    ) -> Result<EndpointAddr, DialError> {
        let key = PublicKey::try_from(*identity)?;
        let addr = EndpointAddr::new(key);

        if let Some(socket) = endpoint.socket_addr() {
            return Ok(addr.with_ip_addr(socket));
        }
        let relay: RelayUrl = endpoint
            .as_str()
            .parse()
            .map_err(|e| DialError::Refused(format!("unusable endpoint {}: {}", endpoint, e)))?;
        Ok(addr.with_relay_url(relay))
    }
}

#[async_trait]
impl Transport for IrohTransport {
    fn local_id(&self) -> NodeId {
        NodeId::from(self.endpoint.id())
    }

    fn local_endpoints(&self) -> Vec<Endpoint> {
        let addr = self.endpoint.addr();
        addr.ip_addrs()
            .map(|socket| Endpoint::new(socket.to_string()))
            .chain(addr.relay_urls().map(|url| Endpoint::new(url.to_string())))
            .collect()
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

        let addr = self.endpoint_addr(endpoint, identity)?;
        self.static_provider.add_endpoint_info(addr.clone());

        let conn = self
            .endpoint
            .connect(addr, protocol)
            .await
            .map_err(|e| DialError::Refused(e.to_string()))?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| DialError::Refused(format!("failed to open stream: {}", e)))?;

        debug!(peer = %identity.fmt_short(), %endpoint, "Gossip connection established");
        Ok(BiStream::new(Box::new(send), Box::new(recv)).with_guard(conn))
    }

    async fn accept(&self) -> Option<IncomingStream> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            incoming = async { self.incoming_rx.lock().await.recv().await } => incoming,
        }
    }

    async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
        info!("Endpoint closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_public_key_conversion() {
        let key = SecretKey::generate(&mut rand::rng()).public();
        let id = NodeId::from(key);
        assert_eq!(id.as_bytes(), key.as_bytes());
        assert_eq!(PublicKey::try_from(id).unwrap(), key);
    }

    #[tokio::test]
    async fn test_bind_without_relay() {
        let transport = IrohTransport::bind(None, IrohOptions { relay: false })
            .await
            .unwrap();
        let id = transport.local_id();
        assert_eq!(id, NodeId::from(transport.secret_key().public()));
        transport.close().await;
        assert!(transport.accept().await.is_none());
    }
}

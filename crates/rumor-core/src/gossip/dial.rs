//! Outbound link establishment
//!
//! Dials a peer at each of its known endpoints, performs the `Hello` /
//! `Welcome` handshake, and retries the whole round with exponential
//! backoff. Non-transient failures such as a protocol mismatch are final.

use std::sync::Arc;

use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::wire::{Frame, Link, RejectReason};
use crate::address_book::AddressBook;
use crate::config::GossipConfig;
use crate::error::DialError;
use crate::transport::{Transport, GOSSIP_ALPN};
use crate::types::{Endpoint, NodeId, PeerAddress, TopicId};

/// A link whose handshake was accepted
pub(crate) struct Connected {
    pub link: Link,
    /// Neighbors the acceptor advertised for peer exchange
    pub peers: Vec<PeerAddress>,
}

#[derive(Debug, Clone)]
pub(crate) struct Dialer {
    transport: Arc<dyn Transport>,
    address_book: AddressBook,
    config: Arc<GossipConfig>,
}

impl Dialer {
    pub fn new(
        transport: Arc<dyn Transport>,
        address_book: AddressBook,
        config: Arc<GossipConfig>,
    ) -> Self {
        Self {
            transport,
            address_book,
            config,
        }
    }

    /// Connect to `peer` for `topic`, giving up when `cancel` fires
    pub async fn connect(
        &self,
        peer: NodeId,
        topic: TopicId,
        cancel: &CancellationToken,
    ) -> Result<Connected, DialError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DialError::Cancelled),
            result = self.connect_with_retries(peer, topic) => result,
        }
    }

    async fn connect_with_retries(
        &self,
        peer: NodeId,
        topic: TopicId,
    ) -> Result<Connected, DialError> {
        let attempts = self.config.dial_attempts.max(1);
        let mut last_error = DialError::Refused("no known endpoints".into());

        for attempt in 1..=attempts {
            let endpoints = self
                .address_book
                .lookup(&peer)
                .map(|addr| addr.endpoints().to_vec())
                .unwrap_or_default();
            if endpoints.is_empty() {
                return Err(DialError::Refused(format!(
                    "no known endpoints for {}",
                    peer.fmt_short()
                )));
            }

            for endpoint in &endpoints {
                match self.try_endpoint(endpoint, peer, topic).await {
                    Ok(connected) => return Ok(connected),
                    Err(e) if !e.is_transient() => {
                        warn!(
                            peer = %peer.fmt_short(),
                            %endpoint,
                            error = %e,
                            "Dial failed permanently"
                        );
                        return Err(e);
                    }
                    Err(e) => {
                        debug!(peer = %peer.fmt_short(), %endpoint, error = %e, "Endpoint failed");
                        last_error = e;
                    }
                }
            }

            if attempt < attempts {
                let delay = self.config.dial_backoff(attempt);
                warn!(
                    peer = %peer.fmt_short(),
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Dial failed, retrying"
                );
                tokio::time::sleep(delay).await;
            } else {
                warn!(
                    peer = %peer.fmt_short(),
                    attempt,
                    error = %last_error,
                    "Dial failed after all retries"
                );
            }
        }

        Err(last_error)
    }

    async fn try_endpoint(
        &self,
        endpoint: &Endpoint,
        peer: NodeId,
        topic: TopicId,
    ) -> Result<Connected, DialError> {
        let stream = timeout(
            self.config.dial_timeout(),
            self.transport.dial(endpoint, &peer, GOSSIP_ALPN),
        )
        .await
        .map_err(|_| DialError::Timeout)??;

        let mut link = Link::new(stream, self.config.max_frame_length());
        let hello = Frame::Hello {
            protocol: GOSSIP_ALPN.to_vec(),
            topic,
            from: self.transport.local_id(),
            endpoints: self.transport.local_endpoints(),
        };

        let reply = timeout(self.config.handshake_timeout(), async {
            link.sink.send(&hello).await?;
            link.stream.recv().await
        })
        .await
        .map_err(|_| DialError::Timeout)?
        .map_err(|e| DialError::Refused(format!("handshake failed: {}", e)))?;

        match reply {
            Some(Frame::Welcome { peers }) => {
                let local = self.transport.local_id();
                for addr in peers.iter().filter(|addr| addr.id() != local) {
                    self.address_book.add_or_merge(addr.clone());
                }
                debug!(peer = %peer.fmt_short(), exchanged = peers.len(), "Handshake accepted");
                Ok(Connected { link, peers })
            }
            Some(Frame::Reject {
                reason: RejectReason::ProtocolMismatch,
            }) => Err(DialError::ProtocolMismatch),
            Some(Frame::Reject { reason }) => {
                Err(DialError::Refused(format!("rejected: {:?}", reason)))
            }
            Some(other) => Err(DialError::Refused(format!(
                "unexpected handshake reply: {:?}",
                other
            ))),
            None => Err(DialError::Refused("link closed during handshake".into())),
        }
    }
}

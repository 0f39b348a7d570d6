//! Link framing
//!
//! Every gossip link carries length-prefixed postcard [`Frame`]s. The
//! dialer opens with `Hello`; the acceptor answers `Welcome` or `Reject`;
//! after that both sides only exchange `Gossip` frames.

use std::any::Any;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::error::WireError;
use crate::transport::{BiStream, BoxedRead, BoxedWrite};
use crate::types::{Endpoint, NodeId, PeerAddress, TopicId};

/// Why an acceptor refused a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum RejectReason {
    ProtocolMismatch,
    UnknownTopic,
    TopicFull,
    IdentityMismatch,
}

/// A message on a gossip link
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum Frame {
    /// First frame from the dialer
    Hello {
        protocol: Vec<u8>,
        topic: TopicId,
        from: NodeId,
        endpoints: Vec<Endpoint>,
    },
    /// Acceptance, carrying the acceptor's other neighbors for peer exchange
    Welcome { peers: Vec<PeerAddress> },
    /// Refusal; the link is closed after it
    Reject { reason: RejectReason },
    /// A flooded application message
    Gossip {
        origin: NodeId,
        epoch: u64,
        seq: u64,
        hops: u8,
        payload: Vec<u8>,
    },
}

fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Framed writer half of a link
pub(crate) struct FrameSink {
    inner: FramedWrite<BoxedWrite, LengthDelimitedCodec>,
}

impl FrameSink {
    pub fn new(send: BoxedWrite, max_frame_length: usize) -> Self {
        Self {
            inner: FramedWrite::new(send, codec(max_frame_length)),
        }
    }

    /// Encode and send one frame
    pub async fn send(&mut self, frame: &Frame) -> Result<(), WireError> {
        let bytes = postcard::to_allocvec(frame)?;
        self.inner.send(Bytes::from(bytes)).await?;
        Ok(())
    }

    /// Flush and shut down the write side
    pub async fn close(&mut self) -> Result<(), WireError> {
        SinkExt::<Bytes>::close(&mut self.inner).await?;
        Ok(())
    }
}

/// Framed reader half of a link
pub(crate) struct FrameStream {
    inner: FramedRead<BoxedRead, LengthDelimitedCodec>,
}

impl FrameStream {
    pub fn new(recv: BoxedRead, max_frame_length: usize) -> Self {
        Self {
            inner: FramedRead::new(recv, codec(max_frame_length)),
        }
    }

    /// Receive the next frame, `None` once the peer closed the stream
    pub async fn recv(&mut self) -> Result<Option<Frame>, WireError> {
        match self.inner.next().await {
            Some(Ok(bytes)) => Ok(Some(postcard::from_bytes(&bytes)?)),
            Some(Err(e)) => Err(e.into()),
            None => Ok(None),
        }
    }
}

/// Keeps transport resources of a link alive
pub(crate) type LinkGuard = Box<dyn Any + Send + Sync>;

/// A framed link to one peer
pub(crate) struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
    pub guard: Option<LinkGuard>,
}

impl Link {
    pub fn new(stream: BiStream, max_frame_length: usize) -> Self {
        let (send, recv, guard) = stream.into_parts();
        Self {
            sink: FrameSink::new(send, max_frame_length),
            stream: FrameStream::new(recv, max_frame_length),
            guard,
        }
    }

    /// Refuse the peer and close the link
    pub async fn reject(mut self, reason: RejectReason) {
        if let Err(e) = self.sink.send(&Frame::Reject { reason }).await {
            tracing::debug!(error = %e, ?reason, "Failed to send reject");
        }
        let _ = self.sink.close().await;
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

//! Broadcast handle for a joined topic

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::session::{Command, SessionId, SessionShared};
use crate::error::BroadcastError;
use crate::types::TopicId;

/// Handle to broadcast on a joined topic
///
/// Cheap to clone and safe to share across tasks. Bound to one session:
/// once that session closes every broadcast fails with
/// [`BroadcastError::SessionClosed`], even if the topic is joined again.
#[derive(Clone)]
pub struct TopicSender {
    shared: Arc<SessionShared>,
    commands: mpsc::Sender<Command>,
    max_payload: usize,
}

impl TopicSender {
    pub(crate) fn new(
        shared: Arc<SessionShared>,
        commands: mpsc::Sender<Command>,
        max_payload: usize,
    ) -> Self {
        Self {
            shared,
            commands,
            max_payload,
        }
    }

    /// Broadcast a message to every member of the topic
    ///
    /// Waits while a neighbor's link queue is full, up to the configured
    /// send timeout; a neighbor still full after that is disconnected.
    pub async fn broadcast(&self, msg: impl Into<Bytes>) -> Result<(), BroadcastError> {
        let payload: Bytes = msg.into();

        if self.is_closed() {
            return Err(BroadcastError::SessionClosed);
        }
        if payload.len() > self.max_payload {
            return Err(BroadcastError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_payload,
            });
        }

        debug!(topic = ?self.shared.topic, len = payload.len(), "Broadcasting message");

        let (reply, done) = oneshot::channel();
        self.commands
            .send(Command::Broadcast { payload, reply })
            .await
            .map_err(|_| BroadcastError::SessionClosed)?;
        let flood = done.await.map_err(|_| BroadcastError::SessionClosed)??;
        flood.deliver(&self.commands).await;
        Ok(())
    }

    /// The topic this sender broadcasts on
    pub fn topic(&self) -> TopicId {
        self.shared.topic
    }

    /// Identifier of the session this sender is bound to
    pub fn session_id(&self) -> SessionId {
        self.shared.id
    }

    /// Whether the bound session has closed
    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }
}

impl fmt::Debug for TopicSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSender")
            .field("topic", &self.shared.topic)
            .field("session", &self.shared.id)
            .finish()
    }
}

//! Topic-based gossip
//!
//! Join a topic through a [`GossipNode`], broadcast with the returned
//! [`TopicSender`] and observe the session through the [`TopicReceiver`].
//! Messages are flooded over neighbor links with duplicate suppression and
//! per-originator ordering.

mod cache;
mod dial;
mod events;
mod node;
mod sender;
mod session;
mod wire;

pub use events::{CloseReason, Event, GossipMessage, SessionState, TopicReceiver};
pub use node::GossipNode;
pub use sender::TopicSender;
pub use session::SessionId;

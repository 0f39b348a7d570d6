//! Rumor Core Library
//!
//! Topic-based gossip messaging over peer-to-peer links.
//!
//! ## Overview
//!
//! Nodes are identified by their 32-byte public key. A node joins a 32-byte
//! topic by dialing a few bootstrap peers it already knows the address of;
//! from then on every message broadcast on the topic is flooded to all
//! members, delivered once and in per-sender order.
//!
//! ## Core Principles
//!
//! - **No coordinator**: Any member can bootstrap any other
//! - **Explicit context**: Identity, transport and address book are passed in
//! - **Pluggable transport**: QUIC via iroh in production, in-memory for tests
//!
//! ## Quick Start
//!
//! ```ignore
//! use rumor_core::{AddressBook, GossipConfig, GossipNode, IrohOptions, IrohTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = IrohTransport::bind(None, IrohOptions::default()).await?;
//!     let node = GossipNode::spawn(transport, AddressBook::new(), GossipConfig::default());
//!
//!     let (sender, mut receiver) = node.join([7u8; 32], &[]).await?;
//!     sender.broadcast("hello").await?;
//!
//!     while let Some(event) = receiver.recv().await {
//!         println!("{:?}", event);
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod address_book;
pub mod config;
pub mod error;
pub mod gossip;
pub mod hex;
pub mod transport;
pub mod types;

// Re-exports
pub use address_book::AddressBook;
pub use config::{GossipConfig, RejoinPolicy};
pub use error::{
    AddressError, BroadcastError, ConfigError, DecodeError, DialError, JoinError,
    TransportError, WireError,
};
pub use gossip::{
    CloseReason, Event, GossipMessage, GossipNode, SessionId, SessionState, TopicReceiver,
    TopicSender,
};
pub use transport::{
    IrohOptions, IrohTransport, MemoryNetwork, MemoryTransport, Transport, GOSSIP_ALPN,
};
pub use types::*;

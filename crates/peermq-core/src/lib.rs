//! peermq Core Library
//!
//! Peer-to-peer mailboxes over authenticated, sparsely replicated logs.
//!
//! ## Overview
//!
//! Every node owns one append-only send-log per correspondent and keeps a
//! read-only mirror (listen-log) of each correspondent's log addressed to it.
//! Only peers in the local directory may replicate into this node, and the
//! mirror fetches just the entries a reader asks for.
//!
//! ## Core Principles
//!
//! - **Pairwise**: one log per (author, recipient) pair, no groups
//! - **Authenticated**: handshakes prove log identity, entries are signed
//! - **At-least-once**: replication may repeat, consumption state is idempotent
//!
//! ## Quick Start
//!
//! ```ignore
//! use peermq_core::{Mailbox, MailboxConfig, MemoryNetwork, ReadOptions};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let network = Arc::new(MemoryNetwork::new());
//!     let alice = Mailbox::open(MailboxConfig::new("/tmp/alice"), network.clone()).await?;
//!     let bob = Mailbox::open(MailboxConfig::new("/tmp/bob"), network).await?;
//!
//!     alice.add_peer(bob.id().await?).await?;
//!     alice.listen().await?;
//!     bob.send(alice.id().await?, b"hello").await?;
//!
//!     let mut unread = alice.create_read_stream("unread", ReadOptions::live());
//!     if let Some(msg) = unread.next().await {
//!         let msg = msg?;
//!         alice.archive(msg.from, msg.seq).await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod consumption;
pub mod engine;
pub mod error;
pub mod feed;
pub mod identity;
pub mod peers;
pub mod single_flight;
pub mod storage;
pub mod stream;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use config::MailboxConfig;
pub use consumption::ConsumptionTracker;
pub use engine::Mailbox;
pub use error::{MqError, MqResult};
pub use feed::{Feed, FeedCache, FeedRole};
pub use identity::{IdentityManager, KeyPair, KeyPairs};
pub use peers::{DirectoryEvent, PeerDirectory};
pub use single_flight::{OnceFlight, SingleFlight};
pub use storage::Storage;
pub use stream::ReadStream;
pub use sync::{Connection, MailboxEvent, SessionEvent, SessionManager, SessionStatus};
pub use transport::{AddressBook, IrohTransport, MemoryNetwork, Route, Transport};
pub use types::*;

//! Replication sessions between mailboxes
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionManager                                                 │
//! │  ├── outbound: connect -> handshake::initiate -> upload         │
//! │  │   └── fixed-delay reconnect until closed or auth failure     │
//! │  └── inbound:  accept -> handshake::accept -> download          │
//! │      └── torn down when the peer leaves the directory           │
//! │                                                                 │
//! │  framing: LengthDelimitedCodec + postcard WireMessage           │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! - **Challenge / Hello / Welcome**: mutual identity proof (see [`handshake`])
//! - **Have**: author's log length, the mirror's remote-length watermark
//! - **Request / Data / Missing**: fetch of wanted slots, or of every
//!   missing slot while message events have subscribers
//! - **Ack**: mirror stored a slot, surfaced as [`SessionEvent::Ack`]

pub mod events;
pub mod framing;
pub mod handshake;
pub mod manager;
pub mod protocol;
pub mod replication;

pub use events::{MailboxEvent, SessionEvent, SessionStatus};
pub use manager::{Connection, SessionManager};
pub use protocol::WireMessage;

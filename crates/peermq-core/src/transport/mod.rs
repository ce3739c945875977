//! Connection transports
//!
//! The mailbox only needs two things from a network: accept byte streams
//! addressed to its mailbox id, and open a byte stream to another mailbox id.
//! Everything above that (framing, authentication, replication) lives in
//! [`crate::sync`].
//!
//! - [`MemoryNetwork`]: in-process swarm, used by tests and simulations
//! - [`IrohTransport`]: QUIC via iroh with a static address book

mod quic;
mod memory;

use futures::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::error::MqResult;
use crate::types::PeerId;

pub use self::quic::{AddressBook, IrohTransport, Route, MAILBOX_ALPN};
pub use self::memory::MemoryNetwork;

/// A bidirectional byte stream
pub trait Duplex: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Duplex for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Boxed stream handed to the session layer
pub type RawStream = Box<dyn Duplex>;

/// One accepted stream
pub struct Inbound {
    pub stream: RawStream,
    /// Transport public key the remote authenticated with, for transports
    /// that authenticate endpoints (QUIC). The handshake rejects a Hello
    /// announcing a different key.
    pub remote_key: Option<[u8; 32]>,
}

impl Inbound {
    /// Stream from a transport that does not authenticate endpoints
    pub fn unauthenticated(stream: RawStream) -> Self {
        Self {
            stream,
            remote_key: None,
        }
    }
}

/// Inbound connections for one listening mailbox.
///
/// Dropping it stops accepting.
pub struct Incoming {
    rx: mpsc::Receiver<Inbound>,
}

impl Incoming {
    pub fn new(rx: mpsc::Receiver<Inbound>) -> Self {
        Self { rx }
    }

    /// Next inbound stream, or `None` once the transport stops listening
    pub async fn accept(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

/// Byte-stream transport between mailbox ids.
pub trait Transport: Send + Sync + 'static {
    /// Start accepting connections addressed to `id`
    fn listen(&self, id: PeerId) -> BoxFuture<'_, MqResult<Incoming>>;

    /// Open a stream to the mailbox `id`
    fn connect(&self, id: PeerId) -> BoxFuture<'_, MqResult<RawStream>>;
}

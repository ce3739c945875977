//! QUIC transport via iroh
//!
//! The endpoint's secret key is the node's transport key, so the endpoint id
//! is the transport public key the handshake proves ownership of. Peers are
//! reached through a static address book (mailbox id -> endpoint address);
//! DHT discovery is not provided.

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::{BoxFuture, FutureExt};
use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::{Connection, RecvStream, SendStream};
use iroh::protocol::{ProtocolHandler, Router};
use iroh::{Endpoint, EndpointAddr, PublicKey, RelayUrl, SecretKey};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Inbound, Incoming, RawStream, Transport};
use crate::error::{MqError, MqResult};
use crate::types::PeerId;

/// ALPN for mailbox replication
pub const MAILBOX_ALPN: &[u8] = b"peermq/mailbox/1";

/// How to reach one mailbox over iroh
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Endpoint id (transport public key), hex
    pub endpoint: String,
    #[serde(default)]
    pub relay_url: Option<String>,
    /// Direct socket addresses
    #[serde(default)]
    pub addrs: Vec<String>,
}

impl Route {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            relay_url: None,
            addrs: Vec::new(),
        }
    }

    pub fn with_relay(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    pub fn with_addr(mut self, addr: impl Into<String>) -> Self {
        self.addrs.push(addr.into());
        self
    }

    /// Convert to an iroh EndpointAddr
    pub fn to_endpoint_addr(&self) -> MqResult<EndpointAddr> {
        let id = PeerId::from_key(self.endpoint.as_bytes())?;
        let public_key = PublicKey::from_bytes(id.as_bytes())
            .map_err(|e| MqError::InvalidKey(format!("invalid endpoint id: {}", e)))?;

        let mut addr = EndpointAddr::new(public_key);
        if let Some(ref relay) = self.relay_url {
            let relay_url: RelayUrl = relay
                .parse()
                .map_err(|e| MqError::Network(format!("invalid relay URL: {}", e)))?;
            addr = addr.with_relay_url(relay_url);
        }
        for direct in &self.addrs {
            let socket_addr: SocketAddr = direct
                .parse()
                .map_err(|e| MqError::Network(format!("invalid socket address: {}", e)))?;
            addr = addr.with_ip_addr(socket_addr);
        }
        Ok(addr)
    }
}

/// Mailbox id -> route, persisted as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressBook {
    routes: BTreeMap<String, Route>,
}

impl AddressBook {
    /// Load from `path`; a missing file is an empty book
    pub fn load(path: impl AsRef<Path>) -> MqResult<Self> {
        match std::fs::read(path.as_ref()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: impl AsRef<Path>) -> MqResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    /// Add or replace the route for `peer` after validating it
    pub fn insert(&mut self, peer: PeerId, route: Route) -> MqResult<()> {
        route.to_endpoint_addr()?;
        self.routes.insert(peer.to_hex(), route);
        Ok(())
    }

    pub fn get(&self, peer: &PeerId) -> Option<&Route> {
        self.routes.get(&peer.to_hex())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// One QUIC bidirectional stream plus the connection that carries it
struct IrohStream {
    _conn: Connection,
    send: SendStream,
    recv: RecvStream,
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(io::Error::from)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

/// Router handler that forwards each inbound stream to the listener
#[derive(Debug, Clone)]
struct MailboxProtocolHandler {
    tx: mpsc::Sender<Inbound>,
}

impl ProtocolHandler for MailboxProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let tx = self.tx.clone();

        async move {
            debug!(peer = %conn.remote_id(), "Router accepting mailbox connection");
            let (send, recv) = conn
                .accept_bi()
                .await
                .map_err(iroh::protocol::AcceptError::from_err)?;

            let remote_key = *conn.remote_id().as_bytes();
            let stream = IrohStream {
                _conn: conn,
                send,
                recv,
            };
            // Listener gone: dropping the stream closes it
            let _ = tx
                .send(Inbound {
                    stream: Box::new(stream),
                    remote_key: Some(remote_key),
                })
                .await;
            Ok(())
        }
    }
}

/// iroh-backed [`Transport`]
pub struct IrohTransport {
    endpoint: Endpoint,
    static_provider: StaticProvider,
    book: RwLock<AddressBook>,
    router: Mutex<Option<Router>>,
}

impl IrohTransport {
    /// Bind an endpoint whose identity is the node's transport key.
    pub async fn bind(transport_secret: [u8; 32], book: AddressBook) -> MqResult<Self> {
        let secret_key = SecretKey::from(transport_secret);
        let static_provider = StaticProvider::new();

        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![MAILBOX_ALPN.to_vec()])
            .discovery(static_provider.clone())
            .bind()
            .await
            .map_err(|e| MqError::Network(format!("Failed to bind endpoint: {}", e)))?;

        info!(endpoint_id = %endpoint.id(), routes = book.len(), "Endpoint bound");

        Ok(Self {
            endpoint,
            static_provider,
            book: RwLock::new(book),
            router: Mutex::new(None),
        })
    }

    /// This node's endpoint id
    pub fn endpoint_id(&self) -> iroh::EndpointId {
        self.endpoint.id()
    }

    /// Route other nodes can store to reach this endpoint directly
    pub fn local_route(&self) -> Route {
        let addr = self.endpoint.addr();
        addr.ip_addrs().fold(
            Route::new(hex::encode(self.endpoint.id().as_bytes())),
            |route, ip| route.with_addr(ip.to_string()),
        )
    }

    /// Add or replace a route at runtime
    pub fn add_route(&self, peer: PeerId, route: Route) -> MqResult<()> {
        self.book.write().insert(peer, route)
    }

    /// Stop accepting and close the endpoint
    pub async fn shutdown(&self) {
        let router = self.router.lock().take();
        if let Some(router) = router {
            if let Err(e) = router.shutdown().await {
                debug!(error = %e, "Router shutdown failed");
            }
        }
        self.endpoint.close().await;
    }
}

impl Transport for IrohTransport {
    fn listen(&self, id: PeerId) -> BoxFuture<'_, MqResult<Incoming>> {
        async move {
            let (tx, rx) = mpsc::channel(64);
            let router = Router::builder(self.endpoint.clone())
                .accept(MAILBOX_ALPN, MailboxProtocolHandler { tx })
                .spawn();
            let previous = self.router.lock().replace(router);
            if let Some(previous) = previous {
                let _ = previous.shutdown().await;
            }
            info!(mailbox = %id.short(), endpoint_id = %self.endpoint.id(), "Listening for mailbox connections");
            Ok(Incoming::new(rx))
        }
        .boxed()
    }

    fn connect(&self, id: PeerId) -> BoxFuture<'_, MqResult<RawStream>> {
        async move {
            let route = self
                .book
                .read()
                .get(&id)
                .cloned()
                .ok_or_else(|| MqError::Network(format!("no route to {}", id.short())))?;
            let addr = route.to_endpoint_addr()?;
            self.static_provider.add_endpoint_info(addr.clone());

            let conn = self
                .endpoint
                .connect(addr, MAILBOX_ALPN)
                .await
                .map_err(|e| MqError::Network(format!("Failed to connect: {}", e)))?;
            let (send, recv) = conn
                .open_bi()
                .await
                .map_err(|e| MqError::Network(format!("Failed to open bi stream: {}", e)))?;

            debug!(peer = %id.short(), "Opened mailbox stream");
            Ok(Box::new(IrohStream {
                _conn: conn,
                send,
                recv,
            }) as RawStream)
        }
        .boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn endpoint_hex() -> String {
        let secret = SecretKey::from([9u8; 32]);
        hex::encode(secret.public().as_bytes())
    }

    #[test]
    fn test_route_to_endpoint_addr() {
        let route = Route::new(endpoint_hex()).with_addr("127.0.0.1:4433");
        let addr = route.to_endpoint_addr().unwrap();
        assert_eq!(hex::encode(addr.id.as_bytes()), endpoint_hex());
        assert_eq!(addr.ip_addrs().count(), 1);
    }

    #[test]
    fn test_route_rejects_bad_socket_addr() {
        let route = Route::new(endpoint_hex()).with_addr("not-an-addr");
        assert!(route.to_endpoint_addr().is_err());
        let mut book = AddressBook::default();
        assert!(book.insert(PeerId([1u8; 32]), route).is_err());
        assert!(book.is_empty());
    }

    #[test]
    fn test_address_book_persists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("routes.json");
        assert!(AddressBook::load(&path).unwrap().is_empty());

        let peer = PeerId([1u8; 32]);
        let mut book = AddressBook::default();
        book.insert(peer, Route::new(endpoint_hex())).unwrap();
        book.save(&path).unwrap();

        let loaded = AddressBook::load(&path).unwrap();
        assert_eq!(loaded.get(&peer), Some(&Route::new(endpoint_hex())));
    }
}

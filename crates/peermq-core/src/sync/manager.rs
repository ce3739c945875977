//! Session manager for inbound and outbound replication
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  SessionManager                                                 │
//! │  ├── outbound: HashMap<PeerId, Connection>                      │
//! │  │   └── Sessions started implicitly by `send`                  │
//! │  ├── inbound: HashMap<PeerId, HashMap<u64, CancellationToken>>  │
//! │  │   └── Live mirror sessions, torn down on peer removal        │
//! │  ├── listening: OnceFlight<()>                                  │
//! │  └── events: broadcast::Sender<MailboxEvent>                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Outbound sessions reconnect after a fixed delay until closed or until the
//! remote fails to prove the expected identity. Inbound sessions are never
//! retried from this side; the connector is responsible for reconnecting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::{MailboxEvent, SessionEvent, SessionStatus};
use super::{framing, handshake, replication};
use crate::config::MailboxConfig;
use crate::error::{MqError, MqResult};
use crate::feed::FeedCache;
use crate::identity::IdentityManager;
use crate::peers::{DirectoryEvent, PeerDirectory};
use crate::single_flight::OnceFlight;
use crate::transport::{Inbound, Incoming, Transport};
use crate::types::{Message, PeerId};

struct ConnectionInner {
    peer: PeerId,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
}

/// Handle to one outbound replication session. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.inner.peer)
            .field("status", &*self.inner.status.borrow())
            .finish()
    }
}

impl Connection {
    fn new(peer: PeerId, cancel: CancellationToken, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            inner: Arc::new(ConnectionInner {
                peer,
                status: watch::channel(SessionStatus::Idle).0,
                events,
                cancel,
            }),
        }
    }

    /// Peer whose mailbox this session replicates to
    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    pub fn status(&self) -> SessionStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status.subscribe()
    }

    /// Subscribe to status changes, acknowledgements and errors
    pub fn events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Stop the session and cancel any pending reconnect.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    /// True once the session will never reconnect
    pub fn is_closed(&self) -> bool {
        self.inner.status.borrow().is_terminal()
    }

    /// Wait until the session reaches a terminal status.
    pub async fn closed(&self) -> SessionStatus {
        let mut status = self.watch_status();
        let result = status.wait_for(SessionStatus::is_terminal).await;
        match result {
            Ok(terminal) => terminal.clone(),
            Err(_) => SessionStatus::Closed,
        }
    }

    fn set_status(&self, next: SessionStatus) {
        let changed = self.inner.status.send_if_modified(|current| {
            if current.is_terminal() || *current == next {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            debug!(peer = %self.inner.peer, status = %next, "Session status changed");
            self.emit(SessionEvent::StatusChanged(next));
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.inner.events.send(event);
    }
}

struct ManagerInner {
    config: MailboxConfig,
    identity: Arc<IdentityManager>,
    directory: Arc<PeerDirectory>,
    feeds: FeedCache,
    transport: Arc<dyn Transport>,
    events: broadcast::Sender<MailboxEvent>,
    outbound: Mutex<HashMap<PeerId, Connection>>,
    inbound: Mutex<HashMap<PeerId, HashMap<u64, CancellationToken>>>,
    next_inbound: AtomicU64,
    listening: OnceFlight<()>,
    shutdown: CancellationToken,
}

/// Owns every replication session of one mailbox.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    pub fn new(
        config: MailboxConfig,
        identity: Arc<IdentityManager>,
        directory: Arc<PeerDirectory>,
        feeds: FeedCache,
        transport: Arc<dyn Transport>,
        events: broadcast::Sender<MailboxEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                config,
                identity,
                directory,
                feeds,
                transport,
                events,
                outbound: Mutex::new(HashMap::new()),
                inbound: Mutex::new(HashMap::new()),
                next_inbound: AtomicU64::new(0),
                listening: OnceFlight::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Start accepting inbound sessions. Calling it again is a no-op.
    pub async fn listen(&self) -> MqResult<()> {
        self.ensure_open()?;
        let inner = self.inner.clone();
        self.inner
            .listening
            .get_or_try_init(|| async move {
                let id = inner.identity.public_key().await?;
                let removals = inner.directory.subscribe();
                let incoming = inner.transport.listen(id).await?;
                tokio::spawn(accept_loop(inner.clone(), incoming));
                tokio::spawn(watch_removals(inner, removals));
                info!(mailbox = %id, "Listening for inbound sessions");
                Ok(())
            })
            .await
    }

    /// Open an explicit outbound session to `to`.
    pub fn connect(&self, to: PeerId) -> MqResult<Connection> {
        self.ensure_open()?;
        Ok(self.inner.spawn_session(to))
    }

    /// The session `send` replicates through, started on first use.
    pub fn ensure_session(&self, to: PeerId) -> MqResult<Connection> {
        self.ensure_open()?;
        let mut outbound = self.inner.outbound.lock();
        if let Some(conn) = outbound.get(&to) {
            if !conn.is_closed() && !conn.inner.cancel.is_cancelled() {
                return Ok(conn.clone());
            }
        }
        let conn = self.inner.spawn_session(to);
        outbound.insert(to, conn.clone());
        Ok(conn)
    }

    /// Number of live inbound sessions from `peer`
    pub fn inbound_sessions(&self, peer: &PeerId) -> usize {
        self.inner.inbound.lock().get(peer).map_or(0, HashMap::len)
    }

    /// Close every session and stop accepting.
    pub fn close(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        info!("Shutting down session manager");
        self.inner.shutdown.cancel();
        self.inner.outbound.lock().clear();
        self.inner.inbound.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn ensure_open(&self) -> MqResult<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(MqError::Closed("mailbox".into()));
        }
        Ok(())
    }
}

impl ManagerInner {
    fn spawn_session(self: &Arc<Self>, to: PeerId) -> Connection {
        let conn = Connection::new(to, self.shutdown.child_token(), self.config.event_capacity);
        tokio::spawn(run_outbound(self.clone(), conn.clone()));
        conn
    }

    /// One connection attempt: connect, authenticate, upload until closed.
    async fn replicate_to(&self, conn: &Connection) -> MqResult<()> {
        let peer = conn.peer();
        let (feed, keys) = tokio::try_join!(self.feeds.open_send(peer), self.identity.key_pairs())?;

        let stream = self.transport.connect(peer).await?;
        let (mut sink, mut source) = framing::split(stream, self.config.max_frame_len);

        conn.set_status(SessionStatus::Authenticating);
        handshake::initiate(&mut sink, &mut source, &keys, &peer).await?;

        conn.set_status(SessionStatus::Replicating);
        info!(peer = %peer, length = feed.length(), "Replicating send log");
        let result = replication::upload(&feed, &mut sink, &mut source, &conn.inner.cancel, |seq| {
            debug!(peer = %peer, seq, "Remote acknowledged entry");
            conn.emit(SessionEvent::Ack { seq });
        })
        .await;
        sink.close().await;
        result
    }

    async fn serve_inbound(self: Arc<Self>, inbound: Inbound) -> MqResult<()> {
        let keys = self.identity.key_pairs().await?;
        let (mut sink, mut source) = framing::split(inbound.stream, self.config.max_frame_len);

        // Dropping the stream without a reply is the only answer an
        // unauthorized connector gets
        let accepted =
            handshake::accept(&mut sink, &mut source, &keys, &self.directory, inbound.remote_key).await?;
        let Some(peer) = accepted else {
            return Ok(());
        };

        let feed = self.feeds.open_listen(peer).await?;
        let (id, cancel) = self.register_inbound(peer);
        // A removal that raced the handshake was not seen by the watcher
        if !self.directory.contains(&peer).await? {
            debug!(peer = %peer, "Peer removed during handshake");
            self.unregister_inbound(&peer, id);
            return Ok(());
        }

        info!(peer = %peer, "Inbound replication started");
        let events = self.events.clone();
        // Fetch ahead of readers while someone listens for message events
        let prefetch = || events.receiver_count() > 0;
        let result = replication::download(&feed, &mut sink, &mut source, &cancel, prefetch, |entry| {
            let _ = events.send(MailboxEvent::Message(Message {
                from: peer,
                seq: entry.seq,
                data: entry.data.clone(),
            }));
        })
        .await;

        self.unregister_inbound(&peer, id);
        sink.close().await;
        info!(peer = %peer, "Inbound replication ended");
        result
    }

    fn register_inbound(&self, peer: PeerId) -> (u64, CancellationToken) {
        let id = self.next_inbound.fetch_add(1, Ordering::Relaxed);
        let cancel = self.shutdown.child_token();
        self.inbound
            .lock()
            .entry(peer)
            .or_default()
            .insert(id, cancel.clone());
        (id, cancel)
    }

    fn unregister_inbound(&self, peer: &PeerId, id: u64) {
        let mut inbound = self.inbound.lock();
        if let Some(sessions) = inbound.get_mut(peer) {
            sessions.remove(&id);
            if sessions.is_empty() {
                inbound.remove(peer);
            }
        }
    }

    fn tear_down_inbound(&self, peer: &PeerId) {
        let sessions = self.inbound.lock().remove(peer);
        if let Some(sessions) = sessions {
            info!(peer = %peer, count = sessions.len(), "Tearing down sessions of removed peer");
            for cancel in sessions.values() {
                cancel.cancel();
            }
        }
    }
}

/// Reconnect loop for one outbound session.
async fn run_outbound(inner: Arc<ManagerInner>, conn: Connection) {
    let peer = conn.peer();
    let cancel = conn.inner.cancel.clone();
    let delay = inner.config.reconnect_delay;

    loop {
        conn.set_status(SessionStatus::Connecting);
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            result = inner.replicate_to(&conn) => result,
        };

        match result {
            Ok(()) => debug!(peer = %peer, "Replication stream ended"),
            Err(e) if matches!(e.root(), MqError::AuthenticationFailed(_)) => {
                warn!(peer = %peer, error = %e, "Remote failed authentication, giving up");
                conn.set_status(SessionStatus::Failed(e.to_string()));
                conn.emit(SessionEvent::Error(Arc::new(e)));
                conn.emit(SessionEvent::Closed);
                return;
            }
            Err(e) if e.is_storage() => {
                warn!(peer = %peer, error = %e, "Session storage failure");
                conn.emit(SessionEvent::Error(Arc::new(e)));
            }
            Err(e) => debug!(peer = %peer, error = %e, "Session dropped"),
        }

        if cancel.is_cancelled() {
            break;
        }
        conn.set_status(SessionStatus::Disconnected);
        warn!(peer = %peer, ?delay, "Reconnect scheduled");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    conn.set_status(SessionStatus::Closed);
    conn.emit(SessionEvent::Closed);
    debug!(peer = %peer, "Outbound session closed");
}

async fn accept_loop(inner: Arc<ManagerInner>, mut incoming: Incoming) {
    loop {
        let inbound = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            inbound = incoming.accept() => inbound,
        };
        let Some(inbound) = inbound else {
            debug!("Transport stopped accepting");
            break;
        };

        let inner = inner.clone();
        tokio::spawn(async move {
            let shutdown = inner.shutdown.clone();
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = inner.serve_inbound(inbound) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Inbound session failed");
                    }
                }
            }
        });
    }
    debug!("Accept loop stopped");
}

async fn watch_removals(inner: Arc<ManagerInner>, mut removals: broadcast::Receiver<DirectoryEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = removals.recv() => event,
        };
        match event {
            Ok(DirectoryEvent::Removed(peer)) => inner.tear_down_inbound(&peer),
            Ok(DirectoryEvent::Added(_)) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "Directory watcher lagged, rechecking sessions");
                let peers: Vec<PeerId> = inner.inbound.lock().keys().copied().collect();
                for peer in peers {
                    match inner.directory.contains(&peer).await {
                        Ok(true) => {}
                        Ok(false) => inner.tear_down_inbound(&peer),
                        Err(e) => warn!(peer = %peer, error = %e, "Directory check failed"),
                    }
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

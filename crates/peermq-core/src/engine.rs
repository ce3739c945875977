//! Mailbox - the primary entry point for peermq
//!
//! Mailbox coordinates storage, identity, the peer directory, log handles,
//! consumption state and replication sessions for:
//! - Sending messages to authorized correspondents
//! - Receiving their messages over inbound replication
//! - Reading, archiving and clearing received messages
//!
//! # Example
//!
//! ```ignore
//! use peermq_core::{Mailbox, MailboxConfig, MemoryNetwork, ReadOptions};
//!
//! let network = Arc::new(MemoryNetwork::new());
//! let mailbox = Mailbox::open(MailboxConfig::new("~/.peermq/data"), network).await?;
//!
//! mailbox.add_peer(&friend_hex).await?;
//! mailbox.listen().await?;
//! mailbox.send(&friend_hex, b"hello").await?;
//!
//! let mut unread = mailbox.create_read_stream("unread", ReadOptions::live());
//! while let Some(msg) = unread.next().await {
//!     let msg = msg?;
//!     mailbox.archive(msg.from, msg.seq).await?;
//! }
//! ```

use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::config::MailboxConfig;
use crate::consumption::ConsumptionTracker;
use crate::error::MqResult;
use crate::feed::FeedCache;
use crate::identity::{IdentityManager, KeyPairs};
use crate::peers::PeerDirectory;
use crate::storage::{BitsetStore, KvStore, Storage};
use crate::stream::ReadStream;
use crate::sync::{Connection, MailboxEvent, SessionManager};
use crate::transport::Transport;
use crate::types::{PeerId, ReadOptions, View};

/// A node's peer-to-peer mailbox.
///
/// Dropping the mailbox closes every session.
pub struct Mailbox {
    config: MailboxConfig,
    identity: Arc<IdentityManager>,
    directory: Arc<PeerDirectory>,
    feeds: FeedCache,
    tracker: Arc<ConsumptionTracker>,
    sessions: SessionManager,
    events: broadcast::Sender<MailboxEvent>,
}

impl Mailbox {
    /// Open (or create) the mailbox stored under `config.data_dir`.
    ///
    /// Identity and the peer directory load in the background; failures
    /// there are reported through [`Mailbox::events`] and again to whichever
    /// call first needs them.
    ///
    /// # Errors
    ///
    /// Returns `MqError::Io` if the data directory cannot be created.
    /// Returns `MqError::Database` if the database cannot be opened.
    pub async fn open(config: MailboxConfig, transport: Arc<dyn Transport>) -> MqResult<Self> {
        info!(data_dir = ?config.data_dir(), "Opening mailbox");
        std::fs::create_dir_all(config.data_dir())?;

        let storage = Storage::new(config.database_path())?;
        let kv: Arc<dyn KvStore> = Arc::new(storage.kv());
        let bits: Arc<dyn BitsetStore> = Arc::new(storage.bitsets());

        let identity = Arc::new(IdentityManager::new(kv.clone()));
        let directory = Arc::new(PeerDirectory::new(kv.clone()));
        let feeds = FeedCache::new(storage.db_handle(), kv.clone(), identity.clone());
        let tracker = Arc::new(ConsumptionTracker::new(bits, kv));
        let (events, _) = broadcast::channel(config.event_capacity);
        let sessions = SessionManager::new(
            config.clone(),
            identity.clone(),
            directory.clone(),
            feeds.clone(),
            transport,
            events.clone(),
        );

        let mailbox = Self {
            config,
            identity,
            directory,
            feeds,
            tracker,
            sessions,
            events,
        };
        mailbox.spawn_startup_loads();
        Ok(mailbox)
    }

    fn spawn_startup_loads(&self) {
        let identity = self.identity.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = identity.key_pairs().await {
                error!(error = %e, "Failed to load identity");
                let _ = events.send(MailboxEvent::Error(Arc::new(e)));
            }
        });

        let directory = self.directory.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            if let Err(e) = directory.ready().await {
                error!(error = %e, "Failed to load peer directory");
                let _ = events.send(MailboxEvent::Error(Arc::new(e)));
            }
        });
    }

    pub fn data_dir(&self) -> &Path {
        self.config.data_dir()
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// This node's mailbox address
    pub async fn id(&self) -> MqResult<PeerId> {
        self.identity.public_key().await
    }

    pub async fn key_pairs(&self) -> MqResult<Arc<KeyPairs>> {
        self.identity.key_pairs().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peer Management
    // ═══════════════════════════════════════════════════════════════════════

    /// Authorize `key` (32 bytes or 64 hex characters).
    pub async fn add_peer(&self, key: impl AsRef<[u8]>) -> MqResult<()> {
        self.directory.add_peer(key).await
    }

    /// Revoke `key`, tearing down any inbound session from it.
    pub async fn remove_peer(&self, key: impl AsRef<[u8]>) -> MqResult<()> {
        self.directory.remove_peer(key).await
    }

    pub async fn add_peers<I>(&self, keys: I) -> MqResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.directory.add_peers(keys).await
    }

    pub async fn remove_peers<I>(&self, keys: I) -> MqResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        self.directory.remove_peers(keys).await
    }

    pub async fn list_peers(&self) -> MqResult<Vec<PeerId>> {
        self.directory.list_peers().await
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Sending
    // ═══════════════════════════════════════════════════════════════════════

    /// Append `message` to the send-log for `to` and return its sequence.
    ///
    /// Starts a replication session to `to` on first use.
    pub async fn send(&self, to: impl AsRef<[u8]>, message: &[u8]) -> MqResult<u64> {
        let to = PeerId::from_key(to.as_ref())?;
        self.sessions.ensure_session(to)?;
        let feed = self.feeds.open_send(to).await?;
        let seq = feed.append(message)?;
        debug!(to = %to, seq, bytes = message.len(), "Message sent");
        Ok(seq)
    }

    /// The session `send` replicates through for `to`.
    ///
    /// Subscribe to its events before sending to observe acknowledgements.
    pub fn session_for(&self, to: impl AsRef<[u8]>) -> MqResult<Connection> {
        let to = PeerId::from_key(to.as_ref())?;
        self.sessions.ensure_session(to)
    }

    /// Open an explicit outbound session, independent of `send`.
    pub fn connect(&self, to: impl AsRef<[u8]>) -> MqResult<Connection> {
        let to = PeerId::from_key(to.as_ref())?;
        self.sessions.connect(to)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Receiving
    // ═══════════════════════════════════════════════════════════════════════

    /// Accept inbound sessions from authorized peers. Idempotent.
    pub async fn listen(&self) -> MqResult<()> {
        self.sessions.listen().await
    }

    /// Merged stream over every listen-log through the view called `name`.
    ///
    /// Unknown names fail the stream with `UnsupportedView`.
    pub fn create_read_stream(&self, name: &str, options: ReadOptions) -> ReadStream {
        ReadStream::spawn(
            self.feeds.clone(),
            self.tracker.clone(),
            name.parse::<View>(),
            options,
        )
    }

    /// Mark a message read and archived. Archiving twice is a no-op.
    pub async fn archive(&self, from: impl AsRef<[u8]>, seq: u64) -> MqResult<()> {
        let from = PeerId::from_key(from.as_ref())?;
        self.tracker.mark_archived(&from, seq)
    }

    /// Mark a message read without archiving it.
    pub async fn mark_read(&self, from: impl AsRef<[u8]>, seq: u64) -> MqResult<()> {
        let from = PeerId::from_key(from.as_ref())?;
        self.tracker.mark_read(&from, seq)
    }

    /// Delete a message and reclaim its log slot.
    ///
    /// A peer without a listen-log only gets the deleted mark; no log is
    /// created for it.
    pub async fn clear(&self, from: impl AsRef<[u8]>, seq: u64) -> MqResult<()> {
        let from = PeerId::from_key(from.as_ref())?;
        let feed = self.feeds.known_listen(&from).await?;
        self.tracker.mark_deleted(&from, seq, feed.as_ref())
    }

    /// Process-wide notifications: startup failures and replicated messages
    pub fn events(&self) -> broadcast::Receiver<MailboxEvent> {
        self.events.subscribe()
    }

    /// Close every session and stop listening.
    pub fn close(&self) {
        self.sessions.close();
    }

    pub fn is_closed(&self) -> bool {
        self.sessions.is_closed()
    }
}

impl Drop for Mailbox {
    fn drop(&mut self) {
        self.sessions.close();
    }
}

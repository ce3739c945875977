//! Log handle cache
//!
//! Opens send-logs and listen-logs lazily and at most once per peer. Handles
//! live for the process lifetime, so a reconnecting session reuses the same
//! log instead of reopening it.
//!
//! Listen-logs that were ever opened are remembered in the KV store
//! (`listens`), so a read stream created after a restart still covers peers
//! whose messages are already on disk. Components interested in "a new
//! listen-log was opened" take a [`FeedSubscription`]; dropping it
//! deregisters the listener.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use redb::Database;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::{Feed, FeedRole};
use crate::error::{MqError, MqResult};
use crate::identity::IdentityManager;
use crate::single_flight::{OnceFlight, SingleFlight};
use crate::storage::KvStore;
use crate::types::PeerId;

/// KV key listing every peer with a listen-log
pub const LISTENS_KEY: &str = "listens";

#[derive(Default)]
struct ListenRegistry {
    feeds: BTreeMap<PeerId, Feed>,
    subscribers: HashMap<u64, mpsc::UnboundedSender<Feed>>,
    next_id: u64,
}

struct CacheInner {
    db: Arc<RwLock<Database>>,
    kv: Arc<dyn KvStore>,
    identity: Arc<IdentityManager>,
    feeds: SingleFlight<(FeedRole, PeerId), Feed>,
    registry: Arc<Mutex<ListenRegistry>>,
    restored: OnceFlight<()>,
}

/// Deduplicated, lazily populated map of open logs.
#[derive(Clone)]
pub struct FeedCache {
    inner: Arc<CacheInner>,
}

impl FeedCache {
    pub fn new(
        db: Arc<RwLock<Database>>,
        kv: Arc<dyn KvStore>,
        identity: Arc<IdentityManager>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                db,
                kv,
                identity,
                feeds: SingleFlight::new(),
                registry: Arc::new(Mutex::new(ListenRegistry::default())),
                restored: OnceFlight::new(),
            }),
        }
    }

    /// The log this node appends to for `peer`.
    pub async fn open_send(&self, peer: PeerId) -> MqResult<Feed> {
        self.inner.open_feed(FeedRole::Send, peer).await
    }

    /// The local mirror of `peer`'s log.
    pub async fn open_listen(&self, peer: PeerId) -> MqResult<Feed> {
        self.restore().await?;
        let feed = self.inner.open_feed(FeedRole::Listen, peer).await?;
        self.inner.register(&feed, true)?;
        Ok(feed)
    }

    /// Already-open listen-log for `peer`
    pub fn get_listen(&self, peer: &PeerId) -> Option<Feed> {
        self.inner.feeds.get(&(FeedRole::Listen, *peer))
    }

    /// Listen-log for `peer` if one was ever opened, here or before a restart.
    ///
    /// Never creates a log.
    pub async fn known_listen(&self, peer: &PeerId) -> MqResult<Option<Feed>> {
        self.restore().await?;
        Ok(self.inner.registry.lock().feeds.get(peer).cloned())
    }

    /// Snapshot of every known listen-log plus a feed of ones opened later.
    ///
    /// The snapshot and the registration happen atomically, so no log is
    /// missed or reported twice.
    pub async fn subscribe_listen(&self) -> MqResult<FeedSubscription> {
        self.restore().await?;
        let mut registry = self.inner.registry.lock();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.subscribers.insert(id, tx);
        Ok(FeedSubscription {
            existing: registry.feeds.values().cloned().collect(),
            rx,
            id,
            registry: Arc::downgrade(&self.inner.registry),
        })
    }

    /// Reopen every listen-log recorded in the KV store, once.
    async fn restore(&self) -> MqResult<()> {
        let inner = self.inner.clone();
        self.inner
            .restored
            .get_or_try_init(|| async move {
                let peers = match inner.kv.get(LISTENS_KEY)? {
                    Some(bytes) => serde_json::from_slice::<Vec<String>>(&bytes)?,
                    None => Vec::new(),
                };
                for hex in &peers {
                    let peer = PeerId::from_key(hex.as_bytes())?;
                    let feed = inner.open_feed(FeedRole::Listen, peer).await?;
                    inner.register(&feed, false)?;
                }
                debug!(count = peers.len(), "Restored listen logs");
                Ok(())
            })
            .await
    }
}

impl CacheInner {
    async fn open_feed(self: &Arc<Self>, role: FeedRole, peer: PeerId) -> MqResult<Feed> {
        let db = self.db.clone();
        let identity = self.identity.clone();
        self.feeds
            .get_or_try_init((role, peer), || async move {
                let keys = identity.key_pairs().await?;
                let feed = tokio::task::spawn_blocking(move || match role {
                    FeedRole::Send => Feed::open_send(db, &keys.log, peer),
                    FeedRole::Listen => Feed::open_listen(db, keys.public_key(), peer),
                })
                .await
                .map_err(|e| MqError::Storage(format!("log open task failed: {}", e)))??;
                info!(peer = %peer, role = role.as_str(), "Opened log handle");
                Ok(feed)
            })
            .await
    }

    /// Record a listen-log and tell subscribers about it.
    fn register(&self, feed: &Feed, persist: bool) -> MqResult<()> {
        let mut registry = self.registry.lock();
        if registry.feeds.contains_key(&feed.peer()) {
            return Ok(());
        }

        if persist {
            let mut peers: Vec<String> = registry.feeds.keys().map(PeerId::to_hex).collect();
            peers.push(feed.peer().to_hex());
            peers.sort();
            self.kv.put(LISTENS_KEY, &serde_json::to_vec(&peers)?)?;
            self.kv.flush()?;
        }

        registry.feeds.insert(feed.peer(), feed.clone());
        registry
            .subscribers
            .retain(|_, tx| tx.send(feed.clone()).is_ok());
        Ok(())
    }
}

/// Cancellable interest in newly opened listen-logs.
pub struct FeedSubscription {
    existing: Vec<Feed>,
    rx: mpsc::UnboundedReceiver<Feed>,
    id: u64,
    registry: Weak<Mutex<ListenRegistry>>,
}

impl FeedSubscription {
    /// Listen-logs that were open when the subscription was taken
    pub fn take_existing(&mut self) -> Vec<Feed> {
        std::mem::take(&mut self.existing)
    }

    /// Next newly opened listen-log
    pub async fn next(&mut self) -> Option<Feed> {
        self.rx.recv().await
    }
}

impl Drop for FeedSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().subscribers.remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use tempfile::TempDir;

    fn create_test_cache(path: &std::path::Path) -> (FeedCache, Storage) {
        let storage = Storage::new(path).unwrap();
        let kv: Arc<dyn KvStore> = Arc::new(storage.kv());
        let identity = Arc::new(IdentityManager::new(kv.clone()));
        (FeedCache::new(storage.db_handle(), kv, identity), storage)
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_one_handle() {
        let temp = TempDir::new().unwrap();
        let (cache, _storage) = create_test_cache(&temp.path().join("cache.redb"));
        let peer = PeerId([1u8; 32]);

        let (a, b) = tokio::join!(cache.open_send(peer), cache.open_send(peer));
        assert!(a.unwrap().ptr_eq(&b.unwrap()));

        let (c, d) = tokio::join!(cache.open_listen(peer), cache.open_listen(peer));
        let (c, d) = (c.unwrap(), d.unwrap());
        assert!(c.ptr_eq(&d));
        assert_eq!(c.role(), FeedRole::Listen);
        assert!(cache.get_listen(&peer).unwrap().ptr_eq(&c));
    }

    #[tokio::test]
    async fn test_subscription_sees_existing_and_new_logs() {
        let temp = TempDir::new().unwrap();
        let (cache, _storage) = create_test_cache(&temp.path().join("cache.redb"));
        let first = PeerId([1u8; 32]);
        let second = PeerId([2u8; 32]);

        cache.open_listen(first).await.unwrap();
        let mut sub = cache.subscribe_listen().await.unwrap();
        let existing: Vec<PeerId> = sub.take_existing().iter().map(Feed::peer).collect();
        assert_eq!(existing, vec![first]);

        cache.open_listen(second).await.unwrap();
        cache.open_listen(first).await.unwrap();
        assert_eq!(sub.next().await.unwrap().peer(), second);

        // Send-logs are not listen-logs
        cache.open_send(PeerId([3u8; 32])).await.unwrap();
        assert!(sub.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dropping_subscription_deregisters() {
        let temp = TempDir::new().unwrap();
        let (cache, _storage) = create_test_cache(&temp.path().join("cache.redb"));
        let sub = cache.subscribe_listen().await.unwrap();
        assert_eq!(cache.inner.registry.lock().subscribers.len(), 1);
        drop(sub);
        assert!(cache.inner.registry.lock().subscribers.is_empty());
    }

    #[tokio::test]
    async fn test_listen_logs_restored_after_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("cache.redb");
        let peer = PeerId([6u8; 32]);
        {
            let (cache, _storage) = create_test_cache(&path);
            cache.open_listen(peer).await.unwrap();
        }
        let (cache, _storage) = create_test_cache(&path);
        let mut sub = cache.subscribe_listen().await.unwrap();
        let restored: Vec<PeerId> = sub.take_existing().iter().map(Feed::peer).collect();
        assert_eq!(restored, vec![peer]);
    }
}

//! Authorized peer directory
//!
//! The directory is the set of mailbox addresses allowed to replicate into
//! this node, plus an index from discovery key to public key used by the
//! inbound handshake.
//!
//! ## Persistence
//!
//! ```text
//! peers        -> JSON array of lowercase hex public keys (sorted, deduplicated)
//! dk!<dk hex>  -> 32-byte public key
//! ```
//!
//! The set is loaded once; callers arriving before the load finishes wait on
//! the same readiness barrier. Every mutation stages the peer list and the
//! index entries, flushes the KV store, and only then updates the in-memory
//! set and notifies subscribers.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::config::DEFAULT_EVENT_CAPACITY;
use crate::error::{MqError, MqResult};
use crate::single_flight::OnceFlight;
use crate::storage::KvStore;
use crate::types::{DiscoveryKey, PeerId};

/// KV key holding the serialized peer list
pub const PEERS_KEY: &str = "peers";

const DISCOVERY_PREFIX: &str = "dk!";

fn discovery_entry(dk: &DiscoveryKey) -> String {
    format!("{}{}", DISCOVERY_PREFIX, dk.to_hex())
}

/// Change notifications from the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEvent {
    Added(PeerId),
    Removed(PeerId),
}

#[derive(Default)]
struct DirectoryState {
    peers: BTreeSet<PeerId>,
    by_discovery: HashMap<DiscoveryKey, PeerId>,
}

impl DirectoryState {
    fn from_peers(peers: BTreeSet<PeerId>) -> Self {
        let by_discovery = peers.iter().map(|p| (p.discovery_key(), *p)).collect();
        Self {
            peers,
            by_discovery,
        }
    }
}

/// Authorized peer set with a discovery-key index.
pub struct PeerDirectory {
    kv: Arc<dyn KvStore>,
    state: Arc<RwLock<DirectoryState>>,
    ready: OnceFlight<()>,
    /// Serializes mutations so each one sees the previous one's result
    write_lock: Mutex<()>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl PeerDirectory {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        let (events, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self {
            kv,
            state: Arc::new(RwLock::new(DirectoryState::default())),
            ready: OnceFlight::new(),
            write_lock: Mutex::new(()),
            events,
        }
    }

    /// Wait until the persisted peer set has been loaded.
    pub async fn ready(&self) -> MqResult<()> {
        let kv = self.kv.clone();
        let state = self.state.clone();
        self.ready
            .get_or_try_init(|| async move {
                let peers = load_peers(kv.as_ref())?;
                debug!(count = peers.len(), "Loaded peer directory");
                *state.write() = DirectoryState::from_peers(peers);
                Ok(())
            })
            .await
    }

    /// Subscribe to additions and removals
    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub async fn add_peer(&self, key: impl AsRef<[u8]>) -> MqResult<()> {
        self.add_peers([key]).await
    }

    pub async fn remove_peer(&self, key: impl AsRef<[u8]>) -> MqResult<()> {
        self.remove_peers([key]).await
    }

    /// Authorize every key in the batch, or none if any key is malformed.
    pub async fn add_peers<I>(&self, keys: I) -> MqResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let keys = parse_batch(keys)?;
        self.apply(keys, true).await
    }

    /// Revoke every key in the batch, or none if any key is malformed.
    pub async fn remove_peers<I>(&self, keys: I) -> MqResult<()>
    where
        I: IntoIterator,
        I::Item: AsRef<[u8]>,
    {
        let keys = parse_batch(keys)?;
        self.apply(keys, false).await
    }

    /// Sorted list of authorized peers
    pub async fn list_peers(&self) -> MqResult<Vec<PeerId>> {
        self.ready().await?;
        Ok(self.state.read().peers.iter().copied().collect())
    }

    /// Whether `peer` is currently authorized
    pub async fn contains(&self, peer: &PeerId) -> MqResult<bool> {
        self.ready().await?;
        Ok(self.state.read().peers.contains(peer))
    }

    /// Look up the authorized peer that announced `dk`.
    pub async fn resolve_by_discovery_key(&self, dk: &DiscoveryKey) -> MqResult<Option<PeerId>> {
        self.ready().await?;
        Ok(self.state.read().by_discovery.get(dk).copied())
    }

    async fn apply(&self, keys: Vec<PeerId>, add: bool) -> MqResult<()> {
        self.ready().await?;
        let _guard = self.write_lock.lock().await;

        let previous = self.state.read().peers.clone();
        let mut next = previous.clone();
        let changed: Vec<PeerId> = keys
            .into_iter()
            .filter(|k| if add { next.insert(*k) } else { next.remove(k) })
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        if let Err(e) = self.persist(&next, &changed, add) {
            warn!(error = %e, "Failed to persist peer directory");
            // Drop the staged change so a later flush cannot commit it
            if let Err(rollback) = self.persist_staged(&previous, &changed, !add) {
                warn!(error = %rollback, "Failed to roll back staged peer directory");
            }
            return Err(e);
        }

        {
            let mut state = self.state.write();
            for peer in &changed {
                if add {
                    state.by_discovery.insert(peer.discovery_key(), *peer);
                } else {
                    state.by_discovery.remove(&peer.discovery_key());
                }
            }
            state.peers = next;
        }

        for peer in changed {
            if add {
                info!(peer = %peer, "Peer added");
                let _ = self.events.send(DirectoryEvent::Added(peer));
            } else {
                info!(peer = %peer, "Peer removed");
                let _ = self.events.send(DirectoryEvent::Removed(peer));
            }
        }
        Ok(())
    }

    fn persist(&self, peers: &BTreeSet<PeerId>, changed: &[PeerId], add: bool) -> MqResult<()> {
        self.persist_staged(peers, changed, add)?;
        self.kv.flush()
    }

    fn persist_staged(&self, peers: &BTreeSet<PeerId>, changed: &[PeerId], add: bool) -> MqResult<()> {
        let list: Vec<String> = peers.iter().map(PeerId::to_hex).collect();
        self.kv.put(PEERS_KEY, &serde_json::to_vec(&list)?)?;
        for peer in changed {
            let entry = discovery_entry(&peer.discovery_key());
            if add {
                self.kv.put(&entry, peer.as_bytes())?;
            } else {
                self.kv.delete(&entry)?;
            }
        }
        Ok(())
    }
}

fn parse_batch<I>(keys: I) -> MqResult<Vec<PeerId>>
where
    I: IntoIterator,
    I::Item: AsRef<[u8]>,
{
    keys.into_iter()
        .map(|k| PeerId::from_key(k.as_ref()))
        .collect()
}

fn load_peers(kv: &dyn KvStore) -> MqResult<BTreeSet<PeerId>> {
    let Some(bytes) = kv.get(PEERS_KEY)? else {
        return Ok(BTreeSet::new());
    };
    let list: Vec<String> = serde_json::from_slice(&bytes)?;
    list.iter()
        .map(|hex| {
            PeerId::from_key(hex.as_bytes())
                .map_err(|e| MqError::Storage(format!("corrupt peer list entry: {}", e)))
        })
        .collect()
}

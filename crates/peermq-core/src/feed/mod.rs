//! Append-only signed logs
//!
//! Every correspondent gets two logs on this node:
//!
//! - **send/<peer>**: this node appends, the peer replicates it as a reader.
//! - **listen/<peer>**: a sparse, read-only mirror of the peer's send-log
//!   addressed to this node. Only slots somebody asked for are fetched.
//!
//! Each entry is signed by its author's log key over
//! `recipient || seq || data`, so a mirror can verify every replicated slot
//! without trusting the connection it arrived on.
//!
//! ## Storage Schema
//!
//! ```text
//! FEED_SLOTS table: "{namespace}:{seq}"  -> postcard StoredSlot (entry or cleared tombstone)
//! FEED_HEADS table: "{namespace}:length" -> u64 LE, local length
//!                   "{namespace}:remote" -> u64 LE, last known remote length
//! ```

pub mod cache;

use std::collections::BTreeSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition, WriteTransaction};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::debug;

use crate::error::{MqError, MqResult};
use crate::identity::{self, KeyPair};
use crate::types::PeerId;

pub use cache::{FeedCache, FeedSubscription};

/// Table holding log slots
pub(crate) const FEED_SLOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("feed_slots");

/// Table holding per-log counters
pub(crate) const FEED_HEADS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("feed_heads");

/// Which side of a pairwise mailbox a log belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedRole {
    /// This node appends, the peer reads
    Send,
    /// The peer appends, this node mirrors
    Listen,
}

impl FeedRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedRole::Send => "send",
            FeedRole::Listen => "listen",
        }
    }
}

/// A replicated entry with its author signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEntry {
    pub seq: u64,
    pub data: Bytes,
    pub signature: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
enum StoredSlot {
    Entry { data: Vec<u8>, signature: Vec<u8> },
    Cleared,
}

fn format_slot_key(namespace: &str, seq: u64) -> String {
    format!("{}:{}", namespace, seq)
}

fn format_head_key(namespace: &str, field: &str) -> String {
    format!("{}:{}", namespace, field)
}

/// Bytes covered by an entry signature
fn signing_payload(recipient: &PeerId, seq: u64, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(32 + 8 + data.len());
    payload.extend_from_slice(recipient.as_bytes());
    payload.extend_from_slice(&seq.to_be_bytes());
    payload.extend_from_slice(data);
    payload
}

struct FeedInner {
    db: Arc<RwLock<Database>>,
    role: FeedRole,
    namespace: String,
    peer: PeerId,
    author: PeerId,
    recipient: PeerId,
    signer: Option<KeyPair>,
    /// Serializes writers so length updates are strictly sequential
    write_lock: Mutex<()>,
    length: watch::Sender<u64>,
    remote_length: watch::Sender<Option<u64>>,
    /// Bumped whenever a slot is stored or cleared
    arrivals: watch::Sender<u64>,
    wants: Mutex<BTreeSet<u64>>,
    wants_version: watch::Sender<u64>,
}

/// Handle to one append-only log. Cheap to clone.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl std::fmt::Debug for Feed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Feed")
            .field("namespace", &self.inner.namespace)
            .field("length", &self.length())
            .finish()
    }
}

impl Feed {
    /// Open the log this node appends to for `peer`.
    pub fn open_send(db: Arc<RwLock<Database>>, signer: &KeyPair, peer: PeerId) -> MqResult<Self> {
        let author = signer.public_key();
        Self::open(db, FeedRole::Send, peer, author, peer, Some(signer.clone()))
    }

    /// Open the sparse mirror of `peer`'s log addressed to `local`.
    pub fn open_listen(db: Arc<RwLock<Database>>, local: PeerId, peer: PeerId) -> MqResult<Self> {
        Self::open(db, FeedRole::Listen, peer, peer, local, None)
    }

    fn open(
        db: Arc<RwLock<Database>>,
        role: FeedRole,
        peer: PeerId,
        author: PeerId,
        recipient: PeerId,
        signer: Option<KeyPair>,
    ) -> MqResult<Self> {
        let namespace = format!("{}/{}", role.as_str(), peer.to_hex());

        let (length, remote) = {
            let guard = db.read();
            let write_txn = guard.begin_write()?;
            let heads = {
                let _ = write_txn.open_table(FEED_SLOTS_TABLE)?;
                let heads = write_txn.open_table(FEED_HEADS_TABLE)?;
                let length = read_head(&heads, &format_head_key(&namespace, "length"))?;
                let remote = read_head(&heads, &format_head_key(&namespace, "remote"))?;
                (length, remote)
            };
            write_txn.commit()?;
            heads
        };
        let length = length.unwrap_or(0);

        // A mirror never forgets how far the author is known to have written
        let remote = match (role, remote) {
            (FeedRole::Listen, Some(r)) => Some(r.max(length)),
            (FeedRole::Listen, None) if length > 0 => Some(length),
            _ => None,
        };

        debug!(namespace = %namespace, length, remote = ?remote, "Opened log");

        Ok(Self {
            inner: Arc::new(FeedInner {
                db,
                role,
                namespace,
                peer,
                author,
                recipient,
                signer,
                write_lock: Mutex::new(()),
                length: watch::channel(length).0,
                remote_length: watch::channel(remote).0,
                arrivals: watch::channel(0).0,
                wants: Mutex::new(BTreeSet::new()),
                wants_version: watch::channel(0).0,
            }),
        })
    }

    pub fn role(&self) -> FeedRole {
        self.inner.role
    }

    /// The correspondent this log is shared with
    pub fn peer(&self) -> PeerId {
        self.inner.peer
    }

    /// Storage namespace, e.g. `listen/<hex>`
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Whether two handles refer to the same open log
    pub fn ptr_eq(&self, other: &Feed) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// One past the highest slot stored locally
    pub fn length(&self) -> u64 {
        *self.inner.length.borrow()
    }

    pub fn watch_length(&self) -> watch::Receiver<u64> {
        self.inner.length.subscribe()
    }

    /// Last length announced by the author, if any
    pub fn remote_length(&self) -> Option<u64> {
        *self.inner.remote_length.borrow()
    }

    pub fn watch_remote_length(&self) -> watch::Receiver<Option<u64>> {
        self.inner.remote_length.subscribe()
    }

    /// Append `data`, returning its sequence number.
    pub fn append(&self, data: &[u8]) -> MqResult<u64> {
        let signer = self
            .inner
            .signer
            .as_ref()
            .ok_or_else(|| MqError::ReadOnly(self.inner.namespace.clone()))?;

        let _guard = self.inner.write_lock.lock();
        let seq = self.length();
        let signature = signer.sign(&signing_payload(&self.inner.recipient, seq, data));
        let slot = StoredSlot::Entry {
            data: data.to_vec(),
            signature: signature.to_vec(),
        };

        self.write(|txn| {
            put_slot(txn, &self.inner.namespace, seq, &slot)?;
            put_head(txn, &self.inner.namespace, "length", seq + 1)
        })?;

        self.inner.length.send_replace(seq + 1);
        self.inner.arrivals.send_modify(|n| *n += 1);
        debug!(log = %self.inner.namespace, seq, bytes = data.len(), "Appended entry");
        Ok(seq)
    }

    /// Read a slot that is already stored locally.
    ///
    /// Returns `Err(Cleared)` for reclaimed slots and `Ok(None)` for slots not
    /// (yet) downloaded.
    pub fn get_local(&self, seq: u64) -> MqResult<Option<Bytes>> {
        match self.read_slot(seq)? {
            Some(StoredSlot::Entry { data, .. }) => Ok(Some(Bytes::from(data))),
            Some(StoredSlot::Cleared) => Err(MqError::Cleared {
                log: self.inner.namespace.clone(),
                seq,
            }),
            None => Ok(None),
        }
    }

    /// Read a slot, waiting for it to be downloaded or appended.
    ///
    /// On a mirror this registers the slot as wanted so the replication
    /// session fetches it.
    pub async fn get(&self, seq: u64) -> MqResult<Bytes> {
        let mut arrivals = self.inner.arrivals.subscribe();
        loop {
            if let Some(data) = self.get_local(seq)? {
                return Ok(data);
            }
            if self.inner.role == FeedRole::Listen {
                self.want(seq);
            }
            if arrivals.changed().await.is_err() {
                return Err(MqError::Closed(self.inner.namespace.clone()));
            }
        }
    }

    /// Whether the slot holds an entry or a cleared tombstone
    pub fn has_slot(&self, seq: u64) -> MqResult<bool> {
        Ok(self.read_slot(seq)?.is_some())
    }

    /// Stored entry with its signature, for upload
    pub fn entry(&self, seq: u64) -> MqResult<Option<SignedEntry>> {
        match self.read_slot(seq)? {
            Some(StoredSlot::Entry { data, signature }) => Ok(Some(SignedEntry {
                seq,
                data: Bytes::from(data),
                signature,
            })),
            _ => Ok(None),
        }
    }

    /// Store a replicated entry after verifying the author's signature.
    ///
    /// Returns true if the slot was new.
    pub fn put_remote(&self, entry: &SignedEntry) -> MqResult<bool> {
        if self.inner.role != FeedRole::Listen {
            return Err(MqError::ReadOnly(self.inner.namespace.clone()));
        }
        let payload = signing_payload(&self.inner.recipient, entry.seq, &entry.data);
        if !identity::verify(&self.inner.author, &payload, &entry.signature) {
            return Err(MqError::AuthenticationFailed(format!(
                "bad signature for {}:{}",
                self.inner.namespace, entry.seq
            )));
        }

        let _guard = self.inner.write_lock.lock();
        let seq = entry.seq;
        self.unwant(seq);
        if self.read_slot(seq)?.is_some() {
            return Ok(false);
        }

        let new_length = self.length().max(seq + 1);
        let slot = StoredSlot::Entry {
            data: entry.data.to_vec(),
            signature: entry.signature.clone(),
        };
        self.write(|txn| {
            put_slot(txn, &self.inner.namespace, seq, &slot)?;
            put_head(txn, &self.inner.namespace, "length", new_length)
        })?;

        self.inner.length.send_if_modified(|len| {
            let grew = new_length > *len;
            if grew {
                *len = new_length;
            }
            grew
        });
        self.inner.arrivals.send_modify(|n| *n += 1);
        debug!(log = %self.inner.namespace, seq, "Stored replicated entry");
        Ok(true)
    }

    /// Record the author's announced length. Never moves backwards.
    pub fn set_remote_length(&self, length: u64) -> MqResult<()> {
        let advanced = self.inner.remote_length.send_if_modified(|current| {
            if current.map_or(true, |c| length > c) {
                *current = Some(length);
                true
            } else {
                false
            }
        });
        if advanced {
            debug!(log = %self.inner.namespace, length, "Remote length advanced");
            self.write(|txn| put_head(txn, &self.inner.namespace, "remote", length))?;
        }
        Ok(())
    }

    /// Reclaim a slot. Reclaiming cannot be undone.
    pub fn clear(&self, seq: u64) -> MqResult<()> {
        let _guard = self.inner.write_lock.lock();
        self.unwant(seq);
        self.write(|txn| put_slot(txn, &self.inner.namespace, seq, &StoredSlot::Cleared))?;
        self.inner.arrivals.send_modify(|n| *n += 1);
        debug!(log = %self.inner.namespace, seq, "Cleared entry");
        Ok(())
    }

    /// Ask replication to fetch `seq`
    pub fn want(&self, seq: u64) {
        if self.inner.wants.lock().insert(seq) {
            self.inner.wants_version.send_modify(|v| *v += 1);
        }
    }

    fn unwant(&self, seq: u64) {
        self.inner.wants.lock().remove(&seq);
    }

    /// Slots requested but not yet stored
    pub fn pending_wants(&self) -> Vec<u64> {
        self.inner.wants.lock().iter().copied().collect()
    }

    /// Changes whenever a new slot is wanted
    pub fn watch_wants(&self) -> watch::Receiver<u64> {
        self.inner.wants_version.subscribe()
    }

    fn read_slot(&self, seq: u64) -> MqResult<Option<StoredSlot>> {
        let key = format_slot_key(&self.inner.namespace, seq);
        let db = self.inner.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(FEED_SLOTS_TABLE)?;
        match table.get(key.as_str())? {
            Some(v) => Ok(Some(postcard::from_bytes(v.value())?)),
            None => Ok(None),
        }
    }

    fn write(&self, f: impl FnOnce(&WriteTransaction) -> MqResult<()>) -> MqResult<()> {
        let db = self.inner.db.read();
        let write_txn = db.begin_write()?;
        f(&write_txn)?;
        write_txn.commit()?;
        Ok(())
    }
}

fn put_slot(txn: &WriteTransaction, namespace: &str, seq: u64, slot: &StoredSlot) -> MqResult<()> {
    let bytes = postcard::to_allocvec(slot)?;
    let mut table = txn.open_table(FEED_SLOTS_TABLE)?;
    table.insert(format_slot_key(namespace, seq).as_str(), bytes.as_slice())?;
    Ok(())
}

fn put_head(txn: &WriteTransaction, namespace: &str, field: &str, value: u64) -> MqResult<()> {
    let mut table = txn.open_table(FEED_HEADS_TABLE)?;
    table.insert(format_head_key(namespace, field).as_str(), value.to_le_bytes().as_slice())?;
    Ok(())
}

fn read_head<T>(table: &T, key: &str) -> MqResult<Option<u64>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key)? {
        Some(v) => {
            let bytes: [u8; 8] = v
                .value()
                .try_into()
                .map_err(|_| MqError::Storage(format!("corrupt log head {}", key)))?;
            Ok(Some(u64::from_le_bytes(bytes)))
        }
        None => Ok(None),
    }
}

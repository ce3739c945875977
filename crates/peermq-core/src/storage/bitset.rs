//! Persistent bit-sets
//!
//! Each namespace is a sparse set of `u64` positions stored as 64-bit words.
//! A namespace is loaded into memory the first time it is referenced;
//! mutations touch only the in-memory words and mark them dirty, and `flush`
//! writes every dirty namespace in one redb transaction.
//!
//! ## Storage Schema
//!
//! ```text
//! BITSETS table: namespace -> postcard Vec<(word_index, word)>  (non-zero words only)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::MqError;

/// Table for bit-set namespaces
pub(crate) const BITSETS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("bitsets");

/// Operations the consumption tracker needs from a bit-set store.
pub trait BitsetStore: Send + Sync {
    /// Set `index`; returns true if the bit changed
    fn add(&self, ns: &str, index: u64) -> Result<bool, MqError>;

    /// Clear `index`; returns true if the bit changed
    fn delete(&self, ns: &str, index: u64) -> Result<bool, MqError>;

    /// Test `index`
    fn get(&self, ns: &str, index: u64) -> Result<bool, MqError>;

    /// Lowest unset position at or above `from`
    fn next0(&self, ns: &str, from: u64) -> Result<u64, MqError>;

    /// Durably persist all pending mutations across namespaces
    fn flush(&self) -> Result<(), MqError>;
}

/// In-memory sparse bit-set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bitset {
    words: BTreeMap<u64, u64>,
}

impl Bitset {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    fn locate(index: u64) -> (u64, u64) {
        (index / 64, 1u64 << (index % 64))
    }

    /// Set a bit, returning true if it was previously unset
    pub fn set(&mut self, index: u64) -> bool {
        let (word, mask) = Self::locate(index);
        let entry = self.words.entry(word).or_insert(0);
        let changed = *entry & mask == 0;
        *entry |= mask;
        changed
    }

    /// Clear a bit, returning true if it was previously set
    pub fn unset(&mut self, index: u64) -> bool {
        let (word, mask) = Self::locate(index);
        match self.words.get_mut(&word) {
            Some(entry) if *entry & mask != 0 => {
                *entry &= !mask;
                if *entry == 0 {
                    self.words.remove(&word);
                }
                true
            }
            _ => false,
        }
    }

    /// Test a bit
    pub fn contains(&self, index: u64) -> bool {
        let (word, mask) = Self::locate(index);
        self.words.get(&word).is_some_and(|w| w & mask != 0)
    }

    /// Lowest unset position at or above `from`
    pub fn next0(&self, from: u64) -> u64 {
        let mut word_index = from / 64;
        let mut bit = from % 64;
        loop {
            let word = self.words.get(&word_index).copied().unwrap_or(0);
            // Treat positions below `bit` as set so they are skipped
            let masked = word | ((1u64 << bit) - 1);
            if masked != u64::MAX {
                return word_index * 64 + u64::from((!masked).trailing_zeros());
            }
            word_index += 1;
            bit = 0;
        }
    }

    /// Number of set positions
    pub fn count(&self) -> u64 {
        self.words.values().map(|w| u64::from(w.count_ones())).sum()
    }

    fn encode(&self) -> Result<Vec<u8>, MqError> {
        let words: Vec<(u64, u64)> = self.words.iter().map(|(k, v)| (*k, *v)).collect();
        Ok(postcard::to_allocvec(&words)?)
    }

    fn decode(bytes: &[u8]) -> Result<Self, MqError> {
        let words: Vec<(u64, u64)> = postcard::from_bytes(bytes)?;
        Ok(Self {
            words: words.into_iter().filter(|(_, w)| *w != 0).collect(),
        })
    }
}

#[derive(Default)]
struct OpenSets {
    sets: HashMap<String, Bitset>,
    dirty: HashSet<String>,
}

/// redb-backed [`BitsetStore`]
pub struct RedbBitsets {
    db: Arc<RwLock<Database>>,
    open: Mutex<OpenSets>,
}

impl RedbBitsets {
    /// Create a store over a shared database handle
    pub fn new(db: Arc<RwLock<Database>>) -> Self {
        Self {
            db,
            open: Mutex::new(OpenSets::default()),
        }
    }

    fn load(&self, ns: &str) -> Result<Bitset, MqError> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(BITSETS_TABLE)?;
        match table.get(ns)? {
            Some(v) => Bitset::decode(v.value()),
            None => Ok(Bitset::new()),
        }
    }

    /// Run `f` against the namespace, loading it on first reference.
    fn with_set<T>(&self, ns: &str, f: impl FnOnce(&mut Bitset) -> T) -> Result<T, MqError> {
        let mut open = self.open.lock();
        if !open.sets.contains_key(ns) {
            let loaded = self.load(ns)?;
            debug!(namespace = ns, bits = loaded.count(), "Opened bit-set");
            open.sets.insert(ns.to_string(), loaded);
        }
        let set = open
            .sets
            .get_mut(ns)
            .ok_or_else(|| MqError::Storage(format!("bit-set {} vanished", ns)))?;
        Ok(f(set))
    }

    /// Like `with_set`, marking the namespace dirty when `f` reports a change.
    fn mutate(&self, ns: &str, f: impl FnOnce(&mut Bitset) -> bool) -> Result<bool, MqError> {
        let changed = self.with_set(ns, f)?;
        if changed {
            self.open.lock().dirty.insert(ns.to_string());
        }
        Ok(changed)
    }
}

impl BitsetStore for RedbBitsets {
    fn add(&self, ns: &str, index: u64) -> Result<bool, MqError> {
        self.mutate(ns, |set| set.set(index))
    }

    fn delete(&self, ns: &str, index: u64) -> Result<bool, MqError> {
        self.mutate(ns, |set| set.unset(index))
    }

    fn get(&self, ns: &str, index: u64) -> Result<bool, MqError> {
        self.with_set(ns, |set| set.contains(index))
    }

    fn next0(&self, ns: &str, from: u64) -> Result<u64, MqError> {
        self.with_set(ns, |set| set.next0(from))
    }

    fn flush(&self) -> Result<(), MqError> {
        let mut open = self.open.lock();
        if open.dirty.is_empty() {
            return Ok(());
        }

        let mut encoded = Vec::with_capacity(open.dirty.len());
        for ns in &open.dirty {
            if let Some(set) = open.sets.get(ns) {
                encoded.push((ns.clone(), set.encode()?));
            }
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(BITSETS_TABLE)?;
            for (ns, bytes) in &encoded {
                table.insert(ns.as_str(), bytes.as_slice())?;
            }
        }
        write_txn.commit()?;

        debug!(namespaces = encoded.len(), "Flushed bit-sets");
        open.dirty.clear();
        Ok(())
    }
}

//! Key-value store with staged writes.
//!
//! `put` and `delete` are staged in memory and immediately visible to `get`.
//! `flush` commits everything staged so far in a single redb write
//! transaction, which makes multi-key updates atomic (identity key pairs,
//! peer list plus discovery index).

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use redb::{Database, ReadableTable, TableDefinition};
use tracing::debug;

use crate::error::MqError;

/// Table for the key-value namespace (key: string, value: raw bytes)
pub(crate) const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");

/// Operations the mailbox needs from a key-value store.
pub trait KvStore: Send + Sync {
    /// Read a value, including writes staged but not yet flushed
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MqError>;

    /// Stage a write
    fn put(&self, key: &str, value: &[u8]) -> Result<(), MqError>;

    /// Stage a removal
    fn delete(&self, key: &str) -> Result<(), MqError>;

    /// Durably persist every staged mutation together
    fn flush(&self) -> Result<(), MqError>;
}

/// redb-backed [`KvStore`]
pub struct RedbKv {
    db: Arc<RwLock<Database>>,
    /// `Some` = staged put, `None` = staged delete
    pending: Mutex<BTreeMap<String, Option<Vec<u8>>>>,
}

impl RedbKv {
    /// Create a store over a shared database handle
    pub fn new(db: Arc<RwLock<Database>>) -> Self {
        Self {
            db,
            pending: Mutex::new(BTreeMap::new()),
        }
    }

    fn commit(&self, batch: &BTreeMap<String, Option<Vec<u8>>>) -> Result<(), MqError> {
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(KV_TABLE)?;
            for (key, value) in batch {
                match value {
                    Some(bytes) => {
                        table.insert(key.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(key.as_str())?;
                    }
                }
            }
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl KvStore for RedbKv {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MqError> {
        if let Some(staged) = self.pending.lock().get(key) {
            return Ok(staged.clone());
        }

        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;
        Ok(table.get(key)?.map(|v| v.value().to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), MqError> {
        self.pending
            .lock()
            .insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), MqError> {
        self.pending.lock().insert(key.to_string(), None);
        Ok(())
    }

    fn flush(&self) -> Result<(), MqError> {
        let batch = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return Ok(());
        }

        debug!(entries = batch.len(), "Flushing key-value batch");
        if let Err(e) = self.commit(&batch) {
            // Put the batch back underneath anything staged meanwhile
            let mut pending = self.pending.lock();
            for (key, value) in batch {
                pending.entry(key).or_insert(value);
            }
            return Err(e);
        }
        Ok(())
    }
}

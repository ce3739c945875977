//! Persistent storage using redb.
//!
//! One database file per mailbox holds:
//! - The key-value namespace (identity, peer list, discovery index)
//! - The bit-set namespace (read / archive / deleted per peer)
//! - Every send-log and listen-log (see [`crate::feed`])
//!
//! The key-value and bit-set stores are exposed through the [`KvStore`] and
//! [`BitsetStore`] traits so the mailbox components only depend on the
//! operations they need.

use crate::error::MqError;
use parking_lot::RwLock;
use redb::Database;
use std::path::Path;
use std::sync::Arc;

mod bitset;
mod kv;

pub use bitset::{Bitset, BitsetStore, RedbBitsets};
pub use kv::{KvStore, RedbKv};

use bitset::BITSETS_TABLE;
use kv::KV_TABLE;

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create a new storage instance at the given path.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create the key-value and bit-set tables
    pub fn new(path: impl AsRef<Path>) -> Result<Self, MqError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
            let _ = write_txn.open_table(BITSETS_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Get a reference to the shared database handle
    ///
    /// The log store shares this connection instead of opening the file twice.
    pub fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }

    /// Key-value store backed by this database
    pub fn kv(&self) -> RedbKv {
        RedbKv::new(self.db_handle())
    }

    /// Bit-set store backed by this database
    pub fn bitsets(&self) -> RedbBitsets {
        RedbBitsets::new(self.db_handle())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_storage_can_be_created() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
    }

    #[test]
    fn test_storage_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let storage = Storage::new(&db_path);
        assert!(storage.is_ok());
        assert!(db_path.exists());
    }

    #[test]
    fn test_kv_and_bitsets_share_database() {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::new(temp_dir.path().join("test.redb")).unwrap();

        let kv = storage.kv();
        kv.put("k", b"v").unwrap();
        kv.flush().unwrap();

        let bits = storage.bitsets();
        bits.add("read!x!", 3).unwrap();
        bits.flush().unwrap();

        assert_eq!(storage.kv().get("k").unwrap(), Some(b"v".to_vec()));
        assert!(storage.bitsets().get("read!x!", 3).unwrap());
    }
}

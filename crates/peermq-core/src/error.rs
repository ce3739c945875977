//! Error types for peermq

use std::sync::Arc;

use thiserror::Error;

/// Main error type for mailbox operations
#[derive(Error, Debug)]
pub enum MqError {
    /// Public or discovery key is malformed (not 32 bytes / 64 hex characters)
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Inbound peer is not in the directory
    #[error("Unauthorized peer: {0}")]
    Unauthorized(String),

    /// Handshake proof did not verify against the expected identity
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Unknown read stream view name
    #[error("Unsupported view: {0}")]
    UnsupportedView(String),

    /// Log slot was reclaimed and can no longer be read
    #[error("Log entry {seq} in {log} was cleared")]
    Cleared {
        /// Log namespace
        log: String,
        /// Reclaimed sequence number
        seq: u64,
    },

    /// Operation on a log that this node cannot append to
    #[error("Log {0} is read-only")]
    ReadOnly(String),

    /// Session or mailbox was already closed
    #[error("Closed: {0}")]
    Closed(String),

    /// Error during storage operations
    #[error("Storage error: {0}")]
    Storage(String),

    /// Database creation/opening error
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    /// Transaction error
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    /// Table error
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    /// Storage operation error
    #[error("Storage operation error: {0}")]
    StorageOp(#[from] redb::StorageError),

    /// Commit error
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    /// Error during serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Network-related error
    #[error("Network error: {0}")]
    Network(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure shared by every caller queued on the same single-flight operation
    #[error(transparent)]
    Shared(Arc<MqError>),
}

impl MqError {
    /// True for KV, bit-set and log I/O failures.
    pub fn is_storage(&self) -> bool {
        match self {
            MqError::Storage(_)
            | MqError::Database(_)
            | MqError::Transaction(_)
            | MqError::Table(_)
            | MqError::StorageOp(_)
            | MqError::Commit(_)
            | MqError::Io(_) => true,
            MqError::Shared(inner) => inner.is_storage(),
            _ => false,
        }
    }

    /// Strip any single-flight wrapping.
    pub fn root(&self) -> &MqError {
        match self {
            MqError::Shared(inner) => inner.root(),
            other => other,
        }
    }
}

impl From<postcard::Error> for MqError {
    fn from(err: postcard::Error) -> Self {
        MqError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for MqError {
    fn from(err: serde_json::Error) -> Self {
        MqError::Serialization(err.to_string())
    }
}

/// Result type alias using MqError
pub type MqResult<T> = Result<T, MqError>;

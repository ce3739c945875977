//! Mailbox configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Name of the database file inside the data directory
pub const DATABASE_FILE: &str = "mailbox.redb";

/// Default capacity for broadcast event channels
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Default fixed delay between reconnect attempts
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Default upper bound for one replication frame
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Configuration for a [`crate::Mailbox`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// Root of all persisted state
    pub data_dir: PathBuf,
    /// Fixed delay before an outbound session is re-established
    #[serde(with = "duration_ms")]
    pub reconnect_delay: Duration,
    /// Capacity of broadcast event channels
    pub event_capacity: usize,
    /// Largest accepted replication frame in bytes
    pub max_frame_len: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl MailboxConfig {
    /// Configuration rooted at `data_dir` with default tuning
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Path of the mailbox database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join(DATABASE_FILE)
    }

    /// Data directory
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

//! Read / archived / deleted state per message
//!
//! Three bit-sets per peer, namespaced `read!<peer>!`, `archive!<peer>!` and
//! `deleted!<peer>!`. Archiving implies reading; deleting also reclaims the
//! log slot. Mutations only complete once the bit-set store has flushed.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::MqResult;
use crate::feed::Feed;
use crate::storage::{BitsetStore, KvStore};
use crate::types::PeerId;

const READ_PREFIX: &str = "read!";
const ARCHIVE_PREFIX: &str = "archive!";
const DELETED_PREFIX: &str = "deleted!";

fn namespace(prefix: &str, peer: &PeerId) -> String {
    format!("{}{}!", prefix, peer.to_hex())
}

/// Per-peer consumption bit-sets.
pub struct ConsumptionTracker {
    bits: Arc<dyn BitsetStore>,
    kv: Arc<dyn KvStore>,
}

impl ConsumptionTracker {
    pub fn new(bits: Arc<dyn BitsetStore>, kv: Arc<dyn KvStore>) -> Self {
        Self { bits, kv }
    }

    pub fn mark_read(&self, peer: &PeerId, seq: u64) -> MqResult<()> {
        self.bits.add(&namespace(READ_PREFIX, peer), seq)?;
        self.bits.flush()
    }

    /// Set read and archived, then flush.
    pub fn mark_archived(&self, peer: &PeerId, seq: u64) -> MqResult<()> {
        let read = self.bits.add(&namespace(READ_PREFIX, peer), seq)?;
        let archived = self.bits.add(&namespace(ARCHIVE_PREFIX, peer), seq)?;
        if read || archived {
            debug!(peer = %peer, seq, "Archived message");
        }
        self.bits.flush()
    }

    /// Set deleted and reclaim the slot in `feed`, if there is a log.
    ///
    /// All three effects are attempted; the first failure is reported and
    /// nothing already done is rolled back.
    pub fn mark_deleted(&self, peer: &PeerId, seq: u64, feed: Option<&Feed>) -> MqResult<()> {
        let marked = self
            .bits
            .add(&namespace(DELETED_PREFIX, peer), seq)
            .and_then(|_| self.bits.flush());
        let reclaimed = feed.map_or(Ok(()), |feed| feed.clear(seq));
        let flushed = self.kv.flush();

        for (step, result) in [("bit-set", &marked), ("reclaim", &reclaimed), ("kv", &flushed)] {
            if let Err(e) = result {
                warn!(peer = %peer, seq, step, error = %e, "Clear step failed");
            }
        }
        marked.and(reclaimed).and(flushed)
    }

    pub fn is_read(&self, peer: &PeerId, seq: u64) -> MqResult<bool> {
        self.bits.get(&namespace(READ_PREFIX, peer), seq)
    }

    pub fn is_archived(&self, peer: &PeerId, seq: u64) -> MqResult<bool> {
        self.bits.get(&namespace(ARCHIVE_PREFIX, peer), seq)
    }

    pub fn is_deleted(&self, peer: &PeerId, seq: u64) -> MqResult<bool> {
        self.bits.get(&namespace(DELETED_PREFIX, peer), seq)
    }

    /// Lowest slot at or above `from` that is neither read nor deleted,
    /// if it lies below `bound`.
    pub fn next_unread(&self, peer: &PeerId, from: u64, bound: u64) -> MqResult<Option<u64>> {
        let read = namespace(READ_PREFIX, peer);
        let deleted = namespace(DELETED_PREFIX, peer);
        let mut pos = from;
        loop {
            pos = self.bits.next0(&read, pos)?;
            if pos >= bound {
                return Ok(None);
            }
            if !self.bits.get(&deleted, pos)? {
                return Ok(Some(pos));
            }
            pos += 1;
        }
    }
}

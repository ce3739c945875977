//! Replication loops run after a successful handshake
//!
//! The author side announces its length and serves requested slots. The
//! mirror side records the announced length as the remote watermark and
//! requests the slots readers asked for. While prefetching it also requests
//! every slot below the watermark it does not hold yet, a bounded window at
//! a time.

use std::collections::BTreeSet;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::framing::{MessageSink, MessageStream};
use super::protocol::WireMessage;
use crate::error::{MqError, MqResult};
use crate::feed::{Feed, SignedEntry};

/// Serve `feed` to a mirror until the stream closes or `cancel` fires.
///
/// `on_ack` runs for every slot the mirror confirms.
pub async fn upload(
    feed: &Feed,
    sink: &mut MessageSink,
    source: &mut MessageStream,
    cancel: &CancellationToken,
    mut on_ack: impl FnMut(u64),
) -> MqResult<()> {
    let mut length = feed.watch_length();
    let current = *length.borrow_and_update();
    sink.send(&WireMessage::Have { length: current }).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = length.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = *length.borrow_and_update();
                sink.send(&WireMessage::Have { length: current }).await?;
            }
            msg = source.recv() => match msg? {
                None => return Ok(()),
                Some(WireMessage::Request { seq }) => {
                    let reply = match feed.entry(seq)? {
                        Some(entry) => WireMessage::Data {
                            seq,
                            data: entry.data.to_vec(),
                            signature: entry.signature,
                        },
                        None => WireMessage::Missing { seq },
                    };
                    debug!(log = feed.namespace(), seq, kind = reply.kind(), "Serving request");
                    sink.send(&reply).await?;
                }
                Some(WireMessage::Ack { seq }) => on_ack(seq),
                Some(other) => {
                    return Err(MqError::Network(format!("unexpected {} from mirror", other.kind())));
                }
            }
        }
    }
}

/// Most prefetch requests in flight at once
pub const PREFETCH_WINDOW: usize = 64;

/// Mirror a remote log into `feed` until the stream closes or `cancel` fires.
///
/// `prefetch` is checked whenever the watermark moves or a reply arrives;
/// while it returns true every missing slot is fetched, not only wanted ones.
/// `on_entry` runs for every slot stored for the first time.
pub async fn download(
    feed: &Feed,
    sink: &mut MessageSink,
    source: &mut MessageStream,
    cancel: &CancellationToken,
    prefetch: impl Fn() -> bool,
    mut on_entry: impl FnMut(&SignedEntry),
) -> MqResult<()> {
    let mut wants = feed.watch_wants();
    wants.borrow_and_update();
    let mut requested = BTreeSet::new();
    let mut scan = PrefetchScan::default();
    request_wanted(feed, sink, &mut requested).await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = wants.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                wants.borrow_and_update();
                request_wanted(feed, sink, &mut requested).await?;
            }
            msg = source.recv() => match msg? {
                None => return Ok(()),
                Some(WireMessage::Have { length }) => {
                    feed.set_remote_length(length)?;
                    request_wanted(feed, sink, &mut requested).await?;
                    if prefetch() {
                        scan.request_missing(feed, sink, &mut requested).await?;
                    }
                }
                Some(WireMessage::Data { seq, data, signature }) => {
                    requested.remove(&seq);
                    let entry = SignedEntry {
                        seq,
                        data: Bytes::from(data),
                        signature,
                    };
                    if feed.put_remote(&entry)? {
                        on_entry(&entry);
                    }
                    sink.send(&WireMessage::Ack { seq }).await?;
                    if prefetch() {
                        scan.request_missing(feed, sink, &mut requested).await?;
                    }
                }
                Some(WireMessage::Missing { seq }) => {
                    requested.remove(&seq);
                    debug!(log = feed.namespace(), seq, "Author cannot serve slot");
                    if prefetch() {
                        scan.request_missing(feed, sink, &mut requested).await?;
                    }
                }
                Some(other) => {
                    return Err(MqError::Network(format!("unexpected {} from author", other.kind())));
                }
            }
        }
    }
}

/// Request every wanted slot below the remote length not already in flight
async fn request_wanted(
    feed: &Feed,
    sink: &mut MessageSink,
    requested: &mut BTreeSet<u64>,
) -> MqResult<()> {
    let bound = feed.remote_length().unwrap_or(0);
    for seq in feed.pending_wants() {
        if seq >= bound || !requested.insert(seq) {
            continue;
        }
        sink.send(&WireMessage::Request { seq }).await?;
    }
    Ok(())
}

/// Position of the prefetch walk over the remote log
#[derive(Default)]
struct PrefetchScan {
    /// Lowest slot not examined yet
    next: u64,
}

impl PrefetchScan {
    /// Request slots below the remote length that are not stored locally,
    /// keeping at most [`PREFETCH_WINDOW`] requests in flight.
    async fn request_missing(
        &mut self,
        feed: &Feed,
        sink: &mut MessageSink,
        requested: &mut BTreeSet<u64>,
    ) -> MqResult<()> {
        let bound = feed.remote_length().unwrap_or(0);
        while self.next < bound && requested.len() < PREFETCH_WINDOW {
            let seq = self.next;
            // Cleared slots keep a tombstone and are never fetched again
            if !feed.has_slot(seq)? && requested.insert(seq) {
                sink.send(&WireMessage::Request { seq }).await?;
            }
            self.next += 1;
        }
        Ok(())
    }
}

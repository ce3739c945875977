//! Merged read stream over every listen-log
//!
//! A driver task keeps one cursor per peer and polls them together. Each
//! cursor has at most one step in flight, which keeps per-peer order; peers
//! interleave in whatever order their entries become available. The output
//! channel holds a single item, so the driver only advances as fast as the
//! consumer pulls and finished steps wait in the set until then.
//!
//! A failed step is reported to the consumer. Live streams then retry the
//! same position after a short pause; other streams end.
//!
//! Dropping the stream aborts the driver, which drops its listen-log
//! subscription.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::consumption::ConsumptionTracker;
use crate::error::{MqError, MqResult};
use crate::feed::{Feed, FeedCache};
use crate::types::{Message, PeerId, ReadOptions, View};

/// Stream of `{from, seq, data}` across all correspondents.
pub struct ReadStream {
    rx: mpsc::Receiver<MqResult<Message>>,
    task: JoinHandle<()>,
}

impl ReadStream {
    pub(crate) fn spawn(
        feeds: FeedCache,
        tracker: Arc<ConsumptionTracker>,
        view: MqResult<View>,
        options: ReadOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(async move {
            let view = match view {
                Ok(view) => view,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };
            if let Err(e) = drive(feeds, tracker, view, options.live, &tx).await {
                warn!(view = %view, error = %e, "Read stream failed");
                let _ = tx.send(Err(e)).await;
            }
        });
        Self { rx, task }
    }

    /// Next message, or `None` once a non-live stream is exhausted
    pub async fn next_message(&mut self) -> Option<MqResult<Message>> {
        self.rx.recv().await
    }
}

impl Stream for ReadStream {
    type Item = MqResult<Message>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ReadStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pause before a live cursor retries a failed step
const RETRY_DELAY: Duration = Duration::from_millis(100);

struct Cursor {
    feed: Feed,
    next: u64,
}

type Step = BoxFuture<'static, (Cursor, MqResult<Option<Message>>)>;

fn step(mut cursor: Cursor, view: View, live: bool, tracker: Arc<ConsumptionTracker>) -> Step {
    async move {
        let resume = cursor.next;
        let result = advance(&mut cursor, view, live, &tracker).await;
        if result.is_err() {
            cursor.next = resume;
        }
        (cursor, result)
    }
    .boxed()
}

fn retry(cursor: Cursor, view: View, tracker: Arc<ConsumptionTracker>) -> Step {
    async move {
        tokio::time::sleep(RETRY_DELAY).await;
        step(cursor, view, true, tracker).await
    }
    .boxed()
}

async fn drive(
    feeds: FeedCache,
    tracker: Arc<ConsumptionTracker>,
    view: View,
    live: bool,
    tx: &mpsc::Sender<MqResult<Message>>,
) -> MqResult<()> {
    let live = live && view == View::Unread;
    let mut subscription = feeds.subscribe_listen().await?;
    let mut pending = FuturesUnordered::new();
    for feed in subscription.take_existing() {
        pending.push(step(Cursor { feed, next: 0 }, view, live, tracker.clone()));
    }
    debug!(view = %view, live, peers = pending.len(), "Read stream started");

    let mut subscribed = true;
    loop {
        if pending.is_empty() && (!live || !subscribed) {
            break;
        }
        tokio::select! {
            Some((cursor, result)) = pending.next(), if !pending.is_empty() => match result {
                Ok(Some(msg)) => {
                    if tx.send(Ok(msg)).await.is_err() {
                        break;
                    }
                    pending.push(step(cursor, view, live, tracker.clone()));
                }
                Ok(None) => debug!(peer = %cursor.feed.peer(), "Peer exhausted"),
                Err(e) if live => {
                    warn!(peer = %cursor.feed.peer(), next = cursor.next, error = %e, "Cursor failed, retrying");
                    if tx.send(Err(e)).await.is_err() {
                        break;
                    }
                    pending.push(retry(cursor, view, tracker.clone()));
                }
                Err(e) => return Err(e),
            },
            feed = subscription.next(), if subscribed => match feed {
                Some(feed) => {
                    debug!(peer = %feed.peer(), "Read stream joined new peer");
                    pending.push(step(Cursor { feed, next: 0 }, view, live, tracker.clone()));
                }
                None => subscribed = false,
            },
        }
    }
    debug!(view = %view, "Read stream ended");
    Ok(())
}

/// Move `cursor` to the next entry visible through `view`.
///
/// Returns `Ok(None)` once the peer has nothing more to offer without
/// waiting. Live cursors instead wait for the remote length to grow.
async fn advance(
    cursor: &mut Cursor,
    view: View,
    live: bool,
    tracker: &ConsumptionTracker,
) -> MqResult<Option<Message>> {
    let peer = cursor.feed.peer();
    let mut remote = cursor.feed.watch_remote_length();
    loop {
        let known = *remote.borrow_and_update();
        let length = cursor.feed.length();
        let candidate = match view {
            View::Unread => tracker.next_unread(&peer, cursor.next, known.unwrap_or(0).max(length))?,
            View::Archive | View::Read => next_marked(tracker, view, &peer, cursor.next, length)?,
        };

        let Some(seq) = candidate else {
            if !live || remote.changed().await.is_err() {
                return Ok(None);
            }
            continue;
        };

        cursor.next = seq + 1;
        let fetched = if live {
            cursor.feed.get(seq).await.map(Some)
        } else {
            cursor.feed.get_local(seq)
        };
        match fetched {
            Ok(Some(data)) => return Ok(Some(Message { from: peer, seq, data })),
            // Not downloaded yet; a non-live unread cursor stops here
            Ok(None) if view == View::Unread => return Ok(None),
            Ok(None) => continue,
            Err(MqError::Cleared { .. }) => continue,
            Err(e) => return Err(e),
        }
    }
}

fn next_marked(
    tracker: &ConsumptionTracker,
    view: View,
    peer: &PeerId,
    from: u64,
    length: u64,
) -> MqResult<Option<u64>> {
    for seq in from..length {
        let marked = match view {
            View::Archive => tracker.is_archived(peer, seq)?,
            _ => tracker.is_read(peer, seq)?,
        };
        if marked && !tracker.is_deleted(peer, seq)? {
            return Ok(Some(seq));
        }
    }
    Ok(None)
}

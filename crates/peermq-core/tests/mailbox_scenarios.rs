//! End-to-end mailbox scenarios over the in-memory network
//!
//! Each test wires two or more `Mailbox`es to one `MemoryNetwork` and drives
//! them through the public API only.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use peermq_core::{
    Mailbox, MailboxConfig, MailboxEvent, MemoryNetwork, Message, MqError, PeerId, ReadOptions,
    ReadStream, SessionEvent, SessionStatus,
};
use tempfile::TempDir;

const WAIT: Duration = Duration::from_secs(10);
const QUIET: Duration = Duration::from_millis(300);

// ============================================================================
// Test Utilities
// ============================================================================

struct Node {
    mailbox: Mailbox,
    id: PeerId,
    temp: TempDir,
}

fn config(temp: &TempDir) -> MailboxConfig {
    MailboxConfig::new(temp.path().join("data")).with_reconnect_delay(Duration::from_millis(50))
}

impl Node {
    async fn new(net: &MemoryNetwork) -> anyhow::Result<Self> {
        let _ = tracing_subscriber::fmt::try_init();
        let temp = TempDir::new()?;
        let mailbox = Mailbox::open(config(&temp), Arc::new(net.clone())).await?;
        let id = mailbox.id().await?;
        Ok(Self { mailbox, id, temp })
    }
}

async fn node(net: &MemoryNetwork) -> Node {
    Node::new(net).await.expect("failed to open mailbox")
}

async fn next_message(stream: &mut ReadStream) -> Message {
    tokio::time::timeout(WAIT, stream.next())
        .await
        .expect("timed out waiting for a message")
        .expect("stream ended")
        .expect("stream failed")
}

/// Drain a non-live stream into `(from, seq, text)` triples.
async fn drain(mut stream: ReadStream) -> Vec<(PeerId, u64, String)> {
    let mut out = Vec::new();
    while let Some(item) = tokio::time::timeout(WAIT, stream.next()).await.unwrap() {
        let msg = item.unwrap();
        out.push((msg.from, msg.seq, String::from_utf8(msg.data.to_vec()).unwrap()));
    }
    out
}

fn triples(from: PeerId, texts: &[&str]) -> Vec<(PeerId, u64, String)> {
    texts
        .iter()
        .enumerate()
        .map(|(seq, text)| (from, seq as u64, text.to_string()))
        .collect()
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_unread_then_archive() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());

    for text in ["one", "two", "three"] {
        b.mailbox.send(a.id, text.as_bytes()).await.unwrap();
    }

    let mut got = Vec::new();
    for _ in 0..3 {
        let msg = next_message(&mut unread).await;
        got.push((msg.from, msg.seq, String::from_utf8(msg.data.to_vec()).unwrap()));
    }
    assert_eq!(got, triples(b.id, &["one", "two", "three"]));

    for (from, seq, _) in &got {
        a.mailbox.archive(from, *seq).await.unwrap();
    }

    let unread_now = drain(a.mailbox.create_read_stream("unread", ReadOptions::default())).await;
    assert!(unread_now.is_empty());

    let archived = drain(a.mailbox.create_read_stream("archive", ReadOptions::default())).await;
    assert_eq!(archived, triples(b.id, &["one", "two", "three"]));
}

#[tokio::test]
async fn test_unauthorized_peer_is_dropped() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());

    for text in ["one", "two", "three"] {
        b.mailbox.send(a.id, text.as_bytes()).await.unwrap();
    }
    let conn = b.mailbox.connect(a.id).unwrap();

    // A closes the connection without replicating
    let mut status = conn.watch_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == SessionStatus::Disconnected))
        .await
        .unwrap()
        .unwrap();

    assert!(tokio::time::timeout(QUIET, unread.next()).await.is_err());
    conn.close();
}

#[tokio::test]
async fn test_removed_peer_cannot_replicate() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.remove_peer(b.id).await.unwrap();
    assert!(a.mailbox.list_peers().await.unwrap().is_empty());

    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());

    for text in ["one", "two", "three"] {
        b.mailbox.send(a.id, text.as_bytes()).await.unwrap();
    }
    let conn = b.mailbox.connect(a.id).unwrap();
    let mut events = conn.events();

    // Let B retry a few times
    let replicated = tokio::time::timeout(QUIET, async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StatusChanged(SessionStatus::Replicating)) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
    })
    .await;
    assert!(!matches!(replicated, Ok(true)));
    assert!(tokio::time::timeout(QUIET, unread.next()).await.is_err());
    conn.close();
}

#[tokio::test]
async fn test_removal_mid_session_stops_delivery() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());

    b.mailbox.send(a.id, b"before").await.unwrap();
    let first = next_message(&mut unread).await;
    assert_eq!(&first.data[..], b"before");

    let session = b.mailbox.session_for(a.id).unwrap();
    assert_eq!(session.status(), SessionStatus::Replicating);
    let mut status = session.watch_status();
    status.borrow_and_update();

    a.mailbox.remove_peer(b.id).await.unwrap();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s != SessionStatus::Replicating))
        .await
        .unwrap()
        .unwrap();

    b.mailbox.send(a.id, b"after").await.unwrap();
    assert!(tokio::time::timeout(QUIET, unread.next()).await.is_err());
}

#[tokio::test]
async fn test_live_stream_follows_later_sends_in_order() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;
    let c = node(&net).await;

    a.mailbox.add_peers([b.id, c.id]).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());

    b.mailbox.send(a.id, b"b0").await.unwrap();
    c.mailbox.send(a.id, b"c0").await.unwrap();
    b.mailbox.send(a.id, b"b1").await.unwrap();

    let mut from_b = Vec::new();
    let mut from_c = Vec::new();
    for _ in 0..3 {
        let msg = next_message(&mut unread).await;
        if msg.from == b.id {
            from_b.push(msg.seq);
        } else {
            assert_eq!(msg.from, c.id);
            from_c.push(msg.seq);
        }
    }
    assert_eq!(from_b, vec![0, 1]);
    assert_eq!(from_c, vec![0]);

    // A later send still arrives on the same stream
    b.mailbox.send(a.id, b"b2").await.unwrap();
    let late = next_message(&mut unread).await;
    assert_eq!((late.from, late.seq, &late.data[..]), (b.id, 2, &b"b2"[..]));
}

#[tokio::test]
async fn test_message_events_and_acknowledgements() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut events = a.mailbox.events();

    let session = b.mailbox.session_for(a.id).unwrap();
    let mut session_events = session.events();
    let seq = b.mailbox.send(a.id, b"ping").await.unwrap();

    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());
    next_message(&mut unread).await;

    let delivered = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(MailboxEvent::Message(msg)) = events.recv().await {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!((delivered.from, delivered.seq), (b.id, seq));

    let acked = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(SessionEvent::Ack { seq }) = session_events.recv().await {
                return seq;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(acked, seq);
}

#[tokio::test]
async fn test_message_event_without_reader() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut events = a.mailbox.events();

    // No read stream is open on A
    b.mailbox.send(a.id, b"hello").await.unwrap();

    let delivered = tokio::time::timeout(WAIT, async {
        loop {
            if let Ok(MailboxEvent::Message(msg)) = events.recv().await {
                return msg;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!((delivered.from, delivered.seq, &delivered.data[..]), (b.id, 0, &b"hello"[..]));

    let stored = drain(a.mailbox.create_read_stream("unread", ReadOptions::default())).await;
    assert_eq!(stored, triples(b.id, &["hello"]));
}

#[tokio::test]
async fn test_session_reconnects_after_listener_restart() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();

    let session = b.mailbox.session_for(a.id).unwrap();
    let mut session_events = session.events();
    b.mailbox.send(a.id, b"before").await.unwrap();
    {
        let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());
        let first = next_message(&mut unread).await;
        a.mailbox.mark_read(first.from, first.seq).await.unwrap();
    }

    // Restart A; B's session is left alone
    let Node { mailbox, temp, .. } = a;
    drop(mailbox);
    tokio::time::sleep(Duration::from_millis(100)).await;
    let restarted = Mailbox::open(config(&temp), Arc::new(net.clone())).await.unwrap();
    restarted.listen().await.unwrap();

    tokio::time::timeout(WAIT, async {
        let mut disconnected = false;
        loop {
            match session_events.recv().await {
                Ok(SessionEvent::StatusChanged(SessionStatus::Disconnected)) => disconnected = true,
                Ok(SessionEvent::StatusChanged(SessionStatus::Replicating)) if disconnected => return,
                Ok(SessionEvent::Closed) => panic!("session closed instead of reconnecting"),
                _ => {}
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(session.status(), SessionStatus::Replicating);

    b.mailbox.send(a.id, b"after").await.unwrap();
    let mut unread = restarted.create_read_stream("unread", ReadOptions::live());
    let late = next_message(&mut unread).await;
    assert_eq!((late.from, late.seq, &late.data[..]), (b.id, 1, &b"after"[..]));
}

#[tokio::test]
async fn test_clear_removes_message_from_views() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());
    b.mailbox.send(a.id, b"keep").await.unwrap();
    b.mailbox.send(a.id, b"drop").await.unwrap();
    next_message(&mut unread).await;
    next_message(&mut unread).await;

    a.mailbox.archive(b.id, 1).await.unwrap();
    a.mailbox.clear(b.id, 1).await.unwrap();

    let remaining = drain(a.mailbox.create_read_stream("unread", ReadOptions::default())).await;
    assert_eq!(remaining, triples(b.id, &["keep"]));
    let archived = drain(a.mailbox.create_read_stream("archive", ReadOptions::default())).await;
    assert!(archived.is_empty());
}

#[tokio::test]
async fn test_unsupported_view_fails_stream() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let mut stream = a.mailbox.create_read_stream("starred", ReadOptions::live());
    let first = tokio::time::timeout(WAIT, stream.next()).await.unwrap();
    assert!(matches!(first, Some(Err(MqError::UnsupportedView(_)))));
}

// ============================================================================
// Identity
// ============================================================================

#[tokio::test]
async fn test_identity_stable_across_restart() {
    let net = MemoryNetwork::new();
    let temp = TempDir::new().unwrap();

    let first = Mailbox::open(config(&temp), Arc::new(net.clone())).await.unwrap();
    let id = first.id().await.unwrap();
    assert_eq!(first.id().await.unwrap(), id);
    first.list_peers().await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let second = Mailbox::open(config(&temp), Arc::new(net)).await.unwrap();
    assert_eq!(second.id().await.unwrap(), id);
}

#[tokio::test]
async fn test_concurrent_key_pairs_share_one_identity() {
    let net = MemoryNetwork::new();
    let temp = TempDir::new().unwrap();
    let mailbox = Mailbox::open(config(&temp), Arc::new(net)).await.unwrap();

    let (first, second) = tokio::join!(mailbox.key_pairs(), mailbox.key_pairs());
    let (first, second) = (first.unwrap(), second.unwrap());
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.public_key(), second.public_key());
}

#[tokio::test]
async fn test_received_messages_survive_restart() {
    let net = MemoryNetwork::new();
    let a = node(&net).await;
    let b = node(&net).await;

    a.mailbox.add_peer(b.id).await.unwrap();
    a.mailbox.listen().await.unwrap();
    let mut unread = a.mailbox.create_read_stream("unread", ReadOptions::live());
    b.mailbox.send(a.id, b"stored").await.unwrap();
    next_message(&mut unread).await;
    drop(unread);

    let Node { mailbox, temp, .. } = a;
    drop(mailbox);
    drop(b);
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Reopened without any network peer
    let reopened = Mailbox::open(config(&temp), Arc::new(MemoryNetwork::new())).await.unwrap();
    let unread = drain(reopened.create_read_stream("unread", ReadOptions::default())).await;
    assert_eq!(unread.len(), 1);
    assert_eq!(unread[0].2, "stored");
}

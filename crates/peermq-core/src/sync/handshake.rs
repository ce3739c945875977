//! Mutual identity proof
//!
//! The acceptor opens with a random challenge. The connector answers with a
//! Hello signed by its log key over its transport public key, the announced
//! discovery key and that challenge, plus a challenge of its own. The
//! acceptor learns which peer is connecting from the discovery key and only
//! answers authorized peers; its Welcome signs the connector's challenge so
//! the connector knows the answer came from the mailbox it meant to reach.
//! Neither proof can be replayed on another stream.

use std::time::Duration;

use tracing::{debug, warn};

use super::framing::{MessageSink, MessageStream};
use super::protocol::WireMessage;
use crate::error::{MqError, MqResult};
use crate::identity::{self, KeyPairs};
use crate::peers::PeerDirectory;
use crate::types::{DiscoveryKey, PeerId};

/// Longest wait for the other side's handshake frame
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const HELLO_CONTEXT: &[u8] = b"peermq hello v2";
const WELCOME_CONTEXT: &[u8] = b"peermq welcome v2";

fn proof_payload(
    context: &[u8],
    transport_key: &[u8; 32],
    dk: &DiscoveryKey,
    nonce: &[u8; 32],
) -> Vec<u8> {
    let mut payload = Vec::with_capacity(context.len() + 96);
    payload.extend_from_slice(context);
    payload.extend_from_slice(transport_key);
    payload.extend_from_slice(dk.as_bytes());
    payload.extend_from_slice(nonce);
    payload
}

/// Fresh random challenge
pub fn nonce() -> MqResult<[u8; 32]> {
    let mut nonce = [0u8; 32];
    getrandom::getrandom(&mut nonce)
        .map_err(|e| MqError::Crypto(format!("failed to get random bytes: {}", e)))?;
    Ok(nonce)
}

/// Answer to `challenge` announcing our own send-log.
///
/// `nonce` is the challenge the acceptor's Welcome must sign.
pub fn hello(keys: &KeyPairs, challenge: &[u8; 32], nonce: [u8; 32]) -> WireMessage {
    let discovery_key = keys.public_key().discovery_key();
    let transport_key = *keys.transport.public_key().as_bytes();
    let proof = keys.log.sign(&proof_payload(
        HELLO_CONTEXT,
        &transport_key,
        &discovery_key,
        challenge,
    ));
    WireMessage::Hello {
        discovery_key,
        transport_key,
        nonce,
        proof: proof.to_vec(),
    }
}

/// Reply proving our identity for the connector's discovery key and nonce
pub fn welcome(keys: &KeyPairs, dk: &DiscoveryKey, nonce: &[u8; 32]) -> WireMessage {
    let transport_key = *keys.transport.public_key().as_bytes();
    let proof = keys
        .log
        .sign(&proof_payload(WELCOME_CONTEXT, &transport_key, dk, nonce));
    WireMessage::Welcome {
        transport_key,
        proof: proof.to_vec(),
    }
}

async fn recv_within(source: &mut MessageStream) -> MqResult<Option<WireMessage>> {
    tokio::time::timeout(HANDSHAKE_TIMEOUT, source.recv())
        .await
        .map_err(|_| MqError::Network("handshake timed out".into()))?
}

/// Connector side: answer the challenge, then verify the Welcome came from
/// `expected`.
pub async fn initiate(
    sink: &mut MessageSink,
    source: &mut MessageStream,
    keys: &KeyPairs,
    expected: &PeerId,
) -> MqResult<()> {
    let challenge = match recv_within(source).await? {
        Some(WireMessage::Challenge { nonce }) => nonce,
        Some(other) => {
            return Err(MqError::Network(format!(
                "expected challenge, got {}",
                other.kind()
            )))
        }
        None => return Err(MqError::Network("closed during handshake".into())),
    };

    let ours = nonce()?;
    sink.send(&hello(keys, &challenge, ours)).await?;

    match recv_within(source).await? {
        Some(WireMessage::Welcome {
            transport_key,
            proof,
        }) => {
            let dk = keys.public_key().discovery_key();
            let payload = proof_payload(WELCOME_CONTEXT, &transport_key, &dk, &ours);
            if identity::verify(expected, &payload, &proof) {
                Ok(())
            } else {
                Err(MqError::AuthenticationFailed(format!(
                    "remote did not prove identity {}",
                    expected.short()
                )))
            }
        }
        Some(other) => Err(MqError::Network(format!(
            "expected welcome, got {}",
            other.kind()
        ))),
        None => Err(MqError::Network("closed during handshake".into())),
    }
}

/// Acceptor side: challenge the connector, read Hello and authorize it
/// against the directory.
///
/// `remote_key` is the transport key the connection was authenticated with,
/// when the transport knows it.
///
/// Returns `Ok(None)` for anything that must be dropped without a reply:
/// unknown discovery keys, our own key, bad or replayed proofs and
/// transport keys that do not match the connection.
pub async fn accept(
    sink: &mut MessageSink,
    source: &mut MessageStream,
    keys: &KeyPairs,
    directory: &PeerDirectory,
    remote_key: Option<[u8; 32]>,
) -> MqResult<Option<PeerId>> {
    let challenge = nonce()?;
    sink.send(&WireMessage::Challenge { nonce: challenge }).await?;

    let (discovery_key, transport_key, their_nonce, proof) = match recv_within(source).await? {
        Some(WireMessage::Hello {
            discovery_key,
            transport_key,
            nonce,
            proof,
        }) => (discovery_key, transport_key, nonce, proof),
        Some(other) => {
            debug!(kind = other.kind(), "Expected hello, dropping connection");
            return Ok(None);
        }
        None => return Ok(None),
    };

    if remote_key.is_some_and(|remote| remote != transport_key) {
        warn!(dk = ?discovery_key, "Hello transport key does not match the connection, dropping");
        return Ok(None);
    }

    let Some(peer) = directory.resolve_by_discovery_key(&discovery_key).await? else {
        debug!(dk = ?discovery_key, "Unknown discovery key, dropping connection");
        return Ok(None);
    };
    if peer == keys.public_key() {
        debug!("Refusing connection from own identity");
        return Ok(None);
    }

    let payload = proof_payload(HELLO_CONTEXT, &transport_key, &discovery_key, &challenge);
    if !identity::verify(&peer, &payload, &proof) {
        warn!(peer = %peer, "Handshake proof did not verify, dropping connection");
        return Ok(None);
    }

    sink.send(&welcome(keys, &discovery_key, &their_nonce)).await?;
    Ok(Some(peer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::sync::framing::split;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn pair() -> ((MessageSink, MessageStream), (MessageSink, MessageStream)) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (split(Box::new(a), 1 << 20), split(Box::new(b), 1 << 20))
    }

    async fn directory_with(peers: &[PeerId]) -> (PeerDirectory, TempDir) {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().join("hs.redb")).unwrap();
        let dir = PeerDirectory::new(Arc::new(storage.kv()));
        dir.add_peers(peers.iter().copied()).await.unwrap();
        (dir, temp)
    }

    /// Connector that answers the challenge with `make(challenge)` and
    /// returns the acceptor's next frame, if any.
    async fn answer(
        sink: &mut MessageSink,
        source: &mut MessageStream,
        make: impl FnOnce(&[u8; 32]) -> WireMessage,
    ) -> Option<WireMessage> {
        let challenge = match source.recv().await.unwrap() {
            Some(WireMessage::Challenge { nonce }) => nonce,
            other => panic!("expected challenge, got {:?}", other),
        };
        sink.send(&make(&challenge)).await.unwrap();
        source.recv().await.ok().flatten()
    }

    #[tokio::test]
    async fn test_authorized_handshake_succeeds() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;
        let ((mut bob_sink, mut bob_source), (mut alice_sink, mut alice_source)) = pair();

        let alice_pk = alice.public_key();
        let bob_side = initiate(&mut bob_sink, &mut bob_source, &bob, &alice_pk);
        let alice_side = accept(&mut alice_sink, &mut alice_source, &alice, &dir, None);
        let (initiated, accepted) = tokio::join!(bob_side, alice_side);

        initiated.unwrap();
        assert_eq!(accepted.unwrap(), Some(bob.public_key()));
    }

    #[tokio::test]
    async fn test_matching_transport_key_accepted() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;
        let ((mut bob_sink, mut bob_source), (mut alice_sink, mut alice_source)) = pair();
        let bob_transport = *bob.transport.public_key().as_bytes();

        let alice_pk = alice.public_key();
        let bob_side = initiate(&mut bob_sink, &mut bob_source, &bob, &alice_pk);
        let alice_side = accept(&mut alice_sink, &mut alice_source, &alice, &dir, Some(bob_transport));
        let (initiated, accepted) = tokio::join!(bob_side, alice_side);

        initiated.unwrap();
        assert_eq!(accepted.unwrap(), Some(bob.public_key()));
    }

    #[tokio::test]
    async fn test_unknown_peer_dropped_silently() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[]).await;
        let ((mut bob_sink, mut bob_source), (mut alice_sink, mut alice_source)) = pair();

        let bob_side = answer(&mut bob_sink, &mut bob_source, |c| hello(&bob, c, [0u8; 32]));
        let alice_side = async {
            let accepted = accept(&mut alice_sink, &mut alice_source, &alice, &dir, None).await;
            drop((alice_sink, alice_source));
            accepted
        };
        let (reply, accepted) = tokio::join!(bob_side, alice_side);

        assert_eq!(accepted.unwrap(), None);
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_replayed_hello_gets_no_reply() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;

        // Genuine session: Bob answers Alice's first challenge
        let ((mut bob_sink, mut bob_source), (mut alice_sink, mut alice_source)) = pair();
        let mut captured = None;
        let bob_side = answer(&mut bob_sink, &mut bob_source, |c| {
            let frame = hello(&bob, c, [7u8; 32]);
            captured = Some(frame.clone());
            frame
        });
        let alice_side = accept(&mut alice_sink, &mut alice_source, &alice, &dir, None);
        let (reply, accepted) = tokio::join!(bob_side, alice_side);
        assert_eq!(reply.map(|m| m.kind()), Some("welcome"));
        assert_eq!(accepted.unwrap(), Some(bob.public_key()));

        // The same frame sent on a new stream without Bob's secret key
        let captured = captured.unwrap();
        let ((mut m_sink, mut m_source), (mut alice_sink, mut alice_source)) = pair();
        let replay_side = answer(&mut m_sink, &mut m_source, |_| captured);
        let alice_side = async {
            let accepted = accept(&mut alice_sink, &mut alice_source, &alice, &dir, None).await;
            drop((alice_sink, alice_source));
            accepted
        };
        let (reply, accepted) = tokio::join!(replay_side, alice_side);
        assert_eq!(accepted.unwrap(), None);
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_transport_key_mismatch_dropped() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let mallory = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;
        let ((mut bob_sink, mut bob_source), (mut alice_sink, mut alice_source)) = pair();

        // Valid proof from Bob, but the connection authenticated Mallory's key
        let mallory_transport = *mallory.transport.public_key().as_bytes();
        let alice_pk = alice.public_key();
        let bob_side = initiate(&mut bob_sink, &mut bob_source, &bob, &alice_pk);
        let alice_side = async {
            let accepted = accept(&mut alice_sink, &mut alice_source, &alice, &dir, Some(mallory_transport)).await;
            drop((alice_sink, alice_source));
            accepted
        };
        let (initiated, accepted) = tokio::join!(bob_side, alice_side);

        assert_eq!(accepted.unwrap(), None);
        assert!(matches!(initiated, Err(MqError::Network(_))));
    }

    #[tokio::test]
    async fn test_wrong_remote_identity_is_authentication_failure() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let mallory = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;
        let ((mut bob_sink, mut bob_source), (mut m_sink, mut m_source)) = pair();

        // Bob meant to reach Alice but Mallory answers
        let alice_pk = alice.public_key();
        let bob_side = initiate(&mut bob_sink, &mut bob_source, &bob, &alice_pk);
        let mallory_side = accept(&mut m_sink, &mut m_source, &mallory, &dir, None);
        let (initiated, _) = tokio::join!(bob_side, mallory_side);

        assert!(matches!(initiated, Err(MqError::AuthenticationFailed(_))));
    }

    #[tokio::test]
    async fn test_forged_hello_dropped() {
        let alice = KeyPairs::generate().unwrap();
        let bob = KeyPairs::generate().unwrap();
        let mallory = KeyPairs::generate().unwrap();
        let (dir, _temp) = directory_with(&[bob.public_key()]).await;
        let ((mut m_sink, mut m_source), (mut alice_sink, mut alice_source)) = pair();

        // Mallory claims Bob's discovery key but signs with her own key
        let forge = |challenge: &[u8; 32]| match hello(&mallory, challenge, [0u8; 32]) {
            WireMessage::Hello {
                transport_key,
                nonce,
                proof,
                ..
            } => WireMessage::Hello {
                discovery_key: bob.public_key().discovery_key(),
                transport_key,
                nonce,
                proof,
            },
            other => other,
        };
        let mallory_side = answer(&mut m_sink, &mut m_source, forge);
        let alice_side = async {
            let accepted = accept(&mut alice_sink, &mut alice_source, &alice, &dir, None).await;
            drop((alice_sink, alice_source));
            accepted
        };
        let (reply, accepted) = tokio::join!(mallory_side, alice_side);

        assert_eq!(accepted.unwrap(), None);
        assert_eq!(reply, None);
    }
}

//! Identity module for peermq
//!
//! A node owns two ed25519 key pairs:
//! - **Log key pair**: authors the node's send-logs. Its public key is the
//!   node's mailbox address.
//! - **Transport key pair**: authenticates transport connections. The log key
//!   signs the transport public key during the handshake so a peer can tie a
//!   connection back to a mailbox address.
//!
//! Both pairs are generated together on first use and persisted in one KV
//! flush, so a crash never leaves half an identity behind.

mod keypair;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{MqError, MqResult};
use crate::single_flight::OnceFlight;
use crate::storage::KvStore;
use crate::types::PeerId;

pub use keypair::{verify, KeyPair, SIGNATURE_LEN};

/// KV key holding the persisted secret material
pub const IDENTITY_KEY: &str = "identity";

/// The node's log and transport key pairs.
#[derive(Debug, Clone)]
pub struct KeyPairs {
    /// Signs entries in this node's send-logs
    pub log: KeyPair,
    /// Authenticates transport connections
    pub transport: KeyPair,
}

impl KeyPairs {
    /// Generate both key pairs
    pub fn generate() -> MqResult<Self> {
        Ok(Self {
            log: KeyPair::generate()?,
            transport: KeyPair::generate()?,
        })
    }

    /// Mailbox address of this node
    pub fn public_key(&self) -> PeerId {
        self.log.public_key()
    }
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    log_secret: [u8; 32],
    transport_secret: [u8; 32],
}

/// Loads or creates the node's key material exactly once per process.
pub struct IdentityManager {
    kv: Arc<dyn KvStore>,
    loaded: OnceFlight<Arc<KeyPairs>>,
}

impl IdentityManager {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            loaded: OnceFlight::new(),
        }
    }

    /// Both key pairs, generating and persisting them on first call.
    ///
    /// Concurrent first callers share a single generation; a persistence
    /// failure reaches all of them and nothing is cached.
    pub async fn key_pairs(&self) -> MqResult<Arc<KeyPairs>> {
        let kv = self.kv.clone();
        self.loaded
            .get_or_try_init(|| async move {
                tokio::task::spawn_blocking(move || load_or_generate(kv.as_ref()))
                    .await
                    .map_err(|e| MqError::Storage(format!("identity task failed: {}", e)))?
                    .map(Arc::new)
            })
            .await
    }

    /// Mailbox address of this node
    pub async fn public_key(&self) -> MqResult<PeerId> {
        Ok(self.key_pairs().await?.public_key())
    }
}

fn load_or_generate(kv: &dyn KvStore) -> MqResult<KeyPairs> {
    if let Some(bytes) = kv.get(IDENTITY_KEY)? {
        let stored: StoredIdentity = postcard::from_bytes(&bytes)?;
        let pairs = KeyPairs {
            log: KeyPair::from_secret_bytes(&stored.log_secret),
            transport: KeyPair::from_secret_bytes(&stored.transport_secret),
        };
        debug!(id = %pairs.public_key(), "Loaded identity");
        return Ok(pairs);
    }

    let pairs = KeyPairs::generate()?;
    let stored = StoredIdentity {
        log_secret: pairs.log.secret_bytes(),
        transport_secret: pairs.transport.secret_bytes(),
    };
    kv.put(IDENTITY_KEY, &postcard::to_allocvec(&stored)?)?;
    if let Err(e) = kv.flush() {
        // Never leave unflushed key material visible to a later attempt
        kv.delete(IDENTITY_KEY)?;
        return Err(e);
    }

    info!(id = %pairs.public_key(), "Generated new identity");
    Ok(pairs)
}

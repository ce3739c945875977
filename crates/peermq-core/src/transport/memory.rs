//! In-memory transport
//!
//! Every [`MemoryNetwork`] clone shares one broker that routes `connect`
//! calls to the matching listener over a `tokio::io::duplex` pipe.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Inbound, Incoming, RawStream, Transport};
use crate::error::{MqError, MqResult};
use crate::types::PeerId;

const DUPLEX_BUF_SIZE: usize = 64 * 1024;

/// Shared in-process network
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<Mutex<HashMap<PeerId, mpsc::Sender<Inbound>>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether someone is currently accepting for `id`
    pub fn is_listening(&self, id: &PeerId) -> bool {
        self.listeners
            .lock()
            .get(id)
            .is_some_and(|tx| !tx.is_closed())
    }
}

impl Transport for MemoryNetwork {
    fn listen(&self, id: PeerId) -> BoxFuture<'_, MqResult<Incoming>> {
        async move {
            let (tx, rx) = mpsc::channel(64);
            self.listeners.lock().insert(id, tx);
            debug!(id = %id.short(), "Memory transport listening");
            Ok(Incoming::new(rx))
        }
        .boxed()
    }

    fn connect(&self, id: PeerId) -> BoxFuture<'_, MqResult<RawStream>> {
        async move {
            let tx = self
                .listeners
                .lock()
                .get(&id)
                .cloned()
                .ok_or_else(|| MqError::Network(format!("no listener for {}", id.short())))?;

            let (mine, theirs) = tokio::io::duplex(DUPLEX_BUF_SIZE);
            if tx.send(Inbound::unauthenticated(Box::new(theirs))).await.is_err() {
                self.listeners.lock().remove(&id);
                return Err(MqError::Network(format!("listener for {} closed", id.short())));
            }
            Ok(Box::new(mine) as RawStream)
        }
        .boxed()
    }
}

//! In-memory pub/sub backend using tokio::sync::broadcast
//!
//! Single-node only. No cross-process coordination.
//! Ideal for development and single-instance deployments.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;

use crate::hub::Hub;
use crate::pubsub::PubSub;

/// Default buffer size for the bus channel
const DEFAULT_BUFFER_SIZE: usize = 1024;

type Envelope = (String, Vec<u8>);

/// In-memory pub/sub using tokio::sync::broadcast
///
/// A single channel carries every group. The first receiver is created
/// eagerly so publishes made before the listener starts are kept.
///
/// # Limitations
/// - Single-process only
/// - No message persistence
/// - A lagging listener loses messages
pub struct MemoryPubSub {
    tx: broadcast::Sender<Envelope>,
    initial: Mutex<Option<broadcast::Receiver<Envelope>>>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    /// Larger buffers reduce loss under bursts but consume more memory.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        let (tx, rx) = broadcast::channel(buffer_size);
        Self {
            tx,
            initial: Mutex::new(Some(rx)),
        }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSub for MemoryPubSub {
    async fn publish(&self, group: &str, payload: &[u8]) -> anyhow::Result<()> {
        // send() only fails when nobody listens, which is fine for fire-and-forget
        let _ = self.tx.send((group.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn listen(&self, hub: Arc<Hub>) -> anyhow::Result<()> {
        let mut rx = match self.initial.lock().await.take() {
            Some(rx) => rx,
            None => self.tx.subscribe(),
        };

        loop {
            match rx.recv().await {
                Ok((group, payload)) => {
                    hub.broadcast(&group, &payload);
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(lagged = n, "bus listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            }
        }
    }
}

//! Group fan-out bus
//!
//! Any component publishes to a named group without knowing which
//! connections, or which process, hold the sockets. Every node runs one
//! listener that feeds received publishes into its local [`Hub`].
//!
//! Backends:
//!
//! - [`MemoryPubSub`] - in-process broadcast for single-node deployments
//! - `PostgresPubSub` - PostgreSQL LISTEN/NOTIFY for multi-node deployments
//!   (feature `postgres`)

mod memory;

#[cfg(feature = "postgres")]
mod postgres;

pub use memory::MemoryPubSub;

#[cfg(feature = "postgres")]
pub use postgres::PostgresPubSub;

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::hub::Hub;
use crate::protocol::ServerFrame;
use crate::store::{BookingId, TicketId};

/// Pub/Sub backend trait
///
/// Publishing is fire-and-forget: it must never wait on subscribers, and
/// publishing to a group with no members anywhere is not an error.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a payload to a group on every node
    async fn publish(&self, group: &str, payload: &[u8]) -> anyhow::Result<()>;

    /// Deliver publishes into the local hub until the backend shuts down
    ///
    /// This should be spawned as a background task.
    async fn listen(&self, hub: Arc<Hub>) -> anyhow::Result<()>;
}

pub fn booking_group(booking_id: BookingId) -> String {
    format!("booking:{booking_id}")
}

pub fn notification_group(user_id: Uuid) -> String {
    format!("user:{user_id}:notifications")
}

pub fn support_group(ticket_id: TicketId) -> String {
    format!("support:{ticket_id}")
}

/// Encode and publish a frame, logging instead of failing
///
/// Used for every notification path: a lost notice never undoes the state
/// change that produced it.
pub async fn publish_frame(bus: &dyn PubSub, group: &str, frame: &ServerFrame) -> bool {
    let payload = match frame.encode() {
        Ok(payload) => payload,
        Err(e) => {
            warn!(group, error = %e, "failed to encode frame");
            return false;
        }
    };

    match bus.publish(group, &payload).await {
        Ok(()) => {
            debug!(group, "frame published");
            true
        }
        Err(e) => {
            warn!(group, error = %e, "publish failed, dropping frame");
            false
        }
    }
}

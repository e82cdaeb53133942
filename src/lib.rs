//! Fleetcast - real-time dispatch and wallet reconciliation
//!
//! Keeps passengers, drivers and support staff in sync around a shared
//! booking: persistent connections join named groups, domain engines publish
//! to those groups, and payment-provider callbacks are reconciled against
//! driver wallets exactly once.
//!
//! ## Architecture
//!
//! ```text
//! Client (WS) → Gateway → Session → Hub ← PubSub listener
//!                             ↓              ↑
//!                          Engines ──publish─┘
//!                             ↓
//!                           Store
//! ```
//!
//! ## Environment Variables
//!
//! - `FLEETCAST_TOKEN_SECRET` - HS256 bearer token secret
//! - `FLEETCAST_WEBHOOK_SECRET` - payment provider signing secret
//! - `FLEETCAST_DATABASE_URL` - PostgreSQL fan-out (feature `postgres`)
//!
//! See [`Config`] for the rest.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod hub;
pub mod lifecycle;
pub mod presence;
pub mod protocol;
pub mod provider;
pub mod pubsub;
pub mod relay;
pub mod session;
pub mod store;
pub mod support;
pub mod wallet;

pub use auth::{Authenticator, Identity, Role, TokenVerifier};
pub use config::Config;
pub use dispatch::Dispatch;
pub use error::DispatchError;
pub use hub::Hub;
pub use presence::{MemoryPresence, PresenceStore};
pub use protocol::ServerFrame;
pub use pubsub::{MemoryPubSub, PubSub};
pub use store::{MemoryStore, Store};

#[cfg(feature = "postgres")]
pub use pubsub::PostgresPubSub;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::hub::Hub;
    use crate::protocol::ServerFrame;
    use crate::pubsub::PubSub;

    /// Bus that keeps every publish for inspection
    #[derive(Default)]
    pub struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl RecordingBus {
        pub fn published(&self) -> Vec<(String, ServerFrame)> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .map(|(group, payload)| (group.clone(), serde_json::from_slice(payload).unwrap()))
                .collect()
        }

        pub fn frames_for(&self, group: &str) -> Vec<ServerFrame> {
            self.published()
                .into_iter()
                .filter(|(g, _)| g == group)
                .map(|(_, frame)| frame)
                .collect()
        }
    }

    #[async_trait]
    impl PubSub for RecordingBus {
        async fn publish(&self, group: &str, payload: &[u8]) -> anyhow::Result<()> {
            self.published
                .lock()
                .unwrap()
                .push((group.to_string(), payload.to_vec()));
            Ok(())
        }

        async fn listen(&self, _hub: Arc<Hub>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    /// Bus whose every publish fails
    pub struct FailingBus;

    #[async_trait]
    impl PubSub for FailingBus {
        async fn publish(&self, _group: &str, _payload: &[u8]) -> anyhow::Result<()> {
            anyhow::bail!("bus unavailable")
        }

        async fn listen(&self, _hub: Arc<Hub>) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

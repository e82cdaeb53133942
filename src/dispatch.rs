//! Shared application context
//!
//! One [`Dispatch`] per process, handed to the gateway, the HTTP surface and
//! every session as `Arc<Dispatch>`.

use std::sync::Arc;

use crate::auth::{Authenticator, TokenVerifier};
use crate::chat::RideChat;
use crate::config::Config;
use crate::hub::Hub;
use crate::lifecycle::BookingEngine;
use crate::presence::PresenceStore;
use crate::provider::DisbursementProvider;
use crate::pubsub::PubSub;
use crate::relay::LocationRelay;
use crate::store::Store;
use crate::support::SupportEngine;
use crate::wallet::{CallbackVerifier, WalletEngine};

pub struct Dispatch {
    pub hub: Arc<Hub>,
    pub bus: Arc<dyn PubSub>,
    pub presence: Arc<dyn PresenceStore>,
    pub store: Arc<dyn Store>,
    pub auth: Authenticator,
    pub bookings: BookingEngine,
    pub wallet: WalletEngine,
    pub support: SupportEngine,
    pub chat: RideChat,
    pub relay: Arc<LocationRelay>,
}

impl Dispatch {
    pub fn new(
        config: &Config,
        store: Arc<dyn Store>,
        presence: Arc<dyn PresenceStore>,
        bus: Arc<dyn PubSub>,
        provider: Arc<dyn DisbursementProvider>,
    ) -> Self {
        let verifier = CallbackVerifier::new(&config.webhook_secret, config.webhook_allowlist.clone());

        Self {
            hub: Arc::new(Hub::new()),
            auth: Authenticator::new(TokenVerifier::new(&config.token_secret), store.clone()),
            bookings: BookingEngine::new(
                store.clone(),
                presence.clone(),
                bus.clone(),
                config.wallet_floor,
            ),
            wallet: WalletEngine::new(
                store.clone(),
                bus.clone(),
                provider,
                verifier,
                config.platform_cut,
            ),
            support: SupportEngine::new(store.clone(), bus.clone()),
            chat: RideChat::new(store.clone(), bus.clone()),
            relay: Arc::new(LocationRelay::new(
                presence.clone(),
                store.clone(),
                bus.clone(),
                config.broadcast_lookup_timeout,
            )),
            bus,
            presence,
            store,
        }
    }
}

impl std::fmt::Debug for Dispatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatch").field("hub", &self.hub).finish_non_exhaustive()
    }
}

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use fleetcast::auth::{Identity, Role};
use fleetcast::config::Config;
use fleetcast::dispatch::Dispatch;
use fleetcast::lifecycle::CreateBooking;
use fleetcast::presence::MemoryPresence;
use fleetcast::protocol::{NotificationEvent, ServerFrame};
use fleetcast::provider::HttpProvider;
use fleetcast::pubsub::{MemoryPubSub, PubSub, notification_group};
use fleetcast::store::{BookingId, BookingType, MemoryStore, User};
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

/// A fully wired single-node deployment over in-memory backends
pub struct Harness {
    pub ctx: Arc<Dispatch>,
    pub store: Arc<MemoryStore>,
    pub presence: Arc<MemoryPresence>,
}

impl Harness {
    pub fn new() -> Self {
        let config = Config::from_lookup(|key| match key {
            "FLEETCAST_TOKEN_SECRET" => Some("integration-token".to_string()),
            "FLEETCAST_WEBHOOK_SECRET" => Some("integration-hook".to_string()),
            "FLEETCAST_WEBHOOK_ALLOWLIST" => Some("52.31.139.75".to_string()),
            _ => None,
        })
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(MemoryPubSub::new());
        let provider = Arc::new(
            HttpProvider::new(
                "http://127.0.0.1:9".to_string(),
                "sk_test".to_string(),
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let ctx = Arc::new(Dispatch::new(
            &config,
            store.clone(),
            presence.clone(),
            bus.clone(),
            provider,
        ));

        let hub = ctx.hub.clone();
        tokio::spawn(async move { bus.listen(hub).await });

        Self {
            ctx,
            store,
            presence,
        }
    }

    pub fn user(&self, role: Role) -> Identity {
        let id = Uuid::new_v4();
        let email = format!("{role}-{}@example.com", id.simple());
        self.store.insert_user(User {
            id,
            email: email.clone(),
            fullname: format!("Test {role}"),
            role,
            is_active: true,
        });
        Identity {
            user_id: id,
            email,
            role,
        }
    }

    /// Subscribe a bare hub connection to a user's notifications
    pub fn watch(&self, user: &Identity) -> Watcher {
        let (conn_id, rx) = self.ctx.hub.register(user.user_id);
        self.ctx.hub.join(conn_id, &notification_group(user.user_id));
        Watcher { rx }
    }

    pub async fn ride(&self, passenger: &Identity, driver: &Identity) -> BookingId {
        self.ctx
            .bookings
            .create_booking(
                passenger,
                CreateBooking {
                    driver_id: Some(driver.user_id),
                    driver_email: None,
                    booking_type: BookingType::Ride,
                    origin: "Ikeja".to_string(),
                    destination: "Victoria Island".to_string(),
                    price: dec!(1000),
                    package_details: None,
                },
            )
            .await
            .unwrap()
            .id
    }
}

pub struct Watcher {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Watcher {
    /// Every frame that arrives before the line goes quiet
    pub async fn drain(&mut self) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        while let Ok(Some(payload)) = timeout(Duration::from_millis(200), self.rx.recv()).await {
            frames.push(serde_json::from_slice(&payload).unwrap());
        }
        frames
    }

    /// Drained notifications of one kind
    pub async fn events(&mut self, event: NotificationEvent) -> Vec<ServerFrame> {
        self.drain()
            .await
            .into_iter()
            .filter(|frame| matches!(frame, ServerFrame::Notification(n) if n.event == event))
            .collect()
    }
}

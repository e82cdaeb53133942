//! Location relay
//!
//! Ingests driver location samples into the presence store and runs the
//! periodic broadcaster that republishes each active booking's driver
//! location to the booking group.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DispatchError;
use crate::presence::{Location, PresenceStore};
use crate::protocol::{LocationSample, ServerFrame};
use crate::pubsub::{PubSub, booking_group, publish_frame};
use crate::store::{BookingId, Store};

/// What happened to each active booking during one broadcast cycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub published: usize,
    /// Booking row gone or driver not connected
    pub skipped: usize,
    pub timed_out: usize,
    pub failed: usize,
}

enum Relayed {
    Published,
    Skipped,
}

pub struct LocationRelay {
    presence: Arc<dyn PresenceStore>,
    store: Arc<dyn Store>,
    bus: Arc<dyn PubSub>,
    lookup_timeout: Duration,
}

impl LocationRelay {
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        store: Arc<dyn Store>,
        bus: Arc<dyn PubSub>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            presence,
            store,
            bus,
            lookup_timeout,
        }
    }

    /// Overwrite a driver's last known location
    pub async fn ingest(&self, driver_id: Uuid, sample: LocationSample) -> Result<(), DispatchError> {
        let location = Location {
            latitude: sample.latitude,
            longitude: sample.longitude,
        };
        if !location.is_valid() {
            return Err(DispatchError::validation("Latitude or longitude out of range."));
        }

        self.presence
            .set_location(driver_id, location)
            .await
            .map_err(|e| DispatchError::TransientStore(e.to_string()))?;
        debug!(%driver_id, "location ingested");
        Ok(())
    }

    /// Publish the driver location of every active booking once
    pub async fn broadcast_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let bookings = match self.presence.active_bookings().await {
            Ok(bookings) => bookings,
            Err(e) => {
                warn!(error = %e, "skipping broadcast cycle");
                return report;
            }
        };

        for booking_id in bookings {
            match tokio::time::timeout(self.lookup_timeout, self.relay_one(booking_id)).await {
                Ok(Ok(Relayed::Published)) => report.published += 1,
                Ok(Ok(Relayed::Skipped)) => report.skipped += 1,
                Ok(Err(e)) => {
                    warn!(booking_id, error = %e, "location relay failed");
                    report.failed += 1;
                }
                Err(_) => {
                    warn!(booking_id, "location lookup timed out");
                    report.timed_out += 1;
                }
            }
        }

        debug!(?report, "broadcast cycle finished");
        report
    }

    async fn relay_one(&self, booking_id: BookingId) -> Result<Relayed, DispatchError> {
        // The row may have vanished between marker and lookup
        let Some(booking) = self.store.booking(booking_id).await? else {
            return Ok(Relayed::Skipped);
        };

        let entry = self
            .presence
            .location(booking.driver_id)
            .await
            .map_err(|e| DispatchError::TransientStore(e.to_string()))?;
        let Some(entry) = entry else {
            return Ok(Relayed::Skipped);
        };

        let frame = ServerFrame::Location {
            booking_id,
            latitude: entry.location.latitude,
            longitude: entry.location.longitude,
        };
        publish_frame(self.bus.as_ref(), &booking_group(booking_id), &frame).await;
        Ok(Relayed::Published)
    }
}

/// Spawn the periodic broadcaster
pub fn spawn_broadcaster(relay: Arc<LocationRelay>, period: Duration) -> JoinHandle<()> {
    info!(period_secs = period.as_secs(), "location broadcaster started");
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            relay.broadcast_cycle().await;
        }
    })
}

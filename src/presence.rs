//! Presence tracking for Fleetcast
//!
//! Holds driver-online markers, last-known driver locations and the set of
//! bookings with a live tracking or chat connection. Entries carry no TTL:
//! the gateway removes them explicitly when the owning connection closes.
//! Markers count their owners, so one connection closing never clears a
//! marker another live connection still holds. Location writes are
//! last-write-wins and readers tolerate stale or absent entries.

use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::store::BookingId;

/// A latitude/longitude pair
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
}

impl Location {
    /// Whether both coordinates are finite and inside WGS84 bounds
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Last known location of a driver
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PresenceEntry {
    pub location: Location,
    pub updated_at: Instant,
}

#[derive(Debug, thiserror::Error)]
pub enum PresenceError {
    #[error("presence store unavailable: {0}")]
    Unavailable(String),
}

/// Ephemeral key/value state shared by the gateway and the location relay
///
/// Any backing store with get/set/delete semantics satisfies this; no
/// ordering is guaranteed between writers.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_location(&self, driver_id: Uuid, location: Location) -> Result<(), PresenceError>;
    async fn location(&self, driver_id: Uuid) -> Result<Option<PresenceEntry>, PresenceError>;

    /// Take one owner reference on the driver's online marker
    async fn mark_online(&self, driver_id: Uuid) -> Result<(), PresenceError>;
    async fn is_online(&self, driver_id: Uuid) -> Result<bool, PresenceError>;
    /// Release one owner reference; the last one drops the marker and the
    /// last location
    async fn remove_driver(&self, driver_id: Uuid) -> Result<(), PresenceError>;

    /// Take one owner reference on the booking's active marker
    async fn activate_booking(&self, booking_id: BookingId) -> Result<(), PresenceError>;
    /// Release one owner reference; the booking stays active while any remain
    async fn deactivate_booking(&self, booking_id: BookingId) -> Result<(), PresenceError>;
    async fn active_bookings(&self) -> Result<Vec<BookingId>, PresenceError>;
}

/// In-process presence store for a single Fleetcast node
#[derive(Default)]
pub struct MemoryPresence {
    locations: DashMap<Uuid, PresenceEntry>,
    /// Owner count per online driver
    online: DashMap<Uuid, usize>,
    /// Owner count per active booking
    active: DashMap<BookingId, usize>,
}

impl MemoryPresence {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Decrement an owner count, removing the key at zero. True when removed.
fn release<K: std::hash::Hash + Eq>(owners: &DashMap<K, usize>, key: K) -> bool {
    match owners.entry(key) {
        Entry::Occupied(mut held) if *held.get() > 1 => {
            *held.get_mut() -= 1;
            false
        }
        Entry::Occupied(held) => {
            held.remove();
            true
        }
        Entry::Vacant(_) => false,
    }
}

#[async_trait]
impl PresenceStore for MemoryPresence {
    async fn set_location(&self, driver_id: Uuid, location: Location) -> Result<(), PresenceError> {
        self.locations.insert(
            driver_id,
            PresenceEntry {
                location,
                updated_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn location(&self, driver_id: Uuid) -> Result<Option<PresenceEntry>, PresenceError> {
        Ok(self.locations.get(&driver_id).map(|entry| *entry))
    }

    async fn mark_online(&self, driver_id: Uuid) -> Result<(), PresenceError> {
        let mut owners = self.online.entry(driver_id).or_insert(0);
        *owners += 1;
        if *owners == 1 {
            debug!(%driver_id, "driver online");
        }
        Ok(())
    }

    async fn is_online(&self, driver_id: Uuid) -> Result<bool, PresenceError> {
        Ok(self.online.contains_key(&driver_id))
    }

    async fn remove_driver(&self, driver_id: Uuid) -> Result<(), PresenceError> {
        if release(&self.online, driver_id) {
            self.locations.remove(&driver_id);
            debug!(%driver_id, "driver offline");
        }
        Ok(())
    }

    async fn activate_booking(&self, booking_id: BookingId) -> Result<(), PresenceError> {
        *self.active.entry(booking_id).or_insert(0) += 1;
        Ok(())
    }

    async fn deactivate_booking(&self, booking_id: BookingId) -> Result<(), PresenceError> {
        if release(&self.active, booking_id) {
            debug!(booking_id, "booking inactive");
        }
        Ok(())
    }

    async fn active_bookings(&self) -> Result<Vec<BookingId>, PresenceError> {
        let mut bookings: Vec<BookingId> = self.active.iter().map(|entry| *entry.key()).collect();
        bookings.sort_unstable();
        Ok(bookings)
    }
}

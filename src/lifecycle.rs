//! Booking lifecycle engine
//!
//! Every status change goes through [`BookingEngine::update_status`], which
//! consults the [`TransitionTable`] once, persists the change with a
//! compare-and-swap, and then notifies the counterparty. The notification is
//! best-effort and never rolls back a persisted transition.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::error::DispatchError;
use crate::presence::PresenceStore;
use crate::protocol::{NewBookingDetails, Notification, NotificationEvent, ServerFrame};
use crate::pubsub::{PubSub, notification_group, publish_frame};
use crate::store::{
    Booking, BookingId, BookingStatus, BookingType, DisputeUpdate, NewBooking, StatusSwap, Store,
};

use BookingStatus::*;

/// Legal targets per (role, current status)
#[derive(Debug, Clone)]
pub struct TransitionTable {
    rules: HashMap<(Role, BookingStatus), &'static [BookingStatus]>,
}

const CANCEL: &[BookingStatus] = &[Cancelled];
const CANCEL_OR_COMPLETE: &[BookingStatus] = &[Cancelled, Completed];
const ACCEPT_OR_CANCEL: &[BookingStatus] = &[Accepted, Cancelled];
const START_OR_CANCEL: &[BookingStatus] = &[InProgress, Cancelled];
const COMPLETE_OR_CANCEL: &[BookingStatus] = &[Completed, Cancelled];

impl Default for TransitionTable {
    fn default() -> Self {
        let rules = HashMap::from([
            ((Role::Passenger, Pending), CANCEL),
            ((Role::Passenger, Accepted), CANCEL),
            ((Role::Passenger, InProgress), CANCEL_OR_COMPLETE),
            ((Role::Driver, Pending), ACCEPT_OR_CANCEL),
            ((Role::Driver, Accepted), START_OR_CANCEL),
            ((Role::Driver, InProgress), COMPLETE_OR_CANCEL),
        ]);
        Self { rules }
    }
}

impl TransitionTable {
    pub fn allowed(&self, role: Role, from: BookingStatus) -> &[BookingStatus] {
        self.rules.get(&(role, from)).copied().unwrap_or(&[])
    }

    pub fn permits(&self, role: Role, from: BookingStatus, to: BookingStatus) -> bool {
        self.allowed(role, from).contains(&to)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    /// Passenger re-confirmed an already completed booking; nothing changed
    AlreadyCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransitionAck {
    pub outcome: TransitionOutcome,
    pub message: &'static str,
    pub booking: Booking,
}

/// Booking creation command
#[derive(Debug, Clone, Deserialize)]
pub struct CreateBooking {
    #[serde(default)]
    pub driver_id: Option<Uuid>,
    #[serde(default)]
    pub driver_email: Option<String>,
    pub booking_type: BookingType,
    pub origin: String,
    pub destination: String,
    pub price: Decimal,
    #[serde(default)]
    pub package_details: Option<String>,
}

/// A driver eligible for new bookings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AvailableDriver {
    pub id: Uuid,
    pub email: String,
    pub fullname: String,
    pub wallet_balance: Decimal,
    pub online: bool,
}

pub struct BookingEngine {
    store: Arc<dyn Store>,
    presence: Arc<dyn PresenceStore>,
    bus: Arc<dyn PubSub>,
    table: TransitionTable,
    wallet_floor: Decimal,
}

impl BookingEngine {
    pub fn new(
        store: Arc<dyn Store>,
        presence: Arc<dyn PresenceStore>,
        bus: Arc<dyn PubSub>,
        wallet_floor: Decimal,
    ) -> Self {
        Self {
            store,
            presence,
            bus,
            table: TransitionTable::default(),
            wallet_floor,
        }
    }

    /// Load a booking the caller is a party to
    pub async fn booking_for_party(
        &self,
        caller: &Identity,
        booking_id: BookingId,
    ) -> Result<(Booking, Role), DispatchError> {
        let booking = self.load(booking_id).await?;
        match booking.party_role(caller.user_id) {
            Some(role) if role == caller.role => Ok((booking, role)),
            _ => Err(DispatchError::authorization(
                "You are not a party to this booking.",
            )),
        }
    }

    async fn load(&self, booking_id: BookingId) -> Result<Booking, DispatchError> {
        self.store
            .booking(booking_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("Booking not found."))
    }

    /// Apply a role-gated status change
    pub async fn update_status(
        &self,
        caller: &Identity,
        booking_id: BookingId,
        requested: BookingStatus,
    ) -> Result<TransitionAck, DispatchError> {
        let (booking, role) = self.booking_for_party(caller, booking_id).await?;

        if booking.status == Completed {
            if role == Role::Passenger && requested == Completed {
                return Ok(TransitionAck {
                    outcome: TransitionOutcome::AlreadyCompleted,
                    message: "Booking completion confirmed successfully.",
                    booking,
                });
            }
            return Err(DispatchError::conflict(
                "This booking has already been completed.",
            ));
        }

        match role {
            Role::Passenger if !matches!(requested, Cancelled | Completed) => {
                return Err(DispatchError::validation(
                    "You can only update status to cancelled or completed.",
                ));
            }
            Role::Driver if matches!(requested, Pending | DisputeApproved) => {
                return Err(DispatchError::validation("Invalid status update."));
            }
            _ => {}
        }

        let from = booking.status;
        if !self.table.permits(role, from, requested) {
            return Err(DispatchError::conflict(format!(
                "Cannot change booking status from {from} to {requested}."
            )));
        }

        let booking = match self.store.swap_status(booking_id, from, requested).await? {
            StatusSwap::Swapped(booking) => booking,
            StatusSwap::Stale(current) => {
                return Err(DispatchError::conflict(format!(
                    "Booking status changed to {} before this update was applied.",
                    current.status
                )));
            }
        };

        let message = transition_message(role, requested);
        info!(booking_id, role = %role, %from, to = %requested, "booking transition applied");

        let notification = Notification::new(NotificationEvent::StatusUpdate, Some(booking_id), message)
            .with_status(requested);
        self.notify(booking.counterparty(role), notification).await;

        Ok(TransitionAck {
            outcome: TransitionOutcome::Applied,
            message,
            booking,
        })
    }

    /// Create a pending booking and notify the target driver
    pub async fn create_booking(
        &self,
        caller: &Identity,
        command: CreateBooking,
    ) -> Result<Booking, DispatchError> {
        if caller.role != Role::Passenger {
            return Err(DispatchError::authorization(
                "Only passengers can create bookings.",
            ));
        }
        if command.origin.trim().is_empty() || command.destination.trim().is_empty() {
            return Err(DispatchError::validation(
                "Origin and destination are required.",
            ));
        }
        if command.price <= Decimal::ZERO {
            return Err(DispatchError::validation("Price must be greater than zero."));
        }
        if command.booking_type == BookingType::Delivery
            && command
                .package_details
                .as_deref()
                .is_none_or(|d| d.trim().is_empty())
        {
            return Err(DispatchError::validation(
                "Package details are required for delivery bookings.",
            ));
        }

        let driver = match (command.driver_id, command.driver_email.as_deref()) {
            (Some(id), _) => self.store.user(id).await?,
            (None, Some(email)) => self.store.user_by_email(email.trim()).await?,
            (None, None) => {
                return Err(DispatchError::validation(
                    "A driver id or email is required.",
                ));
            }
        }
        .filter(|user| user.role == Role::Driver && user.is_active)
        .ok_or_else(|| DispatchError::validation("No driver found with the provided email."))?;

        if self.store.wallet_balance(driver.id).await? < self.wallet_floor {
            return Err(DispatchError::validation(
                "This driver is not available for new bookings.",
            ));
        }

        let booking = self
            .store
            .insert_booking(NewBooking {
                passenger_id: caller.user_id,
                driver_id: driver.id,
                booking_type: command.booking_type,
                origin: command.origin,
                destination: command.destination,
                price: command.price,
                package_details: command.package_details,
                payment_reference: format!("bk_{}", Uuid::new_v4().simple()),
            })
            .await?;

        info!(booking_id = booking.id, driver_id = %driver.id, "booking created");

        let details = NewBookingDetails {
            booking_type: booking.booking_type,
            origin: &booking.origin,
            destination: &booking.destination,
            price: booking.price,
            package_details: booking.package_details.as_deref(),
            passenger_id: booking.passenger_id,
        };
        let mut notification = Notification::new(
            NotificationEvent::NewBooking,
            Some(booking.id),
            "You have a new booking request.",
        )
        .with_status(Pending);
        match serde_json::to_value(&details) {
            Ok(details) => notification = notification.with_details(details),
            Err(e) => warn!(booking_id = booking.id, error = %e, "booking details not serialized"),
        }
        self.notify(driver.id, notification).await;

        Ok(booking)
    }

    /// Bookings visible to the caller
    pub async fn list_bookings(&self, caller: &Identity) -> Result<Vec<Booking>, DispatchError> {
        Ok(self.store.bookings_for(caller.user_id, caller.role).await?)
    }

    /// Active drivers whose wallet is not below the floor
    pub async fn available_drivers(&self) -> Result<Vec<AvailableDriver>, DispatchError> {
        let mut available = Vec::new();
        for driver in self.store.users_with_role(Role::Driver).await? {
            if !driver.is_active {
                continue;
            }
            let balance = self.store.wallet_balance(driver.id).await?;
            if balance < self.wallet_floor {
                continue;
            }
            let online = self.presence.is_online(driver.id).await.unwrap_or_else(|e| {
                warn!(driver_id = %driver.id, error = %e, "presence lookup failed");
                false
            });
            available.push(AvailableDriver {
                id: driver.id,
                email: driver.email,
                fullname: driver.fullname,
                wallet_balance: balance,
                online,
            });
        }
        available.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(available)
    }

    /// A party flags the booking as disputed
    pub async fn mark_disputed(
        &self,
        caller: &Identity,
        booking_id: BookingId,
        reason: Option<String>,
    ) -> Result<Booking, DispatchError> {
        let (booking, role) = self.booking_for_party(caller, booking_id).await?;
        if booking.is_disputed {
            return Err(DispatchError::conflict("This booking is already disputed."));
        }
        if booking.status == DisputeApproved {
            return Err(DispatchError::conflict(
                "The dispute on this booking has already been approved.",
            ));
        }

        let booking = self
            .store
            .update_dispute(booking_id, DisputeUpdate::Raise { reason })
            .await?;
        info!(booking_id, role = %role, "booking disputed");

        let notification = Notification::new(
            NotificationEvent::Dispute,
            Some(booking_id),
            "A dispute has been raised on your booking.",
        );
        self.notify(booking.counterparty(role), notification).await;
        Ok(booking)
    }

    /// Staff close a dispute without changing the booking status
    pub async fn resolve_dispute(
        &self,
        caller: &Identity,
        booking_id: BookingId,
        resolution: String,
    ) -> Result<Booking, DispatchError> {
        require_staff(caller)?;
        if resolution.trim().is_empty() {
            return Err(DispatchError::validation("A resolution is required."));
        }
        let booking = self.load(booking_id).await?;
        if !booking.is_disputed {
            return Err(DispatchError::conflict("This booking is not disputed."));
        }

        let booking = self
            .store
            .update_dispute(booking_id, DisputeUpdate::Resolve { resolution })
            .await?;
        info!(booking_id, staff_id = %caller.user_id, "dispute resolved");
        self.notify_parties(&booking, "The dispute on your booking has been resolved.")
            .await;
        Ok(booking)
    }

    /// Staff uphold a dispute, terminalizing the booking as `dispute_approved`
    pub async fn approve_dispute(
        &self,
        caller: &Identity,
        booking_id: BookingId,
    ) -> Result<Booking, DispatchError> {
        require_staff(caller)?;
        let booking = self.load(booking_id).await?;
        if !booking.is_disputed {
            return Err(DispatchError::conflict("This booking is not disputed."));
        }
        if matches!(booking.status, Cancelled | DisputeApproved) {
            return Err(DispatchError::conflict(format!(
                "Cannot approve a dispute on a {} booking.",
                booking.status
            )));
        }

        let booking = match self
            .store
            .approve_dispute(booking_id, booking.status, "Dispute approved.".to_string())
            .await?
        {
            StatusSwap::Swapped(booking) => booking,
            StatusSwap::Stale(current) if !current.is_disputed => {
                return Err(DispatchError::conflict("This booking is not disputed."));
            }
            StatusSwap::Stale(current) => {
                return Err(DispatchError::conflict(format!(
                    "Booking status changed to {} before this update was applied.",
                    current.status
                )));
            }
        };
        info!(booking_id, staff_id = %caller.user_id, "dispute approved");
        self.notify_parties(&booking, "The dispute on your booking has been approved.")
            .await;
        Ok(booking)
    }

    async fn notify_parties(&self, booking: &Booking, message: &str) {
        for user in [booking.passenger_id, booking.driver_id] {
            let notification = Notification::new(NotificationEvent::Dispute, Some(booking.id), message)
                .with_status(booking.status);
            self.notify(user, notification).await;
        }
    }

    async fn notify(&self, user_id: Uuid, notification: Notification) {
        let frame = ServerFrame::Notification(notification);
        publish_frame(self.bus.as_ref(), &notification_group(user_id), &frame).await;
    }
}

pub(crate) fn require_staff(caller: &Identity) -> Result<(), DispatchError> {
    if caller.role == Role::Staff {
        Ok(())
    } else {
        Err(DispatchError::authorization(
            "You do not have permission to perform this action.",
        ))
    }
}

fn transition_message(role: Role, to: BookingStatus) -> &'static str {
    match (role, to) {
        (_, Accepted) => "Booking accepted successfully.",
        (_, InProgress) => "Booking is now in progress.",
        (_, Completed) => "Booking completed successfully.",
        (Role::Driver, Cancelled) => "Booking cancelled by driver.",
        (_, Cancelled) => "Booking cancelled successfully.",
        _ => "Booking status updated.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presence::MemoryPresence;
    use crate::store::{MemoryStore, User};
    use crate::test_support::{FailingBus, RecordingBus};
    use rust_decimal_macros::dec;

    const ALL: [BookingStatus; 6] = [Pending, Accepted, InProgress, Cancelled, Completed, DisputeApproved];

    struct Fixture {
        engine: BookingEngine,
        store: Arc<MemoryStore>,
        bus: Arc<RecordingBus>,
        passenger: Identity,
        driver: Identity,
    }

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            email: format!("{}-{}@example.com", role, Uuid::new_v4().simple()),
            role,
        }
    }

    fn register(store: &MemoryStore, identity: &Identity) {
        store.insert_user(User {
            id: identity.user_id,
            email: identity.email.clone(),
            fullname: "Test".to_string(),
            role: identity.role,
            is_active: true,
        });
    }

    fn fixture_with_bus(bus: Arc<dyn PubSub>, recording: Arc<RecordingBus>) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let passenger = identity(Role::Passenger);
        let driver = identity(Role::Driver);
        register(&store, &passenger);
        register(&store, &driver);

        let engine = BookingEngine::new(
            store.clone(),
            Arc::new(MemoryPresence::new()),
            bus,
            dec!(-5000),
        );
        Fixture {
            engine,
            store,
            bus: recording,
            passenger,
            driver,
        }
    }

    fn fixture() -> Fixture {
        let bus = Arc::new(RecordingBus::default());
        fixture_with_bus(bus.clone(), bus)
    }

    fn ride(driver: &Identity) -> CreateBooking {
        CreateBooking {
            driver_id: None,
            driver_email: Some(driver.email.clone()),
            booking_type: BookingType::Ride,
            origin: "Ikeja".to_string(),
            destination: "Lekki".to_string(),
            price: dec!(2500),
            package_details: None,
        }
    }

    async fn booking_in(f: &Fixture, status: BookingStatus) -> BookingId {
        let booking = f.engine.create_booking(&f.passenger, ride(&f.driver)).await.unwrap();
        if status != Pending {
            f.store.swap_status(booking.id, Pending, status).await.unwrap();
        }
        booking.id
    }

    #[test]
    fn test_table_terminal_states_have_no_exits() {
        let table = TransitionTable::default();
        for role in [Role::Passenger, Role::Driver, Role::Staff] {
            for from in [Cancelled, Completed, DisputeApproved] {
                assert!(table.allowed(role, from).is_empty());
            }
        }
    }

    #[tokio::test]
    async fn test_every_triple_matches_table() {
        let table = TransitionTable::default();
        for role in [Role::Passenger, Role::Driver] {
            for from in ALL {
                for to in ALL {
                    let f = fixture();
                    let id = booking_in(&f, from).await;
                    let caller = if role == Role::Passenger { &f.passenger } else { &f.driver };

                    let result = f.engine.update_status(caller, id, to).await;
                    let status = f.store.booking(id).await.unwrap().unwrap().status;
                    let idempotent = role == Role::Passenger && from == Completed && to == Completed;

                    if table.permits(role, from, to) {
                        assert!(result.is_ok(), "{role} {from}->{to} should pass");
                        assert_eq!(status, to);
                    } else if idempotent {
                        assert_eq!(result.unwrap().outcome, TransitionOutcome::AlreadyCompleted);
                        assert_eq!(status, from);
                    } else {
                        assert!(result.is_err(), "{role} {from}->{to} should fail");
                        assert_eq!(status, from);
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_non_party_rejected() {
        let f = fixture();
        let id = booking_in(&f, Pending).await;
        let stranger = identity(Role::Driver);

        let result = f.engine.update_status(&stranger, id, Accepted).await;
        assert!(matches!(result, Err(DispatchError::Authorization(_))));
    }

    #[tokio::test]
    async fn test_completed_rejections() {
        let f = fixture();
        let id = booking_in(&f, Completed).await;

        let result = f.engine.update_status(&f.driver, id, Cancelled).await;
        assert!(matches!(
            result,
            Err(DispatchError::Conflict(ref m)) if m == "This booking has already been completed."
        ));

        let before = f.bus.published().len();
        let ack = f.engine.update_status(&f.passenger, id, Completed).await.unwrap();
        assert_eq!(ack.message, "Booking completion confirmed successfully.");
        assert_eq!(f.bus.published().len(), before);
    }

    #[tokio::test]
    async fn test_passenger_target_validation() {
        let f = fixture();
        let id = booking_in(&f, Pending).await;
        let result = f.engine.update_status(&f.passenger, id, Accepted).await;
        assert!(matches!(
            result,
            Err(DispatchError::Validation(ref m)) if m == "You can only update status to cancelled or completed."
        ));
    }

    #[tokio::test]
    async fn test_notification_goes_to_counterparty() {
        let f = fixture();
        let id = booking_in(&f, Pending).await;
        f.engine.update_status(&f.driver, id, Accepted).await.unwrap();

        let frames = f.bus.frames_for(&notification_group(f.passenger.user_id));
        assert!(frames.iter().any(|frame| matches!(
            frame,
            ServerFrame::Notification(n) if n.status == Some(Accepted) && n.booking_id == Some(id)
        )));
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_transition() {
        let recording = Arc::new(RecordingBus::default());
        let f = fixture_with_bus(Arc::new(FailingBus), recording);
        let id = booking_in(&f, Pending).await;

        let ack = f.engine.update_status(&f.driver, id, Accepted).await.unwrap();
        assert_eq!(ack.outcome, TransitionOutcome::Applied);
        assert_eq!(f.store.booking(id).await.unwrap().unwrap().status, Accepted);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_accept_apply_once() {
        let f = Arc::new(fixture());
        let id = booking_in(&f, Pending).await;

        let (cancel, accept) = tokio::join!(
            f.engine.update_status(&f.passenger, id, Cancelled),
            f.engine.update_status(&f.driver, id, Accepted),
        );
        let status = f.store.booking(id).await.unwrap().unwrap().status;
        match (cancel.is_ok(), accept.is_ok()) {
            (true, false) => assert_eq!(status, Cancelled),
            (false, true) => assert_eq!(status, Accepted),
            // accept then cancel-from-accepted is also legal for a passenger
            (true, true) => assert_eq!(status, Cancelled),
            (false, false) => panic!("one transition must win"),
        }
    }

    #[tokio::test]
    async fn test_create_booking_notifies_driver() {
        let f = fixture();
        let booking = f.engine.create_booking(&f.passenger, ride(&f.driver)).await.unwrap();
        assert_eq!(booking.status, Pending);
        assert!(booking.payment_reference.starts_with("bk_"));

        let frames = f.bus.frames_for(&notification_group(f.driver.user_id));
        let ServerFrame::Notification(notification) = &frames[0] else {
            panic!("expected notification");
        };
        assert_eq!(notification.event, NotificationEvent::NewBooking);
        assert_eq!(notification.details.as_ref().unwrap()["origin"], "Ikeja");
    }

    #[tokio::test]
    async fn test_create_booking_validation() {
        let f = fixture();

        let result = f.engine.create_booking(&f.driver, ride(&f.driver)).await;
        assert!(matches!(result, Err(DispatchError::Authorization(_))));

        let mut unknown = ride(&f.driver);
        unknown.driver_email = Some("nobody@example.com".to_string());
        let result = f.engine.create_booking(&f.passenger, unknown).await;
        assert!(matches!(result, Err(DispatchError::Validation(_))));

        let mut delivery = ride(&f.driver);
        delivery.booking_type = BookingType::Delivery;
        let result = f.engine.create_booking(&f.passenger, delivery).await;
        assert!(matches!(result, Err(DispatchError::Validation(_))));

        let mut free = ride(&f.driver);
        free.price = Decimal::ZERO;
        assert!(f.engine.create_booking(&f.passenger, free).await.is_err());
    }

    #[tokio::test]
    async fn test_available_drivers_respects_floor() {
        let f = fixture();
        let indebted = identity(Role::Driver);
        register(&f.store, &indebted);
        f.store.set_wallet(indebted.user_id, dec!(-5000.01));
        f.store.set_wallet(f.driver.user_id, dec!(-5000));

        let ids: Vec<Uuid> = f
            .engine
            .available_drivers()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec![f.driver.user_id]);

        let mut command = ride(&indebted);
        command.driver_email = Some(indebted.email.clone());
        assert!(f.engine.create_booking(&f.passenger, command).await.is_err());
    }

    #[tokio::test]
    async fn test_dispute_flow() {
        let f = fixture();
        let staff = identity(Role::Staff);
        let id = booking_in(&f, Completed).await;

        assert!(matches!(
            f.engine.approve_dispute(&staff, id).await,
            Err(DispatchError::Conflict(_))
        ));

        let booking = f
            .engine
            .mark_disputed(&f.passenger, id, Some("Overcharged".to_string()))
            .await
            .unwrap();
        assert!(booking.is_disputed);
        assert!(f.engine.mark_disputed(&f.driver, id, None).await.is_err());

        assert!(matches!(
            f.engine.approve_dispute(&f.passenger, id).await,
            Err(DispatchError::Authorization(_))
        ));
        let booking = f.engine.approve_dispute(&staff, id).await.unwrap();
        assert_eq!(booking.status, DisputeApproved);
        assert!(!booking.is_disputed);

        let stored = f.store.booking(id).await.unwrap().unwrap();
        assert_eq!(stored, booking);
    }

    #[tokio::test]
    async fn test_approve_after_resolution_is_rejected() {
        let f = fixture();
        let staff = identity(Role::Staff);
        let id = booking_in(&f, InProgress).await;
        f.engine.mark_disputed(&f.driver, id, None).await.unwrap();

        // A resolution lands between the load and the approval write
        f.store
            .update_dispute(
                id,
                DisputeUpdate::Resolve {
                    resolution: "Refunded".to_string(),
                },
            )
            .await
            .unwrap();

        assert!(matches!(
            f.store
                .approve_dispute(id, InProgress, "Dispute approved.".to_string())
                .await
                .unwrap(),
            StatusSwap::Stale(ref b) if b.status == InProgress && !b.is_disputed
        ));
        assert!(matches!(
            f.engine.approve_dispute(&staff, id).await,
            Err(DispatchError::Conflict(_))
        ));
        assert_eq!(f.store.booking(id).await.unwrap().unwrap().status, InProgress);
    }

    #[tokio::test]
    async fn test_list_bookings_is_role_scoped() {
        let f = fixture();
        booking_in(&f, Pending).await;
        let other = identity(Role::Passenger);

        assert_eq!(f.engine.list_bookings(&f.passenger).await.unwrap().len(), 1);
        assert_eq!(f.engine.list_bookings(&f.driver).await.unwrap().len(), 1);
        assert!(f.engine.list_bookings(&other).await.unwrap().is_empty());
        assert_eq!(
            f.engine.list_bookings(&identity(Role::Staff)).await.unwrap().len(),
            1
        );
    }
}

//! System of record
//!
//! [`Store`] is the port every engine mutates through. Each mutating method is
//! a single atomic read-modify-write: implementations must apply it under a
//! row lock (or an equivalent compare-and-swap) so concurrent transitions and
//! ledger writes never interleave.
//!
//! [`MemoryStore`] holds every table in `DashMap`s. A `get_mut` guard is the
//! row lock. Multi-row operations always lock in the order
//! booking → wallet and withdrawal → wallet, and never hold a guard across
//! an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::{Identity, Role};

pub type BookingId = i64;
pub type TicketId = i64;

/// Directory entry for any marketplace participant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    #[serde(default)]
    pub fullname: String,
    pub role: Role,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingType {
    Ride,
    Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    InProgress,
    Cancelled,
    Completed,
    DisputeApproved,
}

impl BookingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Accepted => "accepted",
            BookingStatus::InProgress => "in_progress",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::DisputeApproved => "dispute_approved",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BookingStatus::Cancelled | BookingStatus::Completed | BookingStatus::DisputeApproved
        )
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisputeStatus {
    Pending,
    InReview,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub passenger_id: Uuid,
    pub driver_id: Uuid,
    pub booking_type: BookingType,
    pub status: BookingStatus,
    pub origin: String,
    pub destination: String,
    pub price: Decimal,
    pub package_details: Option<String>,
    pub payment_reference: String,
    pub paid: bool,
    /// Cash amount the driver reported collecting, pending passenger confirmation
    pub cash_reported: Option<Decimal>,
    pub is_disputed: bool,
    pub dispute_status: Option<DisputeStatus>,
    pub dispute_reason: Option<String>,
    pub dispute_resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    /// The caller's side of this booking, if they are a party to it
    pub fn party_role(&self, user_id: Uuid) -> Option<Role> {
        if user_id == self.passenger_id {
            Some(Role::Passenger)
        } else if user_id == self.driver_id {
            Some(Role::Driver)
        } else {
            None
        }
    }

    /// The other party, as seen from `role`
    pub fn counterparty(&self, role: Role) -> Uuid {
        match role {
            Role::Driver => self.passenger_id,
            _ => self.driver_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub passenger_id: Uuid,
    pub driver_id: Uuid,
    pub booking_type: BookingType,
    pub origin: String,
    pub destination: String,
    pub price: Decimal,
    pub package_details: Option<String>,
    pub payment_reference: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: i64,
    pub driver_id: Uuid,
    pub amount: Decimal,
    pub reference: String,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicket {
    pub id: TicketId,
    pub passenger_id: Uuid,
    pub assigned_staff: Option<Uuid>,
    pub status: TicketStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: i64,
    pub sender_id: Uuid,
    pub sender_email: String,
    pub sender_role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of a compare-and-swap on a booking's status
#[derive(Debug, Clone, PartialEq)]
pub enum StatusSwap {
    Swapped(Booking),
    /// The status no longer matched the expected value; carries the current row
    Stale(Booking),
}

/// Outcome of marking a booking paid together with its wallet mutation
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Applied { booking: Booking, balance: Decimal },
    AlreadyPaid,
}

/// Outcome of completing a withdrawal together with its wallet mutation
#[derive(Debug, Clone, PartialEq)]
pub enum WithdrawalSettlement {
    Applied {
        request: WithdrawalRequest,
        balance: Decimal,
    },
    AlreadyCompleted,
}

/// Outcome of a staff claim on a ticket
#[derive(Debug, Clone, PartialEq)]
pub enum Claim {
    Claimed(SupportTicket),
    /// The caller already holds the ticket
    Held(SupportTicket),
    /// Another staff member holds the ticket
    Taken(Uuid),
}

#[derive(Debug, Clone)]
pub enum DisputeUpdate {
    Raise { reason: Option<String> },
    Resolve { resolution: String },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("insufficient balance: available {available}, requested {requested}")]
    InsufficientBalance {
        available: Decimal,
        requested: Decimal,
    },
    #[error("duplicate {0}")]
    Duplicate(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    // User directory
    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;
    async fn users_with_role(&self, role: Role) -> Result<Vec<User>, StoreError>;
    async fn wallet_balance(&self, driver_id: Uuid) -> Result<Decimal, StoreError>;

    // Bookings
    async fn insert_booking(&self, booking: NewBooking) -> Result<Booking, StoreError>;
    async fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError>;
    async fn booking_by_reference(&self, reference: &str) -> Result<Option<Booking>, StoreError>;
    /// Bookings where `user_id` is the party matching `role`; staff see everything
    async fn bookings_for(&self, user_id: Uuid, role: Role) -> Result<Vec<Booking>, StoreError>;
    async fn swap_status(
        &self,
        id: BookingId,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<StatusSwap, StoreError>;
    /// Atomically apply `wallet_delta` to the booking's driver and mark the booking paid
    async fn settle_booking(
        &self,
        id: BookingId,
        wallet_delta: Decimal,
    ) -> Result<Settlement, StoreError>;
    async fn record_cash_report(&self, id: BookingId, amount: Decimal)
    -> Result<Booking, StoreError>;
    async fn update_dispute(
        &self,
        id: BookingId,
        update: DisputeUpdate,
    ) -> Result<Booking, StoreError>;
    /// Atomically terminalize a disputed booking as `dispute_approved` and
    /// resolve its dispute; stale unless still disputed in `expected`
    async fn approve_dispute(
        &self,
        id: BookingId,
        expected: BookingStatus,
        resolution: String,
    ) -> Result<StatusSwap, StoreError>;

    // Withdrawals
    /// Rejects an amount above the balance less every pending request
    async fn insert_withdrawal(
        &self,
        driver_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> Result<WithdrawalRequest, StoreError>;
    async fn withdrawals_for(&self, driver_id: Uuid) -> Result<Vec<WithdrawalRequest>, StoreError>;
    /// Atomically debit `amount` and complete the request; `None` for an unknown reference
    async fn settle_withdrawal(
        &self,
        reference: &str,
        amount: Decimal,
    ) -> Result<Option<WithdrawalSettlement>, StoreError>;

    // Ride chat
    async fn append_booking_message(
        &self,
        booking_id: BookingId,
        sender: &Identity,
        message: String,
    ) -> Result<ChatMessage, StoreError>;
    async fn booking_messages(&self, booking_id: BookingId) -> Result<Vec<ChatMessage>, StoreError>;

    // Support
    async fn create_ticket(&self, passenger_id: Uuid) -> Result<SupportTicket, StoreError>;
    async fn ticket(&self, id: TicketId) -> Result<Option<SupportTicket>, StoreError>;
    async fn claim_ticket(&self, id: TicketId, staff_id: Uuid) -> Result<Claim, StoreError>;
    async fn close_ticket(&self, id: TicketId) -> Result<SupportTicket, StoreError>;
    async fn unassigned_tickets(&self) -> Result<Vec<SupportTicket>, StoreError>;
    async fn append_ticket_message(
        &self,
        ticket_id: TicketId,
        sender: &Identity,
        message: String,
    ) -> Result<ChatMessage, StoreError>;
    async fn ticket_messages(&self, ticket_id: TicketId) -> Result<Vec<ChatMessage>, StoreError>;
}

/// Seed document for the in-memory user directory
#[derive(Debug, Default, Deserialize)]
pub struct DirectorySeed {
    #[serde(default)]
    pub users: Vec<User>,
    #[serde(default)]
    pub wallets: HashMap<Uuid, Decimal>,
}

/// In-process store for single-instance deployments and tests
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    wallets: DashMap<Uuid, Decimal>,
    bookings: DashMap<BookingId, Booking>,
    references: DashMap<String, BookingId>,
    withdrawals: DashMap<String, WithdrawalRequest>,
    booking_chat: DashMap<BookingId, Vec<ChatMessage>>,
    tickets: DashMap<TicketId, SupportTicket>,
    ticket_chat: DashMap<TicketId, Vec<ChatMessage>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seed(seed: DirectorySeed) -> Self {
        let store = Self::new();
        for user in seed.users {
            store.insert_user(user);
        }
        for (driver_id, balance) in seed.wallets {
            store.set_wallet(driver_id, balance);
        }
        store
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    /// Seed a wallet balance; the engines never call this
    pub fn set_wallet(&self, driver_id: Uuid, balance: Decimal) {
        self.wallets.insert(driver_id, balance);
    }

    fn next_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn chat_message(&self, sender: &Identity, message: String) -> ChatMessage {
        ChatMessage {
            id: self.next_id(),
            sender_id: sender.user_id,
            sender_email: sender.email.clone(),
            sender_role: sender.role,
            message,
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|u| u.clone()))
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .find(|u| u.email.eq_ignore_ascii_case(email))
            .map(|u| u.clone()))
    }

    async fn users_with_role(&self, role: Role) -> Result<Vec<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|u| u.role == role)
            .map(|u| u.clone())
            .collect())
    }

    async fn wallet_balance(&self, driver_id: Uuid) -> Result<Decimal, StoreError> {
        Ok(self
            .wallets
            .get(&driver_id)
            .map(|b| *b)
            .unwrap_or(Decimal::ZERO))
    }

    async fn insert_booking(&self, new: NewBooking) -> Result<Booking, StoreError> {
        if self.references.contains_key(&new.payment_reference) {
            return Err(StoreError::Duplicate(format!(
                "payment reference {}",
                new.payment_reference
            )));
        }

        let now = Utc::now();
        let booking = Booking {
            id: self.next_id(),
            passenger_id: new.passenger_id,
            driver_id: new.driver_id,
            booking_type: new.booking_type,
            status: BookingStatus::Pending,
            origin: new.origin,
            destination: new.destination,
            price: new.price,
            package_details: new.package_details,
            payment_reference: new.payment_reference,
            paid: false,
            cash_reported: None,
            is_disputed: false,
            dispute_status: None,
            dispute_reason: None,
            dispute_resolution: None,
            created_at: now,
            updated_at: now,
        };

        self.references
            .insert(booking.payment_reference.clone(), booking.id);
        self.bookings.insert(booking.id, booking.clone());
        Ok(booking)
    }

    async fn booking(&self, id: BookingId) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|b| b.clone()))
    }

    async fn booking_by_reference(&self, reference: &str) -> Result<Option<Booking>, StoreError> {
        let id = match self.references.get(reference) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.bookings.get(&id).map(|b| b.clone()))
    }

    async fn bookings_for(&self, user_id: Uuid, role: Role) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .filter(|b| match role {
                Role::Passenger => b.passenger_id == user_id,
                Role::Driver => b.driver_id == user_id,
                Role::Staff => true,
            })
            .map(|b| b.clone())
            .collect();
        bookings.sort_by_key(|b| b.id);
        Ok(bookings)
    }

    async fn swap_status(
        &self,
        id: BookingId,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<StatusSwap, StoreError> {
        let mut booking = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("booking", id))?;

        if booking.status != expected {
            return Ok(StatusSwap::Stale(booking.clone()));
        }

        booking.status = next;
        booking.updated_at = Utc::now();
        Ok(StatusSwap::Swapped(booking.clone()))
    }

    async fn settle_booking(
        &self,
        id: BookingId,
        wallet_delta: Decimal,
    ) -> Result<Settlement, StoreError> {
        let mut booking = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("booking", id))?;

        if booking.paid {
            return Ok(Settlement::AlreadyPaid);
        }

        let mut wallet = self.wallets.entry(booking.driver_id).or_insert(Decimal::ZERO);
        *wallet += wallet_delta;
        booking.paid = true;
        booking.updated_at = Utc::now();

        Ok(Settlement::Applied {
            booking: booking.clone(),
            balance: *wallet,
        })
    }

    async fn record_cash_report(
        &self,
        id: BookingId,
        amount: Decimal,
    ) -> Result<Booking, StoreError> {
        let mut booking = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("booking", id))?;
        booking.cash_reported = Some(amount);
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn update_dispute(
        &self,
        id: BookingId,
        update: DisputeUpdate,
    ) -> Result<Booking, StoreError> {
        let mut booking = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("booking", id))?;

        match update {
            DisputeUpdate::Raise { reason } => {
                booking.is_disputed = true;
                booking.dispute_status = Some(DisputeStatus::Pending);
                booking.dispute_reason = reason;
            }
            DisputeUpdate::Resolve { resolution } => {
                booking.is_disputed = false;
                booking.dispute_status = Some(DisputeStatus::Resolved);
                booking.dispute_resolution = Some(resolution);
            }
        }
        booking.updated_at = Utc::now();
        Ok(booking.clone())
    }

    async fn approve_dispute(
        &self,
        id: BookingId,
        expected: BookingStatus,
        resolution: String,
    ) -> Result<StatusSwap, StoreError> {
        let mut booking = self
            .bookings
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("booking", id))?;

        if booking.status != expected || !booking.is_disputed {
            return Ok(StatusSwap::Stale(booking.clone()));
        }

        booking.status = BookingStatus::DisputeApproved;
        booking.is_disputed = false;
        booking.dispute_status = Some(DisputeStatus::Resolved);
        booking.dispute_resolution = Some(resolution);
        booking.updated_at = Utc::now();
        Ok(StatusSwap::Swapped(booking.clone()))
    }

    async fn insert_withdrawal(
        &self,
        driver_id: Uuid,
        amount: Decimal,
        reference: &str,
    ) -> Result<WithdrawalRequest, StoreError> {
        // Lock order is wallets then withdrawals; the wallet entry guard
        // serializes every request from this driver
        let wallet = self.wallets.entry(driver_id).or_insert(Decimal::ZERO);
        let pending: Decimal = self
            .withdrawals
            .iter()
            .filter(|w| w.driver_id == driver_id && !w.completed)
            .map(|w| w.amount)
            .sum();
        let available = *wallet - pending;
        if amount > available {
            return Err(StoreError::InsufficientBalance {
                available,
                requested: amount,
            });
        }

        let request = WithdrawalRequest {
            id: self.next_id(),
            driver_id,
            amount,
            reference: reference.to_string(),
            completed: false,
            created_at: Utc::now(),
        };

        match self.withdrawals.entry(reference.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StoreError::Duplicate(format!("withdrawal reference {reference}")))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(request.clone());
                Ok(request)
            }
        }
    }

    async fn withdrawals_for(&self, driver_id: Uuid) -> Result<Vec<WithdrawalRequest>, StoreError> {
        let mut requests: Vec<WithdrawalRequest> = self
            .withdrawals
            .iter()
            .filter(|w| w.driver_id == driver_id)
            .map(|w| w.clone())
            .collect();
        requests.sort_by_key(|w| w.id);
        Ok(requests)
    }

    async fn settle_withdrawal(
        &self,
        reference: &str,
        amount: Decimal,
    ) -> Result<Option<WithdrawalSettlement>, StoreError> {
        let Some(driver_id) = self.withdrawals.get(reference).map(|w| w.driver_id) else {
            return Ok(None);
        };

        let mut wallet = self.wallets.entry(driver_id).or_insert(Decimal::ZERO);
        let Some(mut request) = self.withdrawals.get_mut(reference) else {
            return Ok(None);
        };
        if request.completed {
            return Ok(Some(WithdrawalSettlement::AlreadyCompleted));
        }

        *wallet -= amount;
        request.completed = true;

        Ok(Some(WithdrawalSettlement::Applied {
            request: request.clone(),
            balance: *wallet,
        }))
    }

    async fn append_booking_message(
        &self,
        booking_id: BookingId,
        sender: &Identity,
        message: String,
    ) -> Result<ChatMessage, StoreError> {
        if !self.bookings.contains_key(&booking_id) {
            return Err(StoreError::not_found("booking", booking_id));
        }
        let message = self.chat_message(sender, message);
        self.booking_chat
            .entry(booking_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn booking_messages(&self, booking_id: BookingId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .booking_chat
            .get(&booking_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }

    async fn create_ticket(&self, passenger_id: Uuid) -> Result<SupportTicket, StoreError> {
        let ticket = SupportTicket {
            id: self.next_id(),
            passenger_id,
            assigned_staff: None,
            status: TicketStatus::Open,
            created_at: Utc::now(),
        };
        self.tickets.insert(ticket.id, ticket.clone());
        Ok(ticket)
    }

    async fn ticket(&self, id: TicketId) -> Result<Option<SupportTicket>, StoreError> {
        Ok(self.tickets.get(&id).map(|t| t.clone()))
    }

    async fn claim_ticket(&self, id: TicketId, staff_id: Uuid) -> Result<Claim, StoreError> {
        let mut ticket = self
            .tickets
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("ticket", id))?;

        match ticket.assigned_staff {
            None => {
                ticket.assigned_staff = Some(staff_id);
                if ticket.status == TicketStatus::Open {
                    ticket.status = TicketStatus::InProgress;
                }
                Ok(Claim::Claimed(ticket.clone()))
            }
            Some(holder) if holder == staff_id => Ok(Claim::Held(ticket.clone())),
            Some(holder) => Ok(Claim::Taken(holder)),
        }
    }

    async fn close_ticket(&self, id: TicketId) -> Result<SupportTicket, StoreError> {
        let mut ticket = self
            .tickets
            .get_mut(&id)
            .ok_or_else(|| StoreError::not_found("ticket", id))?;
        ticket.status = TicketStatus::Closed;
        Ok(ticket.clone())
    }

    async fn unassigned_tickets(&self) -> Result<Vec<SupportTicket>, StoreError> {
        let mut tickets: Vec<SupportTicket> = self
            .tickets
            .iter()
            .filter(|t| t.assigned_staff.is_none() && t.status == TicketStatus::Open)
            .map(|t| t.clone())
            .collect();
        tickets.sort_by_key(|t| t.id);
        Ok(tickets)
    }

    async fn append_ticket_message(
        &self,
        ticket_id: TicketId,
        sender: &Identity,
        message: String,
    ) -> Result<ChatMessage, StoreError> {
        if !self.tickets.contains_key(&ticket_id) {
            return Err(StoreError::not_found("ticket", ticket_id));
        }
        let message = self.chat_message(sender, message);
        self.ticket_chat
            .entry(ticket_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }

    async fn ticket_messages(&self, ticket_id: TicketId) -> Result<Vec<ChatMessage>, StoreError> {
        Ok(self
            .ticket_chat
            .get(&ticket_id)
            .map(|m| m.clone())
            .unwrap_or_default())
    }
}

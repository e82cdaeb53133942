//! Wire frames for persistent connections
//!
//! Inbound frames are route-specific JSON objects. Every outbound frame is a
//! JSON object tagged by `type`.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::{BookingId, BookingStatus, ChatMessage, TicketId};

/// Driver location sample on the location channel
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
}

/// Chat input on ride chat and support channels
#[derive(Debug, Clone, Deserialize)]
pub struct ChatInput {
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEvent {
    NewBooking,
    StatusUpdate,
    CashReported,
    CashConfirmed,
    PaymentReceived,
    WithdrawalCompleted,
    Dispute,
}

/// Server-initiated notice to a user's personal group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub event: NotificationEvent,
    pub booking_id: Option<BookingId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<BookingStatus>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(event: NotificationEvent, booking_id: Option<BookingId>, message: impl Into<String>) -> Self {
        Self {
            event,
            booking_id,
            status: None,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_status(mut self, status: BookingStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Details attached to a `new_booking` notification
#[derive(Debug, Clone, Serialize)]
pub struct NewBookingDetails<'a> {
    pub booking_type: crate::store::BookingType,
    pub origin: &'a str,
    pub destination: &'a str,
    pub price: Decimal,
    pub package_details: Option<&'a str>,
    pub passenger_id: Uuid,
}

/// Outbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Location {
        booking_id: BookingId,
        latitude: f64,
        longitude: f64,
    },
    Notification(Notification),
    ChatMessage(ChatMessage),
    TicketCreated {
        ticket_id: TicketId,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

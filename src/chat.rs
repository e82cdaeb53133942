//! Ride chat between the two parties of a booking
//!
//! Messages are appended to the booking's ordered log before they are fanned
//! out, so a party joining later replays exactly what was delivered live.

use std::sync::Arc;

use tracing::debug;

use crate::auth::Identity;
use crate::error::DispatchError;
use crate::protocol::ServerFrame;
use crate::pubsub::{PubSub, booking_group, publish_frame};
use crate::store::{BookingId, ChatMessage, Store};

/// Longest accepted chat message, in characters
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub struct RideChat {
    store: Arc<dyn Store>,
    bus: Arc<dyn PubSub>,
}

impl RideChat {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn PubSub>) -> Self {
        Self { store, bus }
    }

    /// Full history, oldest first
    pub async fn history(&self, booking_id: BookingId) -> Result<Vec<ChatMessage>, DispatchError> {
        Ok(self.store.booking_messages(booking_id).await?)
    }

    /// Persist a message from an authorized party and fan it out
    pub async fn post(
        &self,
        sender: &Identity,
        booking_id: BookingId,
        text: &str,
    ) -> Result<ChatMessage, DispatchError> {
        let text = validate_message(text)?;
        let message = self
            .store
            .append_booking_message(booking_id, sender, text)
            .await?;

        debug!(booking_id, sender_id = %sender.user_id, "chat message stored");
        let frame = ServerFrame::ChatMessage(message.clone());
        publish_frame(self.bus.as_ref(), &booking_group(booking_id), &frame).await;
        Ok(message)
    }
}

/// Trim and bound a chat message
pub(crate) fn validate_message(text: &str) -> Result<String, DispatchError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(DispatchError::validation("Message cannot be empty."));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(DispatchError::validation(format!(
            "Message cannot exceed {MAX_MESSAGE_CHARS} characters."
        )));
    }
    Ok(text.to_string())
}

//! Support session engine
//!
//! A passenger connecting without a ticket id gets a fresh ticket. Staff
//! claim tickets first-come: the store's claim is a compare-and-set on the
//! assignment, so two agents racing for one ticket see exactly one winner.

use std::sync::Arc;

use tracing::{debug, info};

use crate::auth::{Identity, Role};
use crate::chat::validate_message;
use crate::error::DispatchError;
use crate::lifecycle::require_staff;
use crate::protocol::ServerFrame;
use crate::pubsub::{PubSub, publish_frame, support_group};
use crate::store::{ChatMessage, Claim, Store, SupportTicket, TicketId, TicketStatus};

/// How a connection ended up on a ticket
#[derive(Debug, Clone, PartialEq)]
pub enum SupportJoin {
    /// New ticket for a first contact; nothing to replay
    Created(SupportTicket),
    Resumed {
        ticket: SupportTicket,
        history: Vec<ChatMessage>,
    },
}

impl SupportJoin {
    pub fn ticket(&self) -> &SupportTicket {
        match self {
            SupportJoin::Created(ticket) => ticket,
            SupportJoin::Resumed { ticket, .. } => ticket,
        }
    }
}

pub struct SupportEngine {
    store: Arc<dyn Store>,
    bus: Arc<dyn PubSub>,
}

impl SupportEngine {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn PubSub>) -> Self {
        Self { store, bus }
    }

    /// Create or resume the caller's ticket
    pub async fn open(
        &self,
        caller: &Identity,
        ticket_id: Option<TicketId>,
    ) -> Result<SupportJoin, DispatchError> {
        let Some(ticket_id) = ticket_id else {
            return match caller.role {
                Role::Passenger => {
                    let ticket = self.store.create_ticket(caller.user_id).await?;
                    info!(ticket_id = ticket.id, passenger_id = %caller.user_id, "support ticket created");
                    Ok(SupportJoin::Created(ticket))
                }
                Role::Staff => Err(DispatchError::validation(
                    "A ticket id is required for staff connections.",
                )),
                Role::Driver => Err(DispatchError::authorization(
                    "Only passengers can open support tickets.",
                )),
            };
        };

        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("Ticket not found."))?;

        let ticket = match caller.role {
            Role::Staff => match self.store.claim_ticket(ticket_id, caller.user_id).await? {
                Claim::Claimed(ticket) => {
                    info!(ticket_id, staff_id = %caller.user_id, "support ticket claimed");
                    ticket
                }
                Claim::Held(ticket) => ticket,
                Claim::Taken(holder) => {
                    debug!(ticket_id, %holder, staff_id = %caller.user_id, "ticket already claimed");
                    return Err(DispatchError::conflict(
                        "This ticket is already assigned to another agent.",
                    ));
                }
            },
            Role::Passenger if ticket.passenger_id == caller.user_id => ticket,
            _ => {
                return Err(DispatchError::authorization(
                    "You are not authorized to access this ticket.",
                ));
            }
        };

        let history = self.store.ticket_messages(ticket_id).await?;
        Ok(SupportJoin::Resumed { ticket, history })
    }

    /// Persist a message on an open ticket and fan it out
    pub async fn post(
        &self,
        sender: &Identity,
        ticket_id: TicketId,
        text: &str,
    ) -> Result<ChatMessage, DispatchError> {
        let text = validate_message(text)?;
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("Ticket not found."))?;
        if ticket.status == TicketStatus::Closed {
            return Err(DispatchError::conflict("This ticket has been closed."));
        }

        let message = self
            .store
            .append_ticket_message(ticket_id, sender, text)
            .await?;
        let frame = ServerFrame::ChatMessage(message.clone());
        publish_frame(self.bus.as_ref(), &support_group(ticket_id), &frame).await;
        Ok(message)
    }

    /// Open tickets no agent has claimed yet
    pub async fn unassigned(&self, caller: &Identity) -> Result<Vec<SupportTicket>, DispatchError> {
        require_staff(caller)?;
        Ok(self.store.unassigned_tickets().await?)
    }

    /// The assigned agent closes a ticket
    pub async fn close(&self, caller: &Identity, ticket_id: TicketId) -> Result<SupportTicket, DispatchError> {
        require_staff(caller)?;
        let ticket = self
            .store
            .ticket(ticket_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("Ticket not found."))?;
        if ticket.assigned_staff != Some(caller.user_id) {
            return Err(DispatchError::authorization(
                "Only the assigned agent can close this ticket.",
            ));
        }
        if ticket.status == TicketStatus::Closed {
            return Err(DispatchError::conflict("This ticket has been closed."));
        }

        let ticket = self.store.close_ticket(ticket_id).await?;
        info!(ticket_id, staff_id = %caller.user_id, "support ticket closed");
        Ok(ticket)
    }
}

//! Connection session
//!
//! A session is the per-connection actor: [`Session::open`] authorizes the
//! route and produces the group memberships, [`Session::handle_text`] runs
//! once per inbound frame, and [`Session::close`] is the termination hook
//! that always runs cleanup. Sessions never touch each other's transport;
//! everything they emit goes through the bus or their own outbox.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{Identity, Role};
use crate::dispatch::Dispatch;
use crate::error::DispatchError;
use crate::hub::ConnId;
use crate::protocol::{ChatInput, LocationSample, ServerFrame};
use crate::pubsub::{booking_group, notification_group, support_group};
use crate::store::{BookingId, TicketId};
use crate::support::SupportJoin;

/// Connection route, parsed from the upgrade path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Driver pushes location samples
    DriverLocation,
    /// A party follows the driver's location on a booking
    Tracking(BookingId),
    RideChat(BookingId),
    /// `None` opens a new ticket
    Support(Option<TicketId>),
    /// Server-initiated notices for the caller
    Notifications,
}

impl Route {
    /// Group this route's connection is joined to
    pub fn group(&self, identity: &Identity) -> Option<String> {
        match self {
            Route::DriverLocation => None,
            Route::Tracking(id) | Route::RideChat(id) => Some(booking_group(*id)),
            Route::Support(Some(ticket_id)) => Some(support_group(*ticket_id)),
            Route::Support(None) => None,
            Route::Notifications => Some(notification_group(identity.user_id)),
        }
    }

    /// The booking whose active marker this route owns
    fn tracked_booking(&self) -> Option<BookingId> {
        match self {
            Route::Tracking(id) | Route::RideChat(id) => Some(*id),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Route::DriverLocation => "location",
            Route::Tracking(_) => "tracking",
            Route::RideChat(_) => "ride_chat",
            Route::Support(_) => "support",
            Route::Notifications => "notifications",
        }
    }
}

/// A successfully opened session
pub struct Opened {
    pub session: Session,
    /// Frames queued for this connection by the hub
    pub outbox: mpsc::Receiver<Vec<u8>>,
    /// Frames to write before anything else: history or the new ticket id
    pub greeting: Vec<ServerFrame>,
}

pub struct Session {
    conn_id: ConnId,
    identity: Identity,
    route: Route,
    ctx: Arc<Dispatch>,
}

impl Session {
    /// Authorize the route, then register and join its group
    ///
    /// Nothing is registered with the hub unless authorization succeeds.
    pub async fn open(ctx: Arc<Dispatch>, identity: Identity, route: Route) -> Result<Opened, DispatchError> {
        let mut greeting = Vec::new();

        let route = match route {
            Route::DriverLocation => {
                if identity.role != Role::Driver {
                    return Err(DispatchError::authorization(
                        "Only drivers can share their location.",
                    ));
                }
                route
            }
            Route::Tracking(id) | Route::RideChat(id) => {
                ctx.bookings.booking_for_party(&identity, id).await?;
                route
            }
            Route::Support(ticket_id) => match ctx.support.open(&identity, ticket_id).await? {
                SupportJoin::Created(ticket) => {
                    greeting.push(ServerFrame::TicketCreated {
                        ticket_id: ticket.id,
                    });
                    Route::Support(Some(ticket.id))
                }
                SupportJoin::Resumed { ticket, history } => {
                    greeting.extend(history.into_iter().map(ServerFrame::ChatMessage));
                    Route::Support(Some(ticket.id))
                }
            },
            Route::Notifications => route,
        };

        let (conn_id, outbox) = ctx.hub.register(identity.user_id);
        if let Some(group) = route.group(&identity) {
            ctx.hub.join(conn_id, &group);
        }

        match route {
            Route::DriverLocation => {
                if let Err(e) = ctx.presence.mark_online(identity.user_id).await {
                    warn!(conn_id, driver_id = %identity.user_id, error = %e, "presence unavailable");
                }
            }
            Route::Tracking(id) | Route::RideChat(id) => {
                if let Err(e) = ctx.presence.activate_booking(id).await {
                    warn!(conn_id, booking_id = id, error = %e, "presence unavailable");
                }
            }
            _ => {}
        }

        // History is read after joining so nothing posted meanwhile is lost
        if let Route::RideChat(id) = route {
            match ctx.chat.history(id).await {
                Ok(history) => greeting.extend(history.into_iter().map(ServerFrame::ChatMessage)),
                Err(e) => {
                    ctx.hub.remove(conn_id);
                    if let Err(cleanup) = ctx.presence.deactivate_booking(id).await {
                        warn!(conn_id, booking_id = id, error = %cleanup, "failed to clear active booking");
                    }
                    return Err(e);
                }
            }
        }

        info!(conn_id, user_id = %identity.user_id, route = route.as_str(), "session opened");
        Ok(Opened {
            session: Session {
                conn_id,
                identity,
                route,
                ctx,
            },
            outbox,
            greeting,
        })
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn route(&self) -> Route {
        self.route
    }

    /// Handle one inbound text frame
    ///
    /// Rejections go back to this connection as an `error` frame and never
    /// end the session.
    pub async fn handle_text(&self, text: &str) {
        if let Err(e) = self.dispatch(text).await {
            debug!(conn_id = self.conn_id, error = %e, "inbound frame rejected");
            self.reply(&ServerFrame::error(e.to_string()));
        }
    }

    async fn dispatch(&self, text: &str) -> Result<(), DispatchError> {
        match self.route {
            Route::DriverLocation => {
                let sample: LocationSample = parse(text)?;
                self.ctx.relay.ingest(self.identity.user_id, sample).await
            }
            Route::RideChat(booking_id) => {
                let input: ChatInput = parse(text)?;
                self.ctx
                    .chat
                    .post(&self.identity, booking_id, &input.message)
                    .await
                    .map(drop)
            }
            Route::Support(Some(ticket_id)) => {
                let input: ChatInput = parse(text)?;
                self.ctx
                    .support
                    .post(&self.identity, ticket_id, &input.message)
                    .await
                    .map(drop)
            }
            Route::Tracking(_) | Route::Support(None) | Route::Notifications => Err(
                DispatchError::validation("This channel does not accept messages."),
            ),
        }
    }

    fn reply(&self, frame: &ServerFrame) {
        match frame.encode() {
            Ok(payload) => {
                self.ctx.hub.send(self.conn_id, &payload);
            }
            Err(e) => warn!(conn_id = self.conn_id, error = %e, "failed to encode reply"),
        }
    }

    /// Leave every group and clear presence owned by this connection
    ///
    /// Support assignments are left intact.
    pub async fn close(self) {
        self.ctx.hub.remove(self.conn_id);

        if self.route == Route::DriverLocation
            && let Err(e) = self.ctx.presence.remove_driver(self.identity.user_id).await
        {
            warn!(conn_id = self.conn_id, error = %e, "failed to clear driver presence");
        }
        if let Some(booking_id) = self.route.tracked_booking()
            && let Err(e) = self.ctx.presence.deactivate_booking(booking_id).await
        {
            warn!(conn_id = self.conn_id, booking_id, error = %e, "failed to clear active booking");
        }

        info!(conn_id = self.conn_id, user_id = %self.identity.user_id, route = self.route.as_str(), "session closed");
    }
}

fn parse<'a, T: serde::Deserialize<'a>>(text: &'a str) -> Result<T, DispatchError> {
    serde_json::from_str(text).map_err(|_| DispatchError::validation("Invalid message format."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::presence::{MemoryPresence, PresenceStore};
    use crate::provider::HttpProvider;
    use crate::pubsub::{MemoryPubSub, PubSub};
    use crate::store::{BookingType, MemoryStore, NewBooking, Store, User};
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tokio::time::timeout;
    use uuid::Uuid;

    struct Fixture {
        ctx: Arc<Dispatch>,
        store: Arc<MemoryStore>,
        presence: Arc<MemoryPresence>,
        passenger: Identity,
        driver: Identity,
    }

    fn identity(store: &MemoryStore, role: Role) -> Identity {
        let identity = Identity {
            user_id: Uuid::new_v4(),
            email: format!("{role}-{}@example.com", Uuid::new_v4().simple()),
            role,
        };
        store.insert_user(User {
            id: identity.user_id,
            email: identity.email.clone(),
            fullname: "Test".to_string(),
            role,
            is_active: true,
        });
        identity
    }

    fn fixture() -> Fixture {
        let config = Config::from_lookup(|key| match key {
            "FLEETCAST_TOKEN_SECRET" => Some("token".to_string()),
            "FLEETCAST_WEBHOOK_SECRET" => Some("hook".to_string()),
            _ => None,
        })
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let presence = Arc::new(MemoryPresence::new());
        let bus = Arc::new(MemoryPubSub::new());
        let provider = Arc::new(
            HttpProvider::new("http://127.0.0.1:9".to_string(), "sk".to_string(), Duration::from_secs(1))
                .unwrap(),
        );
        let ctx = Arc::new(Dispatch::new(&config, store.clone(), presence.clone(), bus.clone(), provider));

        let hub = ctx.hub.clone();
        tokio::spawn(async move { bus.listen(hub).await });

        let passenger = identity(&store, Role::Passenger);
        let driver = identity(&store, Role::Driver);
        Fixture {
            ctx,
            store,
            presence,
            passenger,
            driver,
        }
    }

    async fn booking(f: &Fixture) -> BookingId {
        f.store
            .insert_booking(NewBooking {
                passenger_id: f.passenger.user_id,
                driver_id: f.driver.user_id,
                booking_type: BookingType::Ride,
                origin: "A".to_string(),
                destination: "B".to_string(),
                price: dec!(1000),
                package_details: None,
                payment_reference: Uuid::new_v4().to_string(),
            })
            .await
            .unwrap()
            .id
    }

    async fn next_frame(rx: &mut mpsc::Receiver<Vec<u8>>) -> ServerFrame {
        let payload = timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("frame within a second")
            .expect("outbox open");
        serde_json::from_slice(&payload).unwrap()
    }

    #[tokio::test]
    async fn test_location_route_is_driver_only() {
        let f = fixture();
        let result = Session::open(f.ctx.clone(), f.passenger.clone(), Route::DriverLocation).await;
        assert!(matches!(result, Err(DispatchError::Authorization(_))));
        assert_eq!(f.ctx.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_driver_presence_cleared_on_close() {
        let f = fixture();
        let opened = Session::open(f.ctx.clone(), f.driver.clone(), Route::DriverLocation)
            .await
            .unwrap();
        assert!(f.presence.is_online(f.driver.user_id).await.unwrap());

        opened
            .session
            .handle_text(r#"{"latitude": 6.45, "longitude": 3.39}"#)
            .await;
        assert!(f.presence.location(f.driver.user_id).await.unwrap().is_some());

        opened.session.close().await;
        assert!(!f.presence.is_online(f.driver.user_id).await.unwrap());
        assert!(f.presence.location(f.driver.user_id).await.unwrap().is_none());
        assert_eq!(f.ctx.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_frame_gets_error_reply() {
        let f = fixture();
        let Opened { session, mut outbox, .. } =
            Session::open(f.ctx.clone(), f.driver.clone(), Route::DriverLocation)
                .await
                .unwrap();

        session.handle_text("not json").await;
        assert_eq!(next_frame(&mut outbox).await, ServerFrame::error("Invalid message format."));

        session.handle_text(r#"{"latitude": 91, "longitude": 0}"#).await;
        assert!(matches!(next_frame(&mut outbox).await, ServerFrame::Error { .. }));
        session.close().await;
    }

    #[tokio::test]
    async fn test_tracking_requires_party_and_marks_active() {
        let f = fixture();
        let id = booking(&f).await;
        let outsider = identity(&f.store, Role::Passenger);

        assert!(matches!(
            Session::open(f.ctx.clone(), outsider, Route::Tracking(id)).await,
            Err(DispatchError::Authorization(_))
        ));
        assert!(matches!(
            Session::open(f.ctx.clone(), f.passenger.clone(), Route::Tracking(9_999)).await,
            Err(DispatchError::NotFound(_))
        ));

        let opened = Session::open(f.ctx.clone(), f.passenger.clone(), Route::Tracking(id))
            .await
            .unwrap();
        assert_eq!(f.presence.active_bookings().await.unwrap(), vec![id]);

        opened.session.close().await;
        assert!(f.presence.active_bookings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_closing_chat_keeps_tracking_active() {
        let f = fixture();
        let id = booking(&f).await;

        let tracking = Session::open(f.ctx.clone(), f.passenger.clone(), Route::Tracking(id))
            .await
            .unwrap();
        let chat = Session::open(f.ctx.clone(), f.passenger.clone(), Route::RideChat(id))
            .await
            .unwrap();

        chat.session.close().await;
        assert_eq!(f.presence.active_bookings().await.unwrap(), vec![id]);

        tracking.session.close().await;
        assert!(f.presence.active_bookings().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_location_socket_keeps_driver_online() {
        let f = fixture();
        let first = Session::open(f.ctx.clone(), f.driver.clone(), Route::DriverLocation)
            .await
            .unwrap();
        let second = Session::open(f.ctx.clone(), f.driver.clone(), Route::DriverLocation)
            .await
            .unwrap();

        first.session.close().await;
        assert!(f.presence.is_online(f.driver.user_id).await.unwrap());

        second.session.close().await;
        assert!(!f.presence.is_online(f.driver.user_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_ride_chat_replays_and_fans_out() {
        let f = fixture();
        let id = booking(&f).await;
        f.store
            .append_booking_message(id, &f.passenger, "hello".to_string())
            .await
            .unwrap();

        let Opened { session: driver, mut outbox, greeting } =
            Session::open(f.ctx.clone(), f.driver.clone(), Route::RideChat(id))
                .await
                .unwrap();
        assert!(matches!(&greeting[..], [ServerFrame::ChatMessage(m)] if m.message == "hello"));

        driver.handle_text(r#"{"message": "arriving"}"#).await;
        let frame = next_frame(&mut outbox).await;
        assert!(matches!(frame, ServerFrame::ChatMessage(m) if m.message == "arriving"));
        driver.close().await;
    }

    #[tokio::test]
    async fn test_support_first_contact_greets_with_ticket() {
        let f = fixture();
        let opened = Session::open(f.ctx.clone(), f.passenger.clone(), Route::Support(None))
            .await
            .unwrap();

        let ticket_id = match opened.greeting.as_slice() {
            [ServerFrame::TicketCreated { ticket_id }] => *ticket_id,
            other => panic!("expected ticket_created greeting, got {other:?}"),
        };
        assert_eq!(opened.session.route(), Route::Support(Some(ticket_id)));
        opened.session.close().await;

        // Closing a staff session keeps the assignment
        let staff = identity(&f.store, Role::Staff);
        let agent = Session::open(f.ctx.clone(), staff.clone(), Route::Support(Some(ticket_id)))
            .await
            .unwrap();
        agent.session.close().await;
        let ticket = f.store.ticket(ticket_id).await.unwrap().unwrap();
        assert_eq!(ticket.assigned_staff, Some(staff.user_id));
    }

    #[tokio::test]
    async fn test_notifications_route_receives_own_notices() {
        let f = fixture();
        let Opened { session, mut outbox, .. } =
            Session::open(f.ctx.clone(), f.passenger.clone(), Route::Notifications)
                .await
                .unwrap();

        let frame = ServerFrame::error("ping");
        f.ctx
            .bus
            .publish(&notification_group(f.passenger.user_id), &frame.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(next_frame(&mut outbox).await, frame);

        session.handle_text("{}").await;
        assert!(matches!(next_frame(&mut outbox).await, ServerFrame::Error { .. }));
        session.close().await;
    }
}

//! Connection gateway
//!
//! Authenticates the `token` query parameter before upgrading, so an
//! unauthenticated caller never gets a socket. Route authorization runs
//! after the upgrade; a rejected route is closed with a policy-violation
//! close frame and no data frame, except for support assignment conflicts,
//! which explain themselves first.

use std::sync::Arc;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade, close_code};
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::auth::Identity;
use crate::dispatch::Dispatch;
use crate::error::DispatchError;
use crate::protocol::ServerFrame;
use crate::session::{Opened, Route, Session};
use crate::store::{BookingId, TicketId};

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    token: Option<String>,
}

/// WebSocket routes
pub fn routes() -> Router<Arc<Dispatch>> {
    Router::new()
        .route("/ws/location", get(location))
        .route("/ws/bookings/{id}/track", get(tracking))
        .route("/ws/bookings/{id}/chat", get(ride_chat))
        .route("/ws/support", get(new_ticket))
        .route("/ws/support/{ticket_id}", get(support))
        .route("/ws/notifications", get(notifications))
}

async fn location(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::DriverLocation).await
}

async fn tracking(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Path(id): Path<BookingId>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::Tracking(id)).await
}

async fn ride_chat(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Path(id): Path<BookingId>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::RideChat(id)).await
}

async fn new_ticket(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::Support(None)).await
}

async fn support(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Path(ticket_id): Path<TicketId>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::Support(Some(ticket_id))).await
}

async fn notifications(
    ws: WebSocketUpgrade,
    State(ctx): State<Arc<Dispatch>>,
    Query(params): Query<ConnectParams>,
) -> Response {
    connect(ws, ctx, params, Route::Notifications).await
}

async fn connect(ws: WebSocketUpgrade, ctx: Arc<Dispatch>, params: ConnectParams, route: Route) -> Response {
    let identity = match ctx.auth.authenticate(params.token.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => {
            debug!(?route, error = %e, "connection refused");
            // Status only; nothing about the credential is echoed
            return e.status_code().into_response();
        }
    };

    ws.on_upgrade(move |socket| run(socket, ctx, identity, route))
}

type Sink = SplitSink<WebSocket, Message>;

async fn run(socket: WebSocket, ctx: Arc<Dispatch>, identity: Identity, route: Route) {
    let (mut sink, mut stream) = socket.split();

    let Opened {
        session,
        mut outbox,
        greeting,
    } = match Session::open(ctx, identity, route).await {
        Ok(opened) => opened,
        Err(e) => {
            debug!(?route, error = %e, "route rejected");
            if matches!(e, DispatchError::Conflict(_)) {
                let _ = send_frame(&mut sink, &ServerFrame::error(e.to_string())).await;
            }
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::POLICY,
                    reason: "rejected".into(),
                })))
                .await;
            return;
        }
    };
    let conn_id = session.conn_id();

    for frame in &greeting {
        if send_frame(&mut sink, frame).await.is_err() {
            session.close().await;
            return;
        }
    }

    let writer = tokio::spawn(async move {
        while let Some(payload) = outbox.recv().await {
            let Ok(text) = String::from_utf8(payload) else {
                warn!(conn_id, "dropping non-utf8 frame");
                continue;
            };
            if sink.send(Message::text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn_id, error = %e, "socket read failed");
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
}

async fn send_frame(sink: &mut Sink, frame: &ServerFrame) -> Result<(), axum::Error> {
    match serde_json::to_string(frame) {
        Ok(text) => sink.send(Message::text(text)).await,
        Err(e) => {
            warn!(error = %e, "failed to encode frame");
            Ok(())
        }
    }
}

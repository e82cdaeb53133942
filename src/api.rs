//! HTTP surface: booking and wallet commands, provider webhooks, health
//!
//! Commands authenticate with `Authorization: Bearer <token>` through the
//! [`Caller`] extractor. Webhooks authenticate by signature and peer address
//! instead, and always answer with the two-state acknowledgement body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequest, FromRequestParts, Path, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::auth::{Authenticator, Identity};
use crate::dispatch::Dispatch;
use crate::error::DispatchError;
use crate::gateway;
use crate::lifecycle::CreateBooking;
use crate::provider::TransferInstruction;
use crate::store::{BookingId, BookingStatus, TicketId};
use crate::wallet::CallbackOutcome;

/// Header carrying the provider's callback signature
pub const SIGNATURE_HEADER: &str = "x-paystack-signature";

/// Full application router: commands, webhooks and WebSocket routes
pub fn router(ctx: Arc<Dispatch>) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/drivers/available", get(available_drivers))
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/{id}/status", patch(update_status))
        .route("/bookings/{id}/cash", post(record_cash))
        .route("/bookings/{id}/dispute", post(mark_disputed))
        .route("/dispute/resolve", post(resolve_dispute))
        .route("/dispute/approve", post(approve_dispute))
        .route("/withdrawals", get(list_withdrawals).post(request_withdrawal))
        .route("/disbursements", post(initiate_disbursement))
        .route("/disbursements/{reference}/authorize", post(authorize_disbursement))
        .route("/disbursements/{reference}/resend-code", post(resend_disbursement_code))
        .route("/support/tickets/unassigned", get(unassigned_tickets))
        .route("/support/tickets/{id}/close", post(close_ticket))
        .route("/webhooks/transactions", post(transaction_webhook))
        .route("/webhooks/disbursements", post(disbursement_webhook))
        .merge(gateway::routes())
        .with_state(ctx)
}

/// Authenticated caller of a command
pub struct Caller(pub Identity);

impl FromRequestParts<Arc<Dispatch>> for Caller {
    type Rejection = DispatchError;

    async fn from_request_parts(parts: &mut Parts, ctx: &Arc<Dispatch>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        ctx.auth.authenticate(Authenticator::bearer(header)).await.map(Caller)
    }
}

/// JSON command body; malformed input is a validation error like any other
pub struct Payload<T>(pub T);

impl<T, S> FromRequest<S> for Payload<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = DispatchError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Payload(value)),
            Err(rejection) => Err(DispatchError::validation(rejection.body_text())),
        }
    }
}

type ApiResult<T> = Result<T, DispatchError>;

async fn health(State(ctx): State<Arc<Dispatch>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "connections": ctx.hub.connection_count(),
        "groups": ctx.hub.group_count(),
    }))
}

async fn available_drivers(State(ctx): State<Arc<Dispatch>>, Caller(_): Caller) -> ApiResult<Response> {
    Ok(Json(ctx.bookings.available_drivers().await?).into_response())
}

async fn create_booking(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Payload(command): Payload<CreateBooking>,
) -> ApiResult<Response> {
    let booking = ctx.bookings.create_booking(&caller, command).await?;
    Ok((StatusCode::CREATED, Json(booking)).into_response())
}

async fn list_bookings(State(ctx): State<Arc<Dispatch>>, Caller(caller): Caller) -> ApiResult<Response> {
    Ok(Json(ctx.bookings.list_bookings(&caller).await?).into_response())
}

#[derive(Debug, Deserialize)]
struct StatusUpdate {
    status: BookingStatus,
}

async fn update_status(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(id): Path<BookingId>,
    Payload(update): Payload<StatusUpdate>,
) -> ApiResult<Response> {
    let ack = ctx.bookings.update_status(&caller, id, update.status).await?;
    Ok(Json(ack).into_response())
}

#[derive(Debug, Deserialize)]
struct CashPayment {
    amount: Decimal,
}

async fn record_cash(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(id): Path<BookingId>,
    Payload(payment): Payload<CashPayment>,
) -> ApiResult<Response> {
    let outcome = ctx.wallet.record_cash(&caller, id, payment.amount).await?;
    Ok(Json(outcome).into_response())
}

#[derive(Debug, Default, Deserialize)]
struct DisputeRequest {
    #[serde(default)]
    reason: Option<String>,
}

async fn mark_disputed(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(id): Path<BookingId>,
    Payload(request): Payload<DisputeRequest>,
) -> ApiResult<Response> {
    let booking = ctx.bookings.mark_disputed(&caller, id, request.reason).await?;
    Ok(Json(booking).into_response())
}

#[derive(Debug, Deserialize)]
struct DisputeResolution {
    booking_id: BookingId,
    #[serde(default)]
    resolution: String,
}

async fn resolve_dispute(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Payload(request): Payload<DisputeResolution>,
) -> ApiResult<Response> {
    let booking = ctx
        .bookings
        .resolve_dispute(&caller, request.booking_id, request.resolution)
        .await?;
    Ok(Json(booking).into_response())
}

#[derive(Debug, Deserialize)]
struct DisputeApproval {
    booking_id: BookingId,
}

async fn approve_dispute(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Payload(request): Payload<DisputeApproval>,
) -> ApiResult<Response> {
    let booking = ctx.bookings.approve_dispute(&caller, request.booking_id).await?;
    Ok(Json(booking).into_response())
}

async fn list_withdrawals(State(ctx): State<Arc<Dispatch>>, Caller(caller): Caller) -> ApiResult<Response> {
    Ok(Json(ctx.wallet.list_withdrawals(&caller).await?).into_response())
}

#[derive(Debug, Deserialize)]
struct WithdrawalAmount {
    amount: Decimal,
}

async fn request_withdrawal(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Payload(request): Payload<WithdrawalAmount>,
) -> ApiResult<Response> {
    let withdrawal = ctx.wallet.request_withdrawal(&caller, request.amount).await?;
    Ok((StatusCode::CREATED, Json(withdrawal)).into_response())
}

#[derive(Debug, Deserialize)]
struct DisbursementBatch {
    transfers: Vec<TransferInstruction>,
}

async fn initiate_disbursement(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Payload(batch): Payload<DisbursementBatch>,
) -> ApiResult<Response> {
    let receipt = ctx.wallet.initiate_disbursement(&caller, batch.transfers).await?;
    Ok(Json(receipt).into_response())
}

#[derive(Debug, Deserialize)]
struct AuthorizationCode {
    code: String,
}

async fn authorize_disbursement(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(reference): Path<String>,
    Payload(request): Payload<AuthorizationCode>,
) -> ApiResult<Response> {
    let receipt = ctx
        .wallet
        .authorize_disbursement(&caller, &reference, &request.code)
        .await?;
    Ok(Json(receipt).into_response())
}

async fn resend_disbursement_code(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(reference): Path<String>,
) -> ApiResult<Response> {
    let receipt = ctx.wallet.resend_disbursement_code(&caller, &reference).await?;
    Ok(Json(receipt).into_response())
}

async fn unassigned_tickets(State(ctx): State<Arc<Dispatch>>, Caller(caller): Caller) -> ApiResult<Response> {
    Ok(Json(ctx.support.unassigned(&caller).await?).into_response())
}

async fn close_ticket(
    State(ctx): State<Arc<Dispatch>>,
    Caller(caller): Caller,
    Path(id): Path<TicketId>,
) -> ApiResult<Response> {
    Ok(Json(ctx.support.close(&caller, id).await?).into_response())
}

fn signature(headers: &HeaderMap) -> Option<&str> {
    headers.get(SIGNATURE_HEADER).and_then(|value| value.to_str().ok())
}

async fn transaction_webhook(
    State(ctx): State<Arc<Dispatch>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = ctx
        .wallet
        .handle_transaction_callback(&body, signature(&headers), peer.ip())
        .await;
    acknowledge(result)
}

async fn disbursement_webhook(
    State(ctx): State<Arc<Dispatch>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = ctx
        .wallet
        .handle_disbursement_callback(&body, signature(&headers), peer.ip())
        .await;
    acknowledge(result)
}

/// Two-state acknowledgement; business-level misses still answer `success`
fn acknowledge(result: Result<CallbackOutcome, DispatchError>) -> Response {
    let failed = Json(json!({ "status": "failed" }));
    match result {
        Ok(outcome) => {
            debug!(?outcome, "callback processed");
            (StatusCode::OK, Json(json!({ "status": "success" }))).into_response()
        }
        Err(DispatchError::ExternalVerification) => (StatusCode::BAD_REQUEST, failed).into_response(),
        // Nothing was applied; let the provider redeliver
        Err(DispatchError::TransientStore(reason)) => {
            error!(%reason, "callback not applied, store unavailable");
            (StatusCode::SERVICE_UNAVAILABLE, failed).into_response()
        }
        Err(e) => {
            warn!(error = %e, "callback rejected by business rules");
            (StatusCode::OK, Json(json!({ "status": "success" }))).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Role;
    use crate::config::Config;
    use crate::presence::MemoryPresence;
    use crate::provider::HttpProvider;
    use crate::pubsub::MemoryPubSub;
    use crate::store::{MemoryStore, Store, User};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use rust_decimal_macros::dec;
    use std::time::Duration;
    use tower::ServiceExt;
    use uuid::Uuid;

    const PROVIDER: &str = "52.31.139.75:443";

    struct Fixture {
        ctx: Arc<Dispatch>,
        store: Arc<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let config = Config::from_lookup(|key| match key {
            "FLEETCAST_TOKEN_SECRET" => Some("token".to_string()),
            "FLEETCAST_WEBHOOK_SECRET" => Some("hook".to_string()),
            _ => None,
        })
        .unwrap();
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(
            HttpProvider::new("http://127.0.0.1:9".to_string(), "sk".to_string(), Duration::from_secs(1))
                .unwrap(),
        );
        let ctx = Arc::new(Dispatch::new(
            &config,
            store.clone(),
            Arc::new(MemoryPresence::new()),
            Arc::new(MemoryPubSub::new()),
            provider,
        ));
        Fixture { ctx, store }
    }

    fn user(f: &Fixture, role: Role) -> (Uuid, String) {
        let id = Uuid::new_v4();
        f.store.insert_user(User {
            id,
            email: format!("{role}-{}@example.com", id.simple()),
            fullname: "Test".to_string(),
            role,
            is_active: true,
        });
        let token = f.ctx.auth.verifier().issue(id, Duration::from_secs(60)).unwrap();
        (id, token)
    }

    fn json_request(method: &str, uri: &str, token: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .header("authorization", format!("Bearer {token}"))
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn webhook(uri: &str, body: &[u8], signature: &str, peer: &str) -> Request<Body> {
        let mut request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body.to_vec()))
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(peer.parse::<SocketAddr>().unwrap()));
        request
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let f = fixture();
        let response = router(f.ctx.clone())
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_malformed_body_is_structured_rejection() {
        let f = fixture();
        let (_, token) = user(&f, Role::Driver);

        let mut request = json_request("POST", "/withdrawals", &token, json!({}));
        *request.body_mut() = Body::from("{\"amount\": ");
        let response = router(f.ctx.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["detail"].is_string());

        let wrong_shape = json_request("POST", "/withdrawals", &token, json!({ "amount": "lots" }));
        let response = router(f.ctx.clone()).oneshot(wrong_shape).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(body_json(response).await["detail"].is_string());
    }

    #[tokio::test]
    async fn test_commands_require_bearer_token() {
        let f = fixture();
        let response = router(f.ctx.clone())
            .oneshot(Request::builder().uri("/bookings").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            body_json(response).await["detail"],
            "Authentication credentials were not provided or are invalid."
        );
    }

    #[tokio::test]
    async fn test_booking_flow_over_http() {
        let f = fixture();
        let (_, passenger) = user(&f, Role::Passenger);
        let (driver_id, driver) = user(&f, Role::Driver);

        let response = router(f.ctx.clone())
            .oneshot(json_request(
                "POST",
                "/bookings",
                &passenger,
                json!({
                    "driver_id": driver_id,
                    "booking_type": "ride",
                    "origin": "Yaba",
                    "destination": "Ikoyi",
                    "price": "1800"
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let id = body_json(response).await["id"].as_i64().unwrap();

        let response = router(f.ctx.clone())
            .oneshot(json_request(
                "PATCH",
                &format!("/bookings/{id}/status"),
                &driver,
                json!({"status": "accepted"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack = body_json(response).await;
        assert_eq!(ack["message"], "Booking accepted successfully.");
        assert_eq!(ack["booking"]["status"], "accepted");

        // Passengers cannot accept
        let response = router(f.ctx.clone())
            .oneshot(json_request(
                "PATCH",
                &format!("/bookings/{id}/status"),
                &passenger,
                json!({"status": "in_progress"}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_withdrawal_over_http() {
        let f = fixture();
        let (driver_id, driver) = user(&f, Role::Driver);
        f.store.set_wallet(driver_id, dec!(500));

        let response = router(f.ctx.clone())
            .oneshot(json_request("POST", "/withdrawals", &driver, json!({"amount": "200"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = router(f.ctx.clone())
            .oneshot(json_request("POST", "/withdrawals", &driver, json!({"amount": "900"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(f.store.withdrawals_for(driver_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_webhook_acknowledgements() {
        let f = fixture();
        let body = br#"{"event":"charge.success","data":{"reference":"unknown","status":"success","amount":100}}"#;
        let signature = f.ctx.wallet.verifier().sign(body).unwrap();

        // Unknown reference is a business miss, still acknowledged
        let response = router(f.ctx.clone())
            .oneshot(webhook("/webhooks/transactions", body, &signature, PROVIDER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "success");

        let response = router(f.ctx.clone())
            .oneshot(webhook("/webhooks/transactions", body, "deadbeef", PROVIDER))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["status"], "failed");

        let response = router(f.ctx.clone())
            .oneshot(webhook("/webhooks/disbursements", body, &signature, "10.1.2.3:443"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_staff_only_routes() {
        let f = fixture();
        let (_, passenger) = user(&f, Role::Passenger);
        let (_, staff) = user(&f, Role::Staff);

        let request = |token: &str| {
            Request::builder()
                .uri("/support/tickets/unassigned")
                .header("authorization", format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap()
        };

        let response = router(f.ctx.clone()).oneshot(request(&passenger)).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = router(f.ctx.clone()).oneshot(request(&staff)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!([]));
    }
}

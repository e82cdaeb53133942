//! Error taxonomy shared by the gateway, the engines and the HTTP surface.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::auth::AuthError;
use crate::provider::ProviderError;
use crate::store::StoreError;

/// Every rejection a command, callback or connection can produce.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Bad, expired or missing credential
    #[error("authentication failed: {0}")]
    Authentication(#[from] AuthError),
    /// Valid caller, wrong role or not a party to the resource
    #[error("{0}")]
    Authorization(String),
    /// Malformed command payload
    #[error("{0}")]
    Validation(String),
    /// Referenced booking, ticket or withdrawal is absent
    #[error("{0}")]
    NotFound(String),
    /// Transition or assignment not legal from the current state
    #[error("{0}")]
    Conflict(String),
    /// Webhook signature or origin mismatch
    #[error("callback verification failed")]
    ExternalVerification,
    /// Backing store unavailable
    #[error("store unavailable: {0}")]
    TransientStore(String),
    /// Payment provider rejected or failed a disbursement call
    #[error("payment provider error: {0}")]
    Provider(#[from] ProviderError),
}

impl DispatchError {
    pub fn authorization(reason: impl Into<String>) -> Self {
        Self::Authorization(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn not_found(reason: impl Into<String>) -> Self {
        Self::NotFound(reason.into())
    }

    pub fn conflict(reason: impl Into<String>) -> Self {
        Self::Conflict(reason.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization(_) => StatusCode::FORBIDDEN,
            // Illegal transitions answer 400, like every other rejected status update
            Self::Validation(_) | Self::Conflict(_) | Self::ExternalVerification => {
                StatusCode::BAD_REQUEST
            }
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::TransientStore(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Provider(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id} not found")),
            StoreError::InsufficientBalance { .. } => {
                Self::Validation("Insufficient wallet balance.".to_string())
            }
            StoreError::Duplicate(what) => Self::Conflict(format!("{what} already exists")),
            StoreError::Unavailable(reason) => Self::TransientStore(reason),
        }
    }
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Authentication failures never echo token details
        let detail = match &self {
            Self::Authentication(_) => "Authentication credentials were not provided or are invalid.".to_string(),
            other => other.to_string(),
        };
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

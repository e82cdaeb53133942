//! Bearer token verification and caller identity
//!
//! Tokens are HS256 JWTs carrying a `user_id` subject and an `exp` expiry.
//! A verified token is resolved against the user directory to produce an
//! [`Identity`] with a closed [`Role`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::DispatchError;
use crate::store::Store;

/// The three sides of the marketplace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Passenger,
    Driver,
    Staff,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Passenger => "passenger",
            Role::Driver => "driver",
            Role::Staff => "staff",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// JWT claims
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub user_id: Uuid,
    pub exp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

/// An authenticated caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub email: String,
    pub role: Role,
}

/// Token errors
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("credential expired")]
    Expired,
    #[error("invalid credential: {0}")]
    Invalid(String),
    #[error("unknown or inactive user")]
    UnknownUser,
}

/// HS256 token verifier
pub struct TokenVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Verify signature and expiry, returning the claims
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;

        if let Some(kind) = &data.claims.token_type
            && kind != "access"
        {
            return Err(AuthError::Invalid(format!("unexpected token type {kind}")));
        }

        Ok(data.claims)
    }

    /// Issue an access token for a user
    pub fn issue(&self, user_id: Uuid, ttl: Duration) -> Result<String, AuthError> {
        let exp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|e| AuthError::Invalid(e.to_string()))?
            .saturating_add(ttl)
            .as_secs();
        self.issue_claims(&Claims {
            user_id,
            exp,
            token_type: Some("access".to_string()),
        })
    }

    pub fn issue_claims(&self, claims: &Claims) -> Result<String, AuthError> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Invalid(e.to_string()))
    }
}

/// Resolves bearer tokens to identities through the user directory
pub struct Authenticator {
    verifier: TokenVerifier,
    store: Arc<dyn Store>,
}

impl Authenticator {
    pub fn new(verifier: TokenVerifier, store: Arc<dyn Store>) -> Self {
        Self { verifier, store }
    }

    pub fn verifier(&self) -> &TokenVerifier {
        &self.verifier
    }

    /// Verify a token and load the caller's directory entry
    pub async fn authenticate(&self, token: Option<&str>) -> Result<Identity, DispatchError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::Missing)?;
        let claims = self.verifier.verify(token)?;

        let user = self
            .store
            .user(claims.user_id)
            .await?
            .filter(|user| user.is_active)
            .ok_or(AuthError::UnknownUser)?;

        debug!(user_id = %user.id, role = %user.role, "caller authenticated");
        Ok(Identity {
            user_id: user.id,
            email: user.email,
            role: user.role,
        })
    }

    /// Extract the token from an `Authorization: Bearer <token>` header value
    pub fn bearer(header: Option<&str>) -> Option<&str> {
        let value = header?.trim();
        let (scheme, token) = value.split_once(' ')?;
        scheme.eq_ignore_ascii_case("bearer").then_some(token.trim())
    }
}

//! Payment provider client for disbursement batches
//!
//! A disbursement batch is a three step saga held entirely by the provider:
//! initiate the batch, authorize it with the one-time code the provider
//! sends out-of-band, and optionally ask for that code again. Nothing about
//! a batch is persisted locally.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, instrument};

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("malformed provider response: {0}")]
    MalformedResponse(String),
    #[error("amount {0} cannot be expressed in minor units")]
    InvalidAmount(Decimal),
}

/// One payout inside a disbursement batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInstruction {
    pub amount: Decimal,
    /// Provider recipient code
    pub recipient: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Provider acknowledgement of a saga step
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReceipt {
    pub reference: String,
    pub message: String,
}

#[async_trait]
pub trait DisbursementProvider: Send + Sync {
    async fn initiate_batch(
        &self,
        transfers: &[TransferInstruction],
    ) -> Result<BatchReceipt, ProviderError>;
    async fn authorize_batch(&self, reference: &str, code: &str) -> Result<BatchReceipt, ProviderError>;
    async fn resend_code(&self, reference: &str) -> Result<BatchReceipt, ProviderError>;
}

/// Provider response envelope
#[derive(Debug, Deserialize)]
struct Envelope {
    status: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Value,
}

/// Convert a major-unit amount to the provider's minor units
pub fn to_minor_units(amount: Decimal) -> Result<i64, ProviderError> {
    (amount * Decimal::ONE_HUNDRED)
        .round()
        .to_i64()
        .filter(|minor| *minor > 0)
        .ok_or(ProviderError::InvalidAmount(amount))
}

/// Convert the provider's minor units to a major-unit amount
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

/// Paystack-compatible HTTP client
#[derive(Clone)]
pub struct HttpProvider {
    http: Client,
    url: String,
    secret: String,
}

impl HttpProvider {
    pub fn new(url: String, secret: String, timeout: Duration) -> Result<Self, ProviderError> {
        let http = Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            http,
            url: url.trim_end_matches('/').to_string(),
            secret,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Envelope, ProviderError> {
        let url = format!("{}{}", self.url, path);
        let resp = self
            .http
            .post(&url)
            .bearer_auth(&self.secret)
            .json(body)
            .send()
            .await?;

        let http_status = resp.status();
        let envelope: Envelope = resp.json().await?;
        if !http_status.is_success() || !envelope.status {
            return Err(ProviderError::Rejected(envelope.message));
        }
        Ok(envelope)
    }
}

fn bulk_body(transfers: &[TransferInstruction]) -> Result<Value, ProviderError> {
    let transfers = transfers
        .iter()
        .map(|t| {
            Ok(json!({
                "amount": to_minor_units(t.amount)?,
                "recipient": t.recipient,
                "reference": t.reference,
                "reason": t.reason,
            }))
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;

    Ok(json!({
        "currency": "NGN",
        "source": "balance",
        "transfers": transfers,
    }))
}

/// The provider reports the batch handle either on the object or on its first transfer
fn batch_reference(data: &Value) -> Option<String> {
    data.get("transfer_code")
        .or_else(|| {
            data.as_array()
                .and_then(|transfers| transfers.first())
                .and_then(|first| first.get("transfer_code"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl DisbursementProvider for HttpProvider {
    #[instrument(skip(self, transfers), fields(count = transfers.len()), level = "debug")]
    async fn initiate_batch(
        &self,
        transfers: &[TransferInstruction],
    ) -> Result<BatchReceipt, ProviderError> {
        let envelope = self.post("/transfer/bulk", &bulk_body(transfers)?).await?;
        let reference = batch_reference(&envelope.data)
            .ok_or_else(|| ProviderError::MalformedResponse("missing transfer_code".into()))?;

        debug!(%reference, "disbursement batch initiated");
        Ok(BatchReceipt {
            reference,
            message: envelope.message,
        })
    }

    #[instrument(skip(self, code), level = "debug")]
    async fn authorize_batch(&self, reference: &str, code: &str) -> Result<BatchReceipt, ProviderError> {
        let body = json!({ "transfer_code": reference, "otp": code });
        let envelope = self.post("/transfer/finalize_transfer", &body).await?;
        Ok(BatchReceipt {
            reference: reference.to_string(),
            message: envelope.message,
        })
    }

    #[instrument(skip(self), level = "debug")]
    async fn resend_code(&self, reference: &str) -> Result<BatchReceipt, ProviderError> {
        let body = json!({ "transfer_code": reference, "reason": "transfer" });
        let envelope = self.post("/transfer/resend_otp", &body).await?;
        Ok(BatchReceipt {
            reference: reference.to_string(),
            message: envelope.message,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(1500.50)).unwrap(), 150_050);
        assert_eq!(from_minor_units(150_050), dec!(1500.50));
        assert!(to_minor_units(dec!(0)).is_err());
        assert!(to_minor_units(dec!(-3)).is_err());
    }

    #[test]
    fn test_bulk_body_shape() {
        let body = bulk_body(&[TransferInstruction {
            amount: dec!(200),
            recipient: "RCP_abc".to_string(),
            reference: Some("wd_1".to_string()),
            reason: None,
        }])
        .unwrap();

        assert_eq!(body["source"], "balance");
        assert_eq!(body["transfers"][0]["amount"], 20_000);
        assert_eq!(body["transfers"][0]["recipient"], "RCP_abc");
    }

    #[test]
    fn test_batch_reference_locations() {
        assert_eq!(
            batch_reference(&json!({"transfer_code": "TRF_1"})).as_deref(),
            Some("TRF_1")
        );
        assert_eq!(
            batch_reference(&json!([{"transfer_code": "TRF_2"}])).as_deref(),
            Some("TRF_2")
        );
        assert_eq!(batch_reference(&json!({})), None);
    }

    #[test]
    fn test_envelope_parses_failure() {
        let envelope: Envelope =
            serde_json::from_str(r#"{"status": false, "message": "Invalid OTP"}"#).unwrap();
        assert!(!envelope.status);
        assert_eq!(envelope.message, "Invalid OTP");
        assert!(envelope.data.is_null());
    }
}

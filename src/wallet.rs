//! Wallet reconciliation engine
//!
//! Provider callbacks are verified before anything else runs, then applied
//! idempotently: the target row's own `paid` or `completed` flag decides
//! whether a delivery has already been applied, so at-least-once delivery
//! never double-credits a wallet.
//!
//! Cash reconciliation: a driver's self-report is advisory and only recorded.
//! The passenger's confirmation is authoritative and debits the platform
//! commission from the driver's wallet.

use std::net::IpAddr;
use std::sync::Arc;

use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sha2::Sha512;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, Role};
use crate::error::DispatchError;
use crate::lifecycle::require_staff;
use crate::protocol::{Notification, NotificationEvent, ServerFrame};
use crate::provider::{BatchReceipt, DisbursementProvider, TransferInstruction, from_minor_units};
use crate::pubsub::{PubSub, notification_group, publish_frame};
use crate::store::{
    Booking, BookingId, BookingStatus, Settlement, Store, WithdrawalRequest, WithdrawalSettlement,
};

type HmacSha512 = Hmac<Sha512>;

/// Verifies provider callbacks by signature and sender address
pub struct CallbackVerifier {
    secret: Vec<u8>,
    allowlist: Vec<IpAddr>,
}

impl CallbackVerifier {
    pub fn new(secret: &str, allowlist: Vec<IpAddr>) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            allowlist,
        }
    }

    /// Check the hex HMAC-SHA512 of `raw` and the sender's address
    pub fn verify(&self, raw: &[u8], signature: Option<&str>, sender: IpAddr) -> bool {
        let sender = sender.to_canonical();
        if !self.allowlist.iter().any(|allowed| allowed.to_canonical() == sender) {
            debug!(%sender, "callback sender not allow-listed");
            return false;
        }

        let Some(signature) = signature else {
            return false;
        };
        let Ok(provided) = hex::decode(signature.trim()) else {
            return false;
        };

        let Some(expected) = self.digest(raw) else {
            return false;
        };
        expected.as_slice().ct_eq(&provided).into()
    }

    /// Hex signature the provider would send for `raw`
    pub fn sign(&self, raw: &[u8]) -> Option<String> {
        self.digest(raw).map(hex::encode)
    }

    fn digest(&self, raw: &[u8]) -> Option<Vec<u8>> {
        let mut mac = HmacSha512::new_from_slice(&self.secret).ok()?;
        mac.update(raw);
        Some(mac.finalize().into_bytes().to_vec())
    }
}

/// Driver's share of an amount after the platform cut, to the minor unit
pub fn driver_share(amount: Decimal, platform_cut: Decimal) -> Decimal {
    (amount * (Decimal::ONE - platform_cut)).round_dp(2)
}

/// Platform's share of an amount, to the minor unit
pub fn platform_commission(amount: Decimal, platform_cut: Decimal) -> Decimal {
    (amount * platform_cut).round_dp(2)
}

#[derive(Debug, Deserialize)]
struct CallbackEvent {
    event: String,
    data: CallbackData,
}

#[derive(Debug, Deserialize)]
struct CallbackData {
    reference: String,
    #[serde(default)]
    status: Option<String>,
    /// Minor units
    #[serde(default)]
    amount: Option<i64>,
}

/// Business result of a verified callback
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    Credited {
        booking_id: BookingId,
        amount: Decimal,
        balance: Decimal,
    },
    AlreadyPaid {
        booking_id: BookingId,
    },
    WithdrawalSettled {
        reference: String,
        balance: Decimal,
    },
    AlreadySettled {
        reference: String,
    },
    UnknownReference(String),
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CashOutcome {
    /// Driver self-report, recorded and awaiting passenger confirmation
    Reported { booking: Booking },
    /// Passenger confirmation, commission debited
    Confirmed {
        booking: Booking,
        commission: Decimal,
        balance: Decimal,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct WalletSummary {
    pub balance: Decimal,
    pub withdrawals: Vec<WithdrawalRequest>,
}

pub struct WalletEngine {
    store: Arc<dyn Store>,
    bus: Arc<dyn PubSub>,
    provider: Arc<dyn DisbursementProvider>,
    verifier: CallbackVerifier,
    platform_cut: Decimal,
}

impl WalletEngine {
    pub fn new(
        store: Arc<dyn Store>,
        bus: Arc<dyn PubSub>,
        provider: Arc<dyn DisbursementProvider>,
        verifier: CallbackVerifier,
        platform_cut: Decimal,
    ) -> Self {
        Self {
            store,
            bus,
            provider,
            verifier,
            platform_cut,
        }
    }

    pub fn verifier(&self) -> &CallbackVerifier {
        &self.verifier
    }

    fn parse(&self, raw: &[u8], signature: Option<&str>, sender: IpAddr) -> Result<Option<CallbackEvent>, DispatchError> {
        if !self.verifier.verify(raw, signature, sender) {
            warn!(%sender, "rejected provider callback");
            return Err(DispatchError::ExternalVerification);
        }

        match serde_json::from_slice(raw) {
            Ok(event) => Ok(Some(event)),
            Err(e) => {
                warn!(error = %e, "unparsable provider callback");
                Ok(None)
            }
        }
    }

    /// Apply a payment-received callback
    pub async fn handle_transaction_callback(
        &self,
        raw: &[u8],
        signature: Option<&str>,
        sender: IpAddr,
    ) -> Result<CallbackOutcome, DispatchError> {
        let Some(event) = self.parse(raw, signature, sender)? else {
            return Ok(CallbackOutcome::Ignored("malformed payload".into()));
        };

        let succeeded = event.data.status.as_deref().is_none_or(|s| s == "success");
        if event.event != "charge.success" || !succeeded {
            debug!(event = %event.event, reference = %event.data.reference, "ignoring transaction event");
            return Ok(CallbackOutcome::Ignored(event.event));
        }
        let Some(minor) = event.data.amount else {
            return Ok(CallbackOutcome::Ignored("missing amount".into()));
        };

        let reference = event.data.reference;
        let Some(booking) = self.store.booking_by_reference(&reference).await? else {
            warn!(%reference, "transaction callback for unknown booking");
            return Ok(CallbackOutcome::UnknownReference(reference));
        };

        let amount = from_minor_units(minor);
        let share = driver_share(amount, self.platform_cut);

        match self.store.settle_booking(booking.id, share).await? {
            Settlement::AlreadyPaid => {
                info!(booking_id = booking.id, %reference, "duplicate payment callback ignored");
                Ok(CallbackOutcome::AlreadyPaid {
                    booking_id: booking.id,
                })
            }
            Settlement::Applied { booking, balance } => {
                info!(
                    booking_id = booking.id,
                    driver_id = %booking.driver_id,
                    %reference,
                    %share,
                    %balance,
                    "driver wallet credited"
                );
                self.notify(
                    booking.driver_id,
                    Notification::new(
                        NotificationEvent::PaymentReceived,
                        Some(booking.id),
                        format!("Payment received. {share} has been credited to your wallet."),
                    ),
                )
                .await;
                Ok(CallbackOutcome::Credited {
                    booking_id: booking.id,
                    amount: share,
                    balance,
                })
            }
        }
    }

    /// Apply a withdrawal-settled callback
    pub async fn handle_disbursement_callback(
        &self,
        raw: &[u8],
        signature: Option<&str>,
        sender: IpAddr,
    ) -> Result<CallbackOutcome, DispatchError> {
        let Some(event) = self.parse(raw, signature, sender)? else {
            return Ok(CallbackOutcome::Ignored("malformed payload".into()));
        };

        if event.event != "transfer.success" {
            debug!(event = %event.event, reference = %event.data.reference, "ignoring transfer event");
            return Ok(CallbackOutcome::Ignored(event.event));
        }
        let Some(minor) = event.data.amount else {
            return Ok(CallbackOutcome::Ignored("missing amount".into()));
        };

        let reference = event.data.reference;
        let amount = from_minor_units(minor);

        match self.store.settle_withdrawal(&reference, amount).await? {
            None => {
                warn!(%reference, "disbursement callback for unknown withdrawal");
                Ok(CallbackOutcome::UnknownReference(reference))
            }
            Some(WithdrawalSettlement::AlreadyCompleted) => {
                info!(%reference, "duplicate disbursement callback ignored");
                Ok(CallbackOutcome::AlreadySettled { reference })
            }
            Some(WithdrawalSettlement::Applied { request, balance }) => {
                info!(driver_id = %request.driver_id, %reference, %amount, %balance, "withdrawal settled");
                self.notify(
                    request.driver_id,
                    Notification::new(
                        NotificationEvent::WithdrawalCompleted,
                        None,
                        format!("Your withdrawal of {amount} has been completed."),
                    ),
                )
                .await;
                Ok(CallbackOutcome::WithdrawalSettled { reference, balance })
            }
        }
    }

    /// Record a cash payment against a booking
    pub async fn record_cash(
        &self,
        caller: &Identity,
        booking_id: BookingId,
        amount: Decimal,
    ) -> Result<CashOutcome, DispatchError> {
        if amount <= Decimal::ZERO {
            return Err(DispatchError::validation("Amount must be greater than zero."));
        }

        let booking = self
            .store
            .booking(booking_id)
            .await?
            .ok_or_else(|| DispatchError::not_found("Booking not found."))?;
        let role = match booking.party_role(caller.user_id) {
            Some(role) if role == caller.role => role,
            _ => {
                return Err(DispatchError::authorization(
                    "You are not a party to this booking.",
                ));
            }
        };
        if matches!(booking.status, BookingStatus::Cancelled | BookingStatus::DisputeApproved) {
            return Err(DispatchError::conflict(format!(
                "Cannot record a payment for a {} booking.",
                booking.status
            )));
        }
        if booking.paid {
            return Err(DispatchError::conflict("This booking has already been paid."));
        }

        if role == Role::Driver {
            let booking = self.store.record_cash_report(booking_id, amount).await?;
            info!(booking_id, %amount, "driver reported cash payment");
            self.notify(
                booking.passenger_id,
                Notification::new(
                    NotificationEvent::CashReported,
                    Some(booking_id),
                    format!("Your driver reported a cash payment of {amount}. Please confirm."),
                ),
            )
            .await;
            return Ok(CashOutcome::Reported { booking });
        }

        let commission = platform_commission(amount, self.platform_cut);
        match self.store.settle_booking(booking_id, -commission).await? {
            Settlement::AlreadyPaid => Err(DispatchError::conflict("This booking has already been paid.")),
            Settlement::Applied { booking, balance } => {
                info!(
                    booking_id,
                    driver_id = %booking.driver_id,
                    %amount,
                    %commission,
                    %balance,
                    "cash payment confirmed, commission debited"
                );
                self.notify(
                    booking.driver_id,
                    Notification::new(
                        NotificationEvent::CashConfirmed,
                        Some(booking_id),
                        format!(
                            "Cash payment of {amount} confirmed. Commission of {commission} was debited from your wallet."
                        ),
                    ),
                )
                .await;
                Ok(CashOutcome::Confirmed {
                    booking,
                    commission,
                    balance,
                })
            }
        }
    }

    /// Request a payout of part of the driver's balance
    pub async fn request_withdrawal(
        &self,
        caller: &Identity,
        amount: Decimal,
    ) -> Result<WithdrawalRequest, DispatchError> {
        require_driver(caller)?;
        if amount <= Decimal::ZERO {
            return Err(DispatchError::validation("Amount must be greater than zero."));
        }

        let reference = format!("wd_{}", Uuid::new_v4().simple());
        let request = self
            .store
            .insert_withdrawal(caller.user_id, amount, &reference)
            .await?;
        info!(driver_id = %caller.user_id, %reference, %amount, "withdrawal requested");
        Ok(request)
    }

    /// The driver's balance and withdrawal history
    pub async fn list_withdrawals(&self, caller: &Identity) -> Result<WalletSummary, DispatchError> {
        require_driver(caller)?;
        Ok(WalletSummary {
            balance: self.store.wallet_balance(caller.user_id).await?,
            withdrawals: self.store.withdrawals_for(caller.user_id).await?,
        })
    }

    pub async fn initiate_disbursement(
        &self,
        caller: &Identity,
        transfers: Vec<TransferInstruction>,
    ) -> Result<BatchReceipt, DispatchError> {
        require_staff(caller)?;
        if transfers.is_empty() {
            return Err(DispatchError::validation("At least one transfer is required."));
        }
        if transfers.iter().any(|t| t.amount <= Decimal::ZERO || t.recipient.trim().is_empty()) {
            return Err(DispatchError::validation(
                "Every transfer needs a recipient and a positive amount.",
            ));
        }

        let receipt = self.provider.initiate_batch(&transfers).await?;
        info!(reference = %receipt.reference, count = transfers.len(), "disbursement batch initiated");
        Ok(receipt)
    }

    pub async fn authorize_disbursement(
        &self,
        caller: &Identity,
        reference: &str,
        code: &str,
    ) -> Result<BatchReceipt, DispatchError> {
        require_staff(caller)?;
        if code.trim().is_empty() {
            return Err(DispatchError::validation("An authorization code is required."));
        }

        let receipt = self.provider.authorize_batch(reference, code.trim()).await?;
        info!(%reference, "disbursement batch authorized");
        Ok(receipt)
    }

    pub async fn resend_disbursement_code(
        &self,
        caller: &Identity,
        reference: &str,
    ) -> Result<BatchReceipt, DispatchError> {
        require_staff(caller)?;
        let receipt = self.provider.resend_code(reference).await?;
        info!(%reference, "disbursement code resent");
        Ok(receipt)
    }

    async fn notify(&self, user_id: Uuid, notification: Notification) {
        let frame = ServerFrame::Notification(notification);
        publish_frame(self.bus.as_ref(), &notification_group(user_id), &frame).await;
    }
}

fn require_driver(caller: &Identity) -> Result<(), DispatchError> {
    if caller.role == Role::Driver {
        Ok(())
    } else {
        Err(DispatchError::authorization("Only drivers have a wallet."))
    }
}

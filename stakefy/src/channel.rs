//! Deposit-backed payment channels.
//!
//! A channel locks a deposit in an escrow address and then accepts any number of
//! off-chain payments against it. Each payment carries a nonce strictly greater than
//! the last accepted one and an ed25519 signature by the channel owner over
//! `(channel_id, amount, nonce)`. Settlement collapses every accepted payment into a
//! single ledger transaction: the withdrawn total goes to the merchant and the rest is
//! refunded to the owner.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::amount::{checked_total, validate_amount};
use crate::error::{RecordKind, SettlementError};
use crate::events::{EventKind, EventSink, NoopSink, WebhookEvent, notify, validate_webhook_url};
use crate::ledger::{Ledger, RetryPolicy, TransactionRef, TransferLeg, settlement_key};
use crate::lifecycle::{Observe, SettlementState, observe_record};
use crate::signature::{parse_public_key, verify_channel_payment};
use crate::store::{InMemoryStore, RecordStore, Step, mutate};
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};

/// Status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelStatus {
    /// Accepting payments.
    Open,
    /// Expired. No more payments, but it can still be settled.
    Closed,
    /// Funds moved on the ledger. Terminal.
    Settled,
}

impl ChannelStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Settled => "settled",
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An accepted off-chain payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPayment {
    /// Amount withdrawn by this payment.
    pub amount: Decimal,
    /// Nonce it carried.
    pub nonce: u64,
    /// Caller reference.
    pub reference: String,
    /// When it was accepted.
    pub timestamp: UnixTimestamp,
}

/// A deposit-backed channel between one user and one merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentChannel {
    /// Unique channel id.
    pub channel_id: String,
    /// Base58 ed25519 key of the channel owner.
    pub user_public_key: String,
    /// Merchant being paid.
    pub merchant_id: String,
    /// Funds locked at creation.
    pub deposit_amount: Decimal,
    /// Sum of accepted payments. Never decreases.
    pub withdrawn_amount: Decimal,
    /// `deposit_amount - withdrawn_amount`.
    pub remaining_balance: Decimal,
    /// Lifecycle status.
    pub status: ChannelStatus,
    /// Last accepted nonce, `0` before the first payment.
    pub nonce: u64,
    /// Address holding the deposit.
    pub escrow_address: String,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Deadline for payments.
    pub expires_at: UnixTimestamp,
    /// When the channel was settled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settled_at: Option<UnixTimestamp>,
    /// Accepted payments in nonce order.
    #[serde(default)]
    pub payments: Vec<ChannelPayment>,
    /// Where lifecycle events are delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque caller data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Settlement progress.
    #[serde(default)]
    pub settlement: SettlementState,
}

impl PaymentChannel {
    fn event(&self, kind: EventKind, amount: Decimal, now: UnixTimestamp) -> WebhookEvent {
        let signature = match &self.settlement {
            SettlementState::Settled {
                signature: Some(signature),
                ..
            } => Some(signature.to_string()),
            _ => None,
        };
        WebhookEvent {
            event: kind,
            session_id: None,
            budget_id: None,
            channel_id: Some(self.channel_id.clone()),
            merchant_id: self.merchant_id.clone(),
            amount,
            fee_amount: None,
            status: self.status.as_str().to_owned(),
            timestamp: now,
            deposit_address: Some(self.escrow_address.clone()),
            signature,
        }
    }

    fn invalid_state(&self, status: &str, operation: &'static str) -> SettlementError {
        SettlementError::InvalidState {
            kind: RecordKind::Channel,
            id: self.channel_id.clone(),
            status: status.to_owned(),
            operation,
        }
    }
}

impl Observe for PaymentChannel {
    fn observe(&mut self, now: UnixTimestamp) -> bool {
        if self.status == ChannelStatus::Open && self.expires_at.has_passed(now) {
            self.status = ChannelStatus::Closed;
            true
        } else {
            false
        }
    }
}

/// Request to open a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateChannelRequest {
    /// Base58 ed25519 key of the channel owner.
    pub user_public_key: String,
    /// Merchant being paid.
    pub merchant_id: String,
    /// Funds to lock.
    pub deposit_amount: Decimal,
    /// Lifetime in seconds.
    pub duration: u64,
    /// Opaque caller data.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Where lifecycle events are delivered.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// A signed off-chain payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPaymentRequest {
    /// Channel to pay through.
    pub channel_id: String,
    /// Amount to withdraw.
    pub amount: Decimal,
    /// Must exceed the channel's current nonce.
    pub nonce: u64,
    /// Base58 owner signature over `(channel_id, amount, nonce)`.
    pub signature: String,
    /// Caller reference.
    #[serde(default)]
    pub reference: String,
}

/// Result of [`PaymentChannelManager::make_channel_payment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelPaymentResult {
    /// Channel id.
    pub channel_id: String,
    /// Withdrawn total after this payment.
    pub withdrawn_amount: Decimal,
    /// Balance left after this payment.
    pub remaining_balance: Decimal,
    /// The nonce just accepted.
    pub nonce: u64,
}

/// Result of [`PaymentChannelManager::settle_channel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSettlement {
    /// Channel id.
    pub channel_id: String,
    /// Amount sent to the merchant.
    pub withdrawn_amount: Decimal,
    /// Amount refunded to the owner.
    pub returned_to_user: Decimal,
    /// When settlement completed.
    pub settled_at: UnixTimestamp,
    /// Ledger transaction, absent when nothing had to move.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<TransactionRef>,
}

/// Owns payment channels.
#[derive(Debug, Clone)]
pub struct PaymentChannelManager {
    store: Arc<dyn RecordStore<PaymentChannel>>,
    ledger: Arc<dyn Ledger>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl PaymentChannelManager {
    /// Creates a manager with an in-memory store.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, retry: RetryPolicy) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            ledger,
            events: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            retry,
        }
    }

    /// Replaces the record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore<PaymentChannel>>) -> Self {
        self.store = store;
        self
    }

    /// Replaces the event sink.
    #[must_use]
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replaces the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Opens a channel and allocates its escrow address.
    ///
    /// The on-chain deposit into the escrow address is the caller's responsibility.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::InvalidAddress`] if the owner key is not a valid
    /// ed25519 key, other validation errors for bad input, and
    /// [`SettlementError::LedgerUnavailable`] if no escrow address could be allocated.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.channel.create", skip_all, fields(merchant_id = %request.merchant_id), err)
    )]
    pub async fn create_channel(
        &self,
        request: CreateChannelRequest,
    ) -> Result<PaymentChannel, SettlementError> {
        let merchant_id = request.merchant_id.trim();
        if merchant_id.is_empty() {
            return Err(SettlementError::InvalidRequest("merchantId is required".to_owned()));
        }
        let user_public_key = request.user_public_key.trim();
        parse_public_key(user_public_key)
            .map_err(|e| SettlementError::InvalidAddress(format!("userPublicKey: {e}")))?;
        let deposit_amount = validate_amount(request.deposit_amount)?;
        if request.duration == 0 {
            return Err(SettlementError::InvalidRequest(
                "duration must be at least one second".to_owned(),
            ));
        }
        let webhook_url = validate_webhook_url(request.webhook_url)?;

        let ledger = &self.ledger;
        let escrow_address = self
            .retry
            .run("generate_deposit_address", || ledger.generate_deposit_address())
            .await?;

        let now = self.clock.now();
        let channel = PaymentChannel {
            channel_id: Uuid::new_v4().to_string(),
            user_public_key: user_public_key.to_owned(),
            merchant_id: merchant_id.to_owned(),
            deposit_amount,
            withdrawn_amount: Decimal::ZERO,
            remaining_balance: deposit_amount,
            status: ChannelStatus::Open,
            nonce: 0,
            escrow_address,
            created_at: now,
            expires_at: now + request.duration,
            settled_at: None,
            payments: Vec::new(),
            webhook_url,
            metadata: request.metadata,
            settlement: SettlementState::Unsettled,
        };
        self.store.insert(&channel.channel_id, channel.clone()).await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            channel_id = %channel.channel_id,
            deposit = %channel.deposit_amount,
            expires_at = %channel.expires_at,
            "Payment channel opened"
        );

        notify(
            self.events.as_ref(),
            channel.webhook_url.as_deref(),
            channel.event(EventKind::ChannelOpened, channel.deposit_amount, now),
        );
        Ok(channel)
    }

    /// Accepts a signed off-chain payment.
    ///
    /// Checks run in order: amount, status, expiry (which closes the channel), nonce,
    /// balance, signature. Any failure leaves the channel unchanged apart from the
    /// expiry transition.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidState`] if the channel is not open or is settling
    /// - [`SettlementError::Expired`] if this call found the channel past its deadline
    /// - [`SettlementError::ReplayOrOutOfOrder`] if the nonce does not advance
    /// - [`SettlementError::InsufficientBalance`] if the deposit does not cover it
    /// - [`SettlementError::InvalidSignature`] if the owner did not sign it
    #[cfg_attr(
        feature = "telemetry",
        instrument(
            name = "stakefy.channel.pay",
            skip_all,
            fields(channel_id = %request.channel_id, nonce = request.nonce),
            err
        )
    )]
    pub async fn make_channel_payment(
        &self,
        request: ChannelPaymentRequest,
    ) -> Result<ChannelPaymentResult, SettlementError> {
        let amount = validate_amount(request.amount)?;
        let now = self.clock.now();

        let outcome = mutate(
            self.store.as_ref(),
            RecordKind::Channel,
            &request.channel_id,
            |channel| {
                if channel.observe(now) {
                    return Ok(Step::CommitErr(SettlementError::Expired {
                        kind: RecordKind::Channel,
                        id: channel.channel_id.clone(),
                        expires_at: channel.expires_at,
                    }));
                }
                if channel.status != ChannelStatus::Open {
                    return Err(channel.invalid_state(channel.status.as_str(), "pay through"));
                }
                if channel.settlement.is_in_progress() {
                    return Err(channel.invalid_state("settling", "pay through"));
                }
                if request.nonce <= channel.nonce {
                    return Err(SettlementError::ReplayOrOutOfOrder {
                        nonce: request.nonce,
                        current: channel.nonce,
                    });
                }
                let withdrawn = checked_total(channel.withdrawn_amount, amount)
                    .ok()
                    .filter(|total| *total <= channel.deposit_amount)
                    .ok_or(SettlementError::InsufficientBalance {
                        requested: amount,
                        available: channel.remaining_balance,
                    })?;
                verify_channel_payment(
                    &channel.user_public_key,
                    &channel.channel_id,
                    amount,
                    request.nonce,
                    &request.signature,
                )
                .map_err(|e| SettlementError::InvalidSignature(e.to_string()))?;

                channel.withdrawn_amount = withdrawn;
                channel.remaining_balance = channel.deposit_amount - channel.withdrawn_amount;
                channel.nonce = request.nonce;
                channel.payments.push(ChannelPayment {
                    amount,
                    nonce: request.nonce,
                    reference: request.reference.clone(),
                    timestamp: now,
                });
                Ok(Step::Commit(ChannelPaymentResult {
                    channel_id: channel.channel_id.clone(),
                    withdrawn_amount: channel.withdrawn_amount,
                    remaining_balance: channel.remaining_balance,
                    nonce: channel.nonce,
                }))
            },
        )
        .await;

        #[cfg(feature = "telemetry")]
        match &outcome {
            Err(err @ SettlementError::InvalidSignature(_)) => {
                tracing::warn!(channel_id = %request.channel_id, error = %err, "Rejected channel payment with bad signature");
            }
            Err(err @ SettlementError::ReplayOrOutOfOrder { .. }) => {
                tracing::warn!(channel_id = %request.channel_id, error = %err, "Rejected replayed or out-of-order channel payment");
            }
            _ => {}
        }
        outcome
    }

    /// Settles a channel: withdrawn funds to `merchant_address`, the rest back to the
    /// owner, in one ledger transaction. Works on open and closed channels.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::AlreadySettled`] if the channel was settled before
    /// - [`SettlementError::InvalidState`] while another settle call is in flight
    /// - [`SettlementError::LedgerUnavailable`] / [`SettlementError::LedgerRejected`]
    ///   if the transfer fails; the channel can be settled again afterwards
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.channel.settle", skip(self), err)
    )]
    pub async fn settle_channel(
        &self,
        channel_id: &str,
        merchant_address: &str,
    ) -> Result<ChannelSettlement, SettlementError> {
        let merchant_address = merchant_address.trim();
        if merchant_address.is_empty() {
            return Err(SettlementError::InvalidAddress(
                "merchantAddress is required".to_owned(),
            ));
        }

        let started_at = self.clock.now();
        let channel = mutate(
            self.store.as_ref(),
            RecordKind::Channel,
            channel_id,
            |channel| {
                channel.observe(started_at);
                if channel.status == ChannelStatus::Settled {
                    return Err(SettlementError::AlreadySettled {
                        kind: RecordKind::Channel,
                        id: channel.channel_id.clone(),
                    });
                }
                channel
                    .settlement
                    .claim(RecordKind::Channel, &channel.channel_id, started_at)?;
                Ok(Step::Commit(channel.clone()))
            },
        )
        .await?;

        let legs: Vec<TransferLeg> = [
            (merchant_address, channel.withdrawn_amount),
            (channel.user_public_key.as_str(), channel.remaining_balance),
        ]
        .into_iter()
        .filter(|(_, amount)| *amount > Decimal::ZERO)
        .map(|(to, amount)| TransferLeg::new(to, amount))
        .collect();

        let signature = if legs.is_empty() {
            None
        } else {
            let ledger = &self.ledger;
            let key = settlement_key(RecordKind::Channel, channel_id);
            let transferred = self
                .retry
                .run("transfer_many", || {
                    ledger.transfer_many(&channel.escrow_address, &legs, Some(key.as_str()))
                })
                .await;
            match transferred {
                Ok(signature) => Some(signature),
                Err(err) => {
                    #[cfg(feature = "telemetry")]
                    tracing::warn!(channel_id, error = %err, "Channel settlement failed, releasing claim");
                    self.release_claim(channel_id).await?;
                    return Err(err.into());
                }
            }
        };

        let settled_at = self.clock.now();
        let settled = mutate(
            self.store.as_ref(),
            RecordKind::Channel,
            channel_id,
            |channel| {
                channel.status = ChannelStatus::Settled;
                channel.settled_at = Some(settled_at);
                channel.settlement.complete(signature.clone(), settled_at);
                Ok(Step::Commit(channel.clone()))
            },
        )
        .await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            channel_id,
            withdrawn = %settled.withdrawn_amount,
            returned = %settled.remaining_balance,
            "Payment channel settled"
        );

        notify(
            self.events.as_ref(),
            settled.webhook_url.as_deref(),
            settled.event(EventKind::ChannelSettled, settled.withdrawn_amount, settled_at),
        );
        Ok(ChannelSettlement {
            channel_id: channel_id.to_owned(),
            withdrawn_amount: settled.withdrawn_amount,
            returned_to_user: settled.remaining_balance,
            settled_at,
            signature,
        })
    }

    /// Returns the channel, closing it if its deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::NotFound`] for unknown ids.
    pub async fn get_channel_status(
        &self,
        channel_id: &str,
    ) -> Result<PaymentChannel, SettlementError> {
        observe_record(
            self.store.as_ref(),
            RecordKind::Channel,
            channel_id,
            self.clock.now(),
        )
        .await
    }

    async fn release_claim(&self, channel_id: &str) -> Result<(), SettlementError> {
        let released = mutate(
            self.store.as_ref(),
            RecordKind::Channel,
            channel_id,
            |channel| {
                if channel.settlement.release() {
                    Ok(Step::Commit(()))
                } else {
                    Ok(Step::Skip(()))
                }
            },
        )
        .await;
        #[cfg(feature = "telemetry")]
        if let Err(err) = &released {
            tracing::error!(channel_id, error = %err, "Failed to release settlement claim");
        }
        released
    }
}

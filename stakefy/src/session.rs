//! One-time payment sessions.
//!
//! A session asks a payer to fund a freshly generated deposit address with
//! `amount + fee`. [`PaymentSessionManager::verify_payment`] checks the ledger and
//! moves the session from `pending` to `completed` (or to `failed` once it has
//! expired unpaid). A completed session is settled exactly once: the principal goes
//! to the merchant and the fee to the facilitator's fee address, in one ledger
//! transaction.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::form_urlencoded;
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::amount::{FeeRate, checked_total, validate_amount};
use crate::error::{RecordKind, SettlementError};
use crate::events::{EventKind, EventSink, NoopSink, WebhookEvent, notify, validate_webhook_url};
use crate::ledger::{Ledger, RetryPolicy, TransactionRef, TransferLeg, settlement_key};
use crate::lifecycle::SettlementState;
use crate::store::{InMemoryStore, RecordStore, Step, mutate};
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};

/// Default time a payer has to fund a session: 15 minutes.
pub const DEFAULT_SESSION_TTL_SECS: u64 = 15 * 60;

/// Default time an unpaid session is kept after its deadline: 1 hour.
pub const DEFAULT_SESSION_RETENTION_SECS: u64 = 60 * 60;

/// Status of a payment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for funds.
    Pending,
    /// Funds arrived. Terminal except for settlement bookkeeping.
    Completed,
    /// Expired unpaid. Terminal.
    Failed,
}

impl SessionStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-time payment from a payer to a merchant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    /// Unique session id.
    pub session_id: String,
    /// Merchant being paid.
    pub merchant_id: String,
    /// Principal owed to the merchant.
    pub amount: Decimal,
    /// Facilitator fee on top of the principal.
    pub fee_amount: Decimal,
    /// Caller-supplied reference.
    pub reference: String,
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Address the payer funds.
    pub deposit_address: String,
    /// Solana Pay transfer request for the deposit.
    pub solana_pay_url: String,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Funding deadline.
    pub expires_at: UnixTimestamp,
    /// Where lifecycle events are delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque caller data, never inspected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Settlement progress.
    #[serde(default)]
    pub settlement: SettlementState,
}

impl PaymentSession {
    /// Amount the deposit address must hold: principal plus fee.
    #[must_use]
    pub fn total_due(&self) -> Decimal {
        self.amount + self.fee_amount
    }

    /// Returns `true` once the funding deadline has passed.
    #[must_use]
    pub const fn is_expired(&self, now: UnixTimestamp) -> bool {
        self.expires_at.has_passed(now)
    }

    fn event(&self, kind: EventKind, now: UnixTimestamp) -> WebhookEvent {
        WebhookEvent {
            event: kind,
            session_id: Some(self.session_id.clone()),
            budget_id: None,
            channel_id: None,
            merchant_id: self.merchant_id.clone(),
            amount: self.amount,
            fee_amount: Some(self.fee_amount),
            status: self.status.as_str().to_owned(),
            timestamp: now,
            deposit_address: Some(self.deposit_address.clone()),
            signature: None,
        }
    }
}

/// Builds a Solana Pay transfer request URL.
///
/// The merchant is used as the label and the caller reference as the message.
#[must_use]
pub fn solana_pay_url(
    address: &str,
    amount: Decimal,
    mint: Option<&str>,
    label: &str,
    message: &str,
) -> String {
    let mut url = format!("solana:{address}?amount={}", amount.normalize());
    if let Some(mint) = mint {
        url.push_str("&spl-token=");
        url.push_str(mint);
    }
    for (key, value) in [("label", label), ("message", message)] {
        if !value.is_empty() {
            url.push('&');
            url.push_str(key);
            url.push('=');
            url.extend(form_urlencoded::byte_serialize(value.as_bytes()));
        }
    }
    url
}

/// Request to open a payment session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    /// Merchant being paid.
    pub merchant_id: String,
    /// Principal amount.
    pub amount: Decimal,
    /// Caller reference.
    pub reference: String,
    /// Opaque caller data.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Where lifecycle events are delivered.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Result of [`PaymentSessionManager::verify_payment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentVerification {
    /// Session id.
    pub session_id: String,
    /// Status after the check.
    pub status: SessionStatus,
    /// `true` if the session is completed.
    pub is_paid: bool,
}

/// Result of [`PaymentSessionManager::settle_payment`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSettlement {
    /// Session id.
    pub session_id: String,
    /// Ledger transaction that moved the funds.
    pub signature: TransactionRef,
    /// Amount sent to the merchant.
    pub merchant_amount: Decimal,
    /// Amount sent to the fee address.
    pub fee_amount: Decimal,
    /// When settlement completed.
    pub settled_at: UnixTimestamp,
}

/// Tunables for [`PaymentSessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Fee charged on every session.
    pub fee_rate: FeeRate,
    /// Seconds a payer has to fund a session.
    pub ttl_secs: u64,
    /// Where fees are collected on settlement.
    pub fee_address: String,
    /// SPL token mint advertised in Solana Pay URLs.
    pub token_mint: Option<String>,
    /// Retry policy for ledger calls.
    pub retry: RetryPolicy,
    /// Seconds an unpaid session is kept past its deadline before
    /// [`PaymentSessionManager::prune_expired`] removes it.
    pub retention_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fee_rate: FeeRate::default(),
            ttl_secs: DEFAULT_SESSION_TTL_SECS,
            fee_address: String::new(),
            token_mint: None,
            retry: RetryPolicy::default(),
            retention_secs: DEFAULT_SESSION_RETENTION_SECS,
        }
    }
}

impl SessionConfig {
    /// Sets the fee rate.
    #[must_use]
    pub const fn with_fee_rate(mut self, fee_rate: FeeRate) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    /// Sets the funding window.
    #[must_use]
    pub const fn with_ttl_secs(mut self, ttl_secs: u64) -> Self {
        self.ttl_secs = ttl_secs;
        self
    }

    /// Sets the fee collection address.
    #[must_use]
    pub fn with_fee_address(mut self, fee_address: impl Into<String>) -> Self {
        self.fee_address = fee_address.into();
        self
    }

    /// Sets the token mint advertised in Solana Pay URLs.
    #[must_use]
    pub fn with_token_mint(mut self, mint: impl Into<String>) -> Self {
        self.token_mint = Some(mint.into());
        self
    }

    /// Sets the ledger retry policy.
    #[must_use]
    pub const fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets how long unpaid sessions outlive their deadline.
    #[must_use]
    pub const fn with_retention_secs(mut self, retention_secs: u64) -> Self {
        self.retention_secs = retention_secs;
        self
    }
}

/// Owns payment sessions and moves them through their lifecycle.
#[derive(Debug, Clone)]
pub struct PaymentSessionManager {
    store: Arc<dyn RecordStore<PaymentSession>>,
    ledger: Arc<dyn Ledger>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl PaymentSessionManager {
    /// Creates a manager with an in-memory store, no event delivery and the system
    /// clock.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, config: SessionConfig) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            ledger,
            events: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            config,
        }
    }

    /// Replaces the record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore<PaymentSession>>) -> Self {
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

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Opens a session with a fresh deposit address.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::InvalidRequest`] or [`SettlementError::InvalidAmount`]
    /// for bad input, and [`SettlementError::LedgerUnavailable`] if no deposit address
    /// could be allocated.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.session.create", skip_all, fields(merchant_id = %request.merchant_id), err)
    )]
    pub async fn create_payment(
        &self,
        request: CreatePaymentRequest,
    ) -> Result<PaymentSession, SettlementError> {
        let merchant_id = required(request.merchant_id, "merchantId")?;
        let reference = required(request.reference, "reference")?;
        let amount = validate_amount(request.amount)?;
        let fee_amount = self.config.fee_rate.fee_for(amount)?;
        let total = checked_total(amount, fee_amount)?;
        let webhook_url = validate_webhook_url(request.webhook_url)?;

        let ledger = &self.ledger;
        let deposit_address = self
            .config
            .retry
            .run("generate_deposit_address", || ledger.generate_deposit_address())
            .await?;

        let now = self.clock.now();
        let session = PaymentSession {
            session_id: Uuid::new_v4().to_string(),
            solana_pay_url: solana_pay_url(
                &deposit_address,
                total,
                self.config.token_mint.as_deref(),
                &merchant_id,
                &reference,
            ),
            merchant_id,
            amount,
            fee_amount,
            reference,
            status: SessionStatus::Pending,
            deposit_address,
            created_at: now,
            expires_at: now + self.config.ttl_secs,
            webhook_url,
            metadata: request.metadata,
            settlement: SettlementState::Unsettled,
        };
        self.store
            .insert(&session.session_id, session.clone())
            .await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(
            session_id = %session.session_id,
            amount = %session.amount,
            fee = %session.fee_amount,
            expires_at = %session.expires_at,
            "Payment session created"
        );

        notify(
            self.events.as_ref(),
            session.webhook_url.as_deref(),
            session.event(EventKind::PaymentCreated, now),
        );
        Ok(session)
    }

    /// Checks the deposit address and completes the session once it is funded.
    ///
    /// Completion happens once: later calls report `completed` without touching the
    /// ledger or emitting another event.
    ///
    /// A pending session past its deadline that is still unfunded is moved to `failed`
    /// here and a `payment.failed` event is emitted. No background task changes the
    /// status, so an expired session stays `pending` until the next verification or
    /// until [`Self::prune_expired`] removes it. A deposit that arrives late still
    /// completes the session, because funding is checked first.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::NotFound`] for unknown ids and
    /// [`SettlementError::LedgerUnavailable`] if the balance cannot be read.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.session.verify", skip(self), err)
    )]
    pub async fn verify_payment(
        &self,
        session_id: &str,
    ) -> Result<PaymentVerification, SettlementError> {
        let session = self.load(session_id).await?;
        if session.status != SessionStatus::Pending {
            return Ok(verification(session_id, session.status));
        }

        let ledger = &self.ledger;
        let due = session.total_due();
        let is_paid = self
            .config
            .retry
            .run("check_balance", || {
                ledger.check_balance(&session.deposit_address, due)
            })
            .await?;

        let now = self.clock.now();
        let transition = mutate(
            self.store.as_ref(),
            RecordKind::Session,
            session_id,
            |s| {
                if s.status != SessionStatus::Pending {
                    return Ok(Step::Skip((s.status, None)));
                }
                if is_paid {
                    s.status = SessionStatus::Completed;
                } else if s.is_expired(now) {
                    s.status = SessionStatus::Failed;
                } else {
                    return Ok(Step::Skip((s.status, None)));
                }
                Ok(Step::Commit((s.status, Some(s.clone()))))
            },
        )
        .await?;

        let (status, changed) = transition;
        if let Some(updated) = changed {
            let kind = if status == SessionStatus::Completed {
                EventKind::PaymentCompleted
            } else {
                EventKind::PaymentFailed
            };
            #[cfg(feature = "telemetry")]
            tracing::info!(session_id, status = %status, "Payment session transitioned");
            notify(
                self.events.as_ref(),
                updated.webhook_url.as_deref(),
                updated.event(kind, now),
            );
        }
        Ok(verification(session_id, status))
    }

    /// Moves a completed session's funds: principal to `merchant_address`, fee to the
    /// configured fee address.
    ///
    /// # Errors
    ///
    /// - [`SettlementError::InvalidState`] unless the session is completed, or while
    ///   another settle call is in flight
    /// - [`SettlementError::AlreadySettled`] on a second successful call
    /// - [`SettlementError::LedgerUnavailable`] / [`SettlementError::LedgerRejected`]
    ///   if the transfer fails; the session can be settled again afterwards
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.session.settle", skip(self), err)
    )]
    pub async fn settle_payment(
        &self,
        session_id: &str,
        merchant_address: &str,
    ) -> Result<PaymentSettlement, SettlementError> {
        let merchant_address = merchant_address.trim();
        if merchant_address.is_empty() {
            return Err(SettlementError::InvalidAddress(
                "merchantAddress is required".to_owned(),
            ));
        }

        let started_at = self.clock.now();
        let session = mutate(
            self.store.as_ref(),
            RecordKind::Session,
            session_id,
            |s| {
                if s.status != SessionStatus::Completed {
                    return Err(SettlementError::InvalidState {
                        kind: RecordKind::Session,
                        id: s.session_id.clone(),
                        status: s.status.as_str().to_owned(),
                        operation: "settle",
                    });
                }
                s.settlement
                    .claim(RecordKind::Session, &s.session_id, started_at)?;
                Ok(Step::Commit(s.clone()))
            },
        )
        .await?;

        let legs = match self.settlement_legs(&session, merchant_address) {
            Ok(legs) => legs,
            Err(err) => {
                self.release_claim(session_id).await?;
                return Err(err);
            }
        };

        let ledger = &self.ledger;
        let key = settlement_key(RecordKind::Session, session_id);
        let transferred = self
            .config
            .retry
            .run("transfer_many", || {
                ledger.transfer_many(&session.deposit_address, &legs, Some(key.as_str()))
            })
            .await;
        let signature = match transferred {
            Ok(signature) => signature,
            Err(err) => {
                #[cfg(feature = "telemetry")]
                tracing::warn!(session_id, error = %err, "Settlement transfer failed, releasing claim");
                self.release_claim(session_id).await?;
                return Err(err.into());
            }
        };

        let settled_at = self.clock.now();
        mutate(
            self.store.as_ref(),
            RecordKind::Session,
            session_id,
            |s| {
                s.settlement.complete(Some(signature.clone()), settled_at);
                Ok(Step::Commit(()))
            },
        )
        .await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(session_id, signature = %signature, "Payment session settled");

        Ok(PaymentSettlement {
            session_id: session_id.to_owned(),
            signature,
            merchant_amount: session.amount,
            fee_amount: session.fee_amount,
            settled_at,
        })
    }

    /// Returns a snapshot of the session.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::NotFound`] for unknown ids.
    pub async fn get_status(&self, session_id: &str) -> Result<PaymentSession, SettlementError> {
        self.load(session_id).await
    }

    /// Removes unpaid sessions whose deadline passed more than `retention_secs` ago.
    ///
    /// Completed sessions are kept: they still await settlement or act as access
    /// grants. A deposit that reaches a pruned session's address is no longer tracked.
    /// Returns the number of sessions removed.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::Storage`] if the store cannot be swept.
    pub async fn prune_expired(&self) -> Result<usize, SettlementError> {
        let cutoff = self.clock.now();
        let retention = self.config.retention_secs;
        let removed = self
            .store
            .retain(&|s: &PaymentSession| {
                s.status == SessionStatus::Completed || !(s.expires_at + retention).has_passed(cutoff)
            })
            .await?;
        #[cfg(feature = "telemetry")]
        if removed > 0 {
            tracing::debug!(removed, "Pruned expired payment sessions");
        }
        Ok(removed)
    }

    async fn load(&self, session_id: &str) -> Result<PaymentSession, SettlementError> {
        self.store
            .get(session_id)
            .await?
            .map(|v| v.record)
            .ok_or_else(|| SettlementError::not_found(RecordKind::Session, session_id))
    }

    fn settlement_legs(
        &self,
        session: &PaymentSession,
        merchant_address: &str,
    ) -> Result<Vec<TransferLeg>, SettlementError> {
        let mut legs = vec![TransferLeg::new(merchant_address, session.amount)];
        if session.fee_amount > Decimal::ZERO {
            if self.config.fee_address.is_empty() {
                return Err(SettlementError::InvalidRequest(
                    "fee collection address is not configured".to_owned(),
                ));
            }
            legs.push(TransferLeg::new(
                self.config.fee_address.clone(),
                session.fee_amount,
            ));
        }
        Ok(legs)
    }

    async fn release_claim(&self, session_id: &str) -> Result<(), SettlementError> {
        let released = mutate(
            self.store.as_ref(),
            RecordKind::Session,
            session_id,
            |s| {
                if s.settlement.release() {
                    Ok(Step::Commit(()))
                } else {
                    Ok(Step::Skip(()))
                }
            },
        )
        .await;
        #[cfg(feature = "telemetry")]
        if let Err(err) = &released {
            tracing::error!(session_id, error = %err, "Failed to release settlement claim");
        }
        released
    }
}

fn verification(session_id: &str, status: SessionStatus) -> PaymentVerification {
    PaymentVerification {
        session_id: session_id.to_owned(),
        status,
        is_paid: status == SessionStatus::Completed,
    }
}

fn required(value: String, field: &str) -> Result<String, SettlementError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(SettlementError::InvalidRequest(format!("{field} is required")));
    }
    Ok(trimmed.to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::ledger::InMemoryLedger;
    use crate::store::{StoreError, Versioned};
    use crate::timestamp::ManualClock;
    use async_trait::async_trait;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct Fixture {
        ledger: Arc<InMemoryLedger>,
        events: Arc<RecordingSink>,
        clock: Arc<ManualClock>,
        manager: PaymentSessionManager,
    }

    fn fixture() -> Fixture {
        let ledger = Arc::new(InMemoryLedger::new());
        let events = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(1_000)));
        let config = SessionConfig::default()
            .with_fee_address("fees")
            .with_retry(RetryPolicy::new(3, Duration::ZERO));
        let manager = PaymentSessionManager::new(ledger.clone(), config)
            .with_events(events.clone())
            .with_clock(clock.clone());
        Fixture {
            ledger,
            events,
            clock,
            manager,
        }
    }

    fn request(amount: &str) -> CreatePaymentRequest {
        CreatePaymentRequest {
            merchant_id: "merchant-1".into(),
            amount: Decimal::from_str(amount).unwrap(),
            reference: "order-42".into(),
            metadata: Some(serde_json::json!({"sku": "A1"})),
            webhook_url: Some("https://merchant.example/hooks".into()),
        }
    }

    #[tokio::test]
    async fn create_computes_fee_and_expiry() {
        let f = fixture();
        let session = f.manager.create_payment(request("10")).await.unwrap();
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.fee_amount, Decimal::from_str("0.05").unwrap());
        assert_eq!(session.total_due(), Decimal::from_str("10.05").unwrap());
        assert_eq!(session.expires_at.as_secs(), 1_000 + DEFAULT_SESSION_TTL_SECS);
        assert!(session.solana_pay_url.starts_with("solana:"));
        assert!(session.solana_pay_url.contains("amount=10.05"));
        assert_eq!(f.events.count(EventKind::PaymentCreated), 1);
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let f = fixture();
        let mut missing = request("1");
        missing.merchant_id = " ".into();
        assert!(matches!(
            f.manager.create_payment(missing).await,
            Err(SettlementError::InvalidRequest(_))
        ));
        assert!(matches!(
            f.manager.create_payment(request("0")).await,
            Err(SettlementError::InvalidAmount(_))
        ));
    }

    #[tokio::test]
    async fn create_retries_transient_ledger_failures() {
        let f = fixture();
        f.ledger.fail_next(2);
        assert!(f.manager.create_payment(request("1")).await.is_ok());

        f.ledger.fail_next(3);
        assert!(matches!(
            f.manager.create_payment(request("1")).await,
            Err(SettlementError::LedgerUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn verify_completes_once() {
        let f = fixture();
        let session = f.manager.create_payment(request("10")).await.unwrap();

        let before = f.manager.verify_payment(&session.session_id).await.unwrap();
        assert_eq!(before.status, SessionStatus::Pending);
        assert!(!before.is_paid);

        f.ledger.credit(&session.deposit_address, session.total_due());
        for _ in 0..2 {
            let after = f.manager.verify_payment(&session.session_id).await.unwrap();
            assert_eq!(after.status, SessionStatus::Completed);
            assert!(after.is_paid);
        }
        assert_eq!(f.events.count(EventKind::PaymentCompleted), 1);
    }

    #[tokio::test]
    async fn partial_funding_is_not_enough() {
        let f = fixture();
        let session = f.manager.create_payment(request("10")).await.unwrap();
        f.ledger.credit(&session.deposit_address, session.amount);
        let result = f.manager.verify_payment(&session.session_id).await.unwrap();
        assert!(!result.is_paid);
    }

    #[tokio::test]
    async fn expired_unpaid_session_fails() {
        let f = fixture();
        let session = f.manager.create_payment(request("1")).await.unwrap();
        f.clock.advance(DEFAULT_SESSION_TTL_SECS + 1);

        let result = f.manager.verify_payment(&session.session_id).await.unwrap();
        assert_eq!(result.status, SessionStatus::Failed);
        assert_eq!(f.events.count(EventKind::PaymentFailed), 1);

        f.ledger.credit(&session.deposit_address, session.total_due());
        let again = f.manager.verify_payment(&session.session_id).await.unwrap();
        assert_eq!(again.status, SessionStatus::Failed);
    }

    #[tokio::test]
    async fn prunes_unpaid_sessions_after_retention() {
        let f = fixture();
        let unpaid = f.manager.create_payment(request("1")).await.unwrap();
        let paid = f.manager.create_payment(request("2")).await.unwrap();
        f.ledger.credit(&paid.deposit_address, paid.total_due());
        f.manager.verify_payment(&paid.session_id).await.unwrap();

        f.clock.advance(DEFAULT_SESSION_TTL_SECS + 1);
        assert_eq!(f.manager.prune_expired().await, Ok(0));

        f.clock.advance(DEFAULT_SESSION_RETENTION_SECS);
        assert_eq!(f.manager.prune_expired().await, Ok(1));
        assert!(matches!(
            f.manager.get_status(&unpaid.session_id).await,
            Err(SettlementError::NotFound { .. })
        ));
        assert_eq!(
            f.manager.get_status(&paid.session_id).await.unwrap().status,
            SessionStatus::Completed
        );
    }

    #[tokio::test]
    async fn settle_requires_completion_and_happens_once() {
        let f = fixture();
        let session = f.manager.create_payment(request("10")).await.unwrap();

        let early = f.manager.settle_payment(&session.session_id, "merchant-wallet").await;
        assert!(matches!(early, Err(SettlementError::InvalidState { .. })));

        f.ledger.credit(&session.deposit_address, session.total_due());
        f.manager.verify_payment(&session.session_id).await.unwrap();

        let settled = f
            .manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap();
        assert_eq!(settled.merchant_amount, Decimal::TEN);
        assert_eq!(f.ledger.balance("merchant-wallet"), Decimal::TEN);
        assert_eq!(f.ledger.balance("fees"), session.fee_amount);

        let second = f.manager.settle_payment(&session.session_id, "merchant-wallet").await;
        assert!(matches!(second, Err(SettlementError::AlreadySettled { .. })));
        assert_eq!(f.ledger.balance("merchant-wallet"), Decimal::TEN);

        let stored = f.manager.get_status(&session.session_id).await.unwrap();
        assert!(stored.settlement.is_settled());
    }

    #[tokio::test]
    async fn failed_transfer_releases_the_claim() {
        let f = fixture();
        let session = f.manager.create_payment(request("2")).await.unwrap();
        f.ledger.credit(&session.deposit_address, session.total_due());
        f.manager.verify_payment(&session.session_id).await.unwrap();

        f.ledger.fail_next(3);
        let err = f
            .manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        let stored = f.manager.get_status(&session.session_id).await.unwrap();
        assert_eq!(stored.settlement, SettlementState::Unsettled);

        f.manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lost_transfer_reply_moves_funds_once() {
        let ledger = Arc::new(InMemoryLedger::new());
        let config = SessionConfig::default()
            .with_fee_address("fees")
            .with_retry(RetryPolicy::no_retry());
        let manager = PaymentSessionManager::new(ledger.clone(), config);
        let session = manager.create_payment(request("10")).await.unwrap();
        ledger.credit(&session.deposit_address, session.total_due());
        manager.verify_payment(&session.session_id).await.unwrap();

        ledger.lose_next_transfer_ack(1);
        let err = manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.balance("merchant-wallet"), Decimal::TEN);

        let settled = manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap();
        assert_eq!(ledger.transaction_count(), 1);
        assert_eq!(ledger.balance("merchant-wallet"), Decimal::TEN);
        assert_eq!(ledger.balance("fees"), session.fee_amount);
        let record = ledger.get_transaction(&settled.signature).await.unwrap().unwrap();
        assert_eq!(record.from, session.deposit_address);
    }

    #[tokio::test]
    async fn timed_out_transfer_is_retried_under_the_same_key() {
        let f = fixture();
        let session = f.manager.create_payment(request("3")).await.unwrap();
        f.ledger.credit(&session.deposit_address, session.total_due());
        f.manager.verify_payment(&session.session_id).await.unwrap();

        f.ledger.lose_next_transfer_ack(1);
        f.manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap();
        assert_eq!(f.ledger.transaction_count(), 1);
        assert_eq!(f.ledger.balance("merchant-wallet"), Decimal::from(3));
        assert_eq!(f.ledger.balance(&session.deposit_address), Decimal::ZERO);
    }

    #[derive(Debug)]
    struct FailingSwaps {
        inner: InMemoryStore<PaymentSession>,
        swaps_left: AtomicU32,
    }

    #[async_trait]
    impl RecordStore<PaymentSession> for FailingSwaps {
        async fn get(&self, id: &str) -> Result<Option<Versioned<PaymentSession>>, StoreError> {
            self.inner.get(id).await
        }

        async fn insert(
            &self,
            id: &str,
            record: PaymentSession,
        ) -> Result<Versioned<PaymentSession>, StoreError> {
            self.inner.insert(id, record).await
        }

        async fn compare_and_swap(
            &self,
            id: &str,
            expected_version: u64,
            record: PaymentSession,
        ) -> Result<Versioned<PaymentSession>, StoreError> {
            self.swaps_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .map_err(|_| StoreError::Backend("disk full".into()))?;
            self.inner.compare_and_swap(id, expected_version, record).await
        }

        async fn retain(
            &self,
            keep: &(dyn for<'a> Fn(&'a PaymentSession) -> bool + Send + Sync),
        ) -> Result<usize, StoreError> {
            self.inner.retain(keep).await
        }
    }

    #[tokio::test]
    async fn unreleased_claim_is_reported() {
        let ledger = Arc::new(InMemoryLedger::new());
        // Completion and the settlement claim succeed; releasing the claim does not.
        let store = Arc::new(FailingSwaps {
            inner: InMemoryStore::new(),
            swaps_left: AtomicU32::new(2),
        });
        let config = SessionConfig::default()
            .with_fee_address("fees")
            .with_retry(RetryPolicy::no_retry());
        let manager = PaymentSessionManager::new(ledger.clone(), config).with_store(store.clone());
        let session = manager.create_payment(request("1")).await.unwrap();
        ledger.credit(&session.deposit_address, session.total_due());
        manager.verify_payment(&session.session_id).await.unwrap();

        ledger.fail_next(1);
        let err = manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::Storage(ref m) if m.contains("disk full")));
        let stored = manager.get_status(&session.session_id).await.unwrap();
        assert!(stored.settlement.is_in_progress());
    }

    #[tokio::test]
    async fn settle_without_fee_address_is_refused() {
        let ledger = Arc::new(InMemoryLedger::new());
        let manager = PaymentSessionManager::new(ledger.clone(), SessionConfig::default());
        let session = manager.create_payment(request("1")).await.unwrap();
        ledger.credit(&session.deposit_address, session.total_due());
        manager.verify_payment(&session.session_id).await.unwrap();

        let err = manager
            .settle_payment(&session.session_id, "merchant-wallet")
            .await
            .unwrap_err();
        assert!(matches!(err, SettlementError::InvalidRequest(_)));
        let stored = manager.get_status(&session.session_id).await.unwrap();
        assert_eq!(stored.settlement, SettlementState::Unsettled);
    }

    #[tokio::test]
    async fn unknown_session_is_not_found() {
        let f = fixture();
        assert_eq!(
            f.manager.verify_payment("missing").await,
            Err(SettlementError::not_found(RecordKind::Session, "missing"))
        );
        assert!(matches!(
            f.manager.get_status("missing").await,
            Err(SettlementError::NotFound { .. })
        ));
    }

    #[test]
    fn solana_pay_url_encodes_text_fields() {
        let url = solana_pay_url("Addr", Decimal::new(1050, 2), Some("Mint"), "My Shop", "order #1");
        assert_eq!(
            url,
            "solana:Addr?amount=10.5&spl-token=Mint&label=My+Shop&message=order+%231"
        );
    }
}

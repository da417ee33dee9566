//! Pre-authorized spending budgets.
//!
//! A budget is funded once, up front, and then drawn down by many small payments
//! without touching the ledger. The facilitator fee is charged once at creation:
//! `total_amount = amount + fee` while only `amount` is spendable.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::amount::{FeeRate, checked_total, validate_amount};
use crate::error::{RecordKind, SettlementError};
use crate::events::{EventKind, EventSink, NoopSink, WebhookEvent, notify, validate_webhook_url};
use crate::lifecycle::{Observe, observe_record, refuse};
use crate::store::{InMemoryStore, RecordStore, Step, mutate};
use crate::timestamp::{Clock, SystemClock, UnixTimestamp};

/// Status of a budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BudgetStatus {
    /// Accepting payments.
    Active,
    /// Spent down to zero.
    Depleted,
    /// Past its deadline.
    Expired,
    /// Cancelled by the merchant.
    Cancelled,
}

impl BudgetStatus {
    /// Wire name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Depleted => "depleted",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for BudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One payment drawn from a budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPayment {
    /// Caller reference.
    pub reference: String,
    /// Amount drawn.
    pub amount: Decimal,
    /// When it was accepted.
    pub timestamp: UnixTimestamp,
    /// Opaque caller data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// A spending envelope consumed by many small payments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBudget {
    /// Unique budget id.
    pub budget_id: String,
    /// Merchant the budget is spent with.
    pub merchant_id: String,
    /// Key of the user who funded the budget.
    pub user_public_key: String,
    /// Amount plus fee, as funded.
    pub total_amount: Decimal,
    /// What is left to spend. Never increases.
    pub remaining_amount: Decimal,
    /// Fee charged at creation.
    pub fee_amount: Decimal,
    /// Lifecycle status.
    pub status: BudgetStatus,
    /// Creation time.
    pub created_at: UnixTimestamp,
    /// Spending deadline.
    pub expires_at: UnixTimestamp,
    /// Accepted payments, oldest first.
    #[serde(default)]
    pub payments: Vec<BudgetPayment>,
    /// Where lifecycle events are delivered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    /// Opaque caller data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SessionBudget {
    fn event(&self, kind: EventKind, now: UnixTimestamp) -> WebhookEvent {
        WebhookEvent {
            event: kind,
            session_id: None,
            budget_id: Some(self.budget_id.clone()),
            channel_id: None,
            merchant_id: self.merchant_id.clone(),
            amount: self.total_amount,
            fee_amount: Some(self.fee_amount),
            status: self.status.as_str().to_owned(),
            timestamp: now,
            deposit_address: None,
            signature: None,
        }
    }

    fn expired_error(&self) -> SettlementError {
        SettlementError::Expired {
            kind: RecordKind::Budget,
            id: self.budget_id.clone(),
            expires_at: self.expires_at,
        }
    }
}

impl Observe for SessionBudget {
    fn observe(&mut self, now: UnixTimestamp) -> bool {
        if self.status == BudgetStatus::Active && self.expires_at.has_passed(now) {
            self.status = BudgetStatus::Expired;
            true
        } else {
            false
        }
    }
}

/// Request to open a budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateBudgetRequest {
    /// Merchant the budget is spent with.
    pub merchant_id: String,
    /// Spendable amount, before fee.
    pub amount: Decimal,
    /// Lifetime in seconds.
    pub duration: u64,
    /// Key of the funding user.
    pub user_public_key: String,
    /// Opaque caller data.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Where lifecycle events are delivered.
    #[serde(default)]
    pub webhook_url: Option<String>,
}

/// Request to draw from a budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPaymentRequest {
    /// Budget to draw from.
    pub budget_id: String,
    /// Amount to draw.
    pub amount: Decimal,
    /// Caller reference.
    pub reference: String,
    /// Opaque caller data.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

/// Result of [`SessionBudgetManager::pay_from_budget`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BudgetPaymentResult {
    /// Budget id.
    pub budget_id: String,
    /// What is left after this payment.
    pub remaining_amount: Decimal,
    /// Status after this payment.
    pub status: BudgetStatus,
}

/// Owns budgets.
#[derive(Debug, Clone)]
pub struct SessionBudgetManager {
    store: Arc<dyn RecordStore<SessionBudget>>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    fee_rate: FeeRate,
}

impl SessionBudgetManager {
    /// Creates a manager with an in-memory store.
    #[must_use]
    pub fn new(fee_rate: FeeRate) -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            events: Arc::new(NoopSink),
            clock: Arc::new(SystemClock),
            fee_rate,
        }
    }

    /// Replaces the record store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn RecordStore<SessionBudget>>) -> Self {
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

    /// Opens an active budget.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty merchant or key, a non-positive amount
    /// or a zero duration.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.budget.create", skip_all, fields(merchant_id = %request.merchant_id), err)
    )]
    pub async fn create_budget(
        &self,
        request: CreateBudgetRequest,
    ) -> Result<SessionBudget, SettlementError> {
        let merchant_id = request.merchant_id.trim();
        if merchant_id.is_empty() {
            return Err(SettlementError::InvalidRequest("merchantId is required".to_owned()));
        }
        let user_public_key = request.user_public_key.trim();
        if user_public_key.is_empty() {
            return Err(SettlementError::InvalidAddress(
                "userPublicKey is required".to_owned(),
            ));
        }
        let amount = validate_amount(request.amount)?;
        if request.duration == 0 {
            return Err(SettlementError::InvalidRequest(
                "duration must be at least one second".to_owned(),
            ));
        }
        let fee_amount = self.fee_rate.fee_for(amount)?;
        let total_amount = checked_total(amount, fee_amount)?;
        let webhook_url = validate_webhook_url(request.webhook_url)?;

        let now = self.clock.now();
        let budget = SessionBudget {
            budget_id: Uuid::new_v4().to_string(),
            merchant_id: merchant_id.to_owned(),
            user_public_key: user_public_key.to_owned(),
            total_amount,
            remaining_amount: amount,
            fee_amount,
            status: BudgetStatus::Active,
            created_at: now,
            expires_at: now + request.duration,
            payments: Vec::new(),
            webhook_url,
            metadata: request.metadata,
        };
        self.store.insert(&budget.budget_id, budget.clone()).await?;

        #[cfg(feature = "telemetry")]
        tracing::info!(budget_id = %budget.budget_id, total = %budget.total_amount, "Budget created");

        notify(
            self.events.as_ref(),
            budget.webhook_url.as_deref(),
            budget.event(EventKind::BudgetCreated, now),
        );
        Ok(budget)
    }

    /// Draws `amount` from a budget.
    ///
    /// The amount is validated first. The budget's expiry is then applied, so a budget
    /// past its deadline fails [`SettlementError::Expired`] and stays expired. A
    /// cancelled budget fails [`SettlementError::InvalidState`]; a depleted one, or an
    /// amount above what is left, fails [`SettlementError::InsufficientBudget`].
    ///
    /// # Errors
    ///
    /// See above; also [`SettlementError::NotFound`] for unknown ids.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.budget.pay", skip_all, fields(budget_id = %request.budget_id), err)
    )]
    pub async fn pay_from_budget(
        &self,
        request: BudgetPaymentRequest,
    ) -> Result<BudgetPaymentResult, SettlementError> {
        let amount = validate_amount(request.amount)?;
        let reference = request.reference.trim();
        if reference.is_empty() {
            return Err(SettlementError::InvalidRequest("reference is required".to_owned()));
        }

        let now = self.clock.now();
        let (result, depleted) = mutate(
            self.store.as_ref(),
            RecordKind::Budget,
            &request.budget_id,
            |budget| {
                let observed = budget.observe(now);
                match budget.status {
                    BudgetStatus::Active => {}
                    BudgetStatus::Expired => return refuse(observed, budget.expired_error()),
                    BudgetStatus::Cancelled => {
                        return refuse(
                            observed,
                            SettlementError::InvalidState {
                                kind: RecordKind::Budget,
                                id: budget.budget_id.clone(),
                                status: budget.status.as_str().to_owned(),
                                operation: "pay from",
                            },
                        );
                    }
                    BudgetStatus::Depleted => {
                        return refuse(
                            observed,
                            SettlementError::InsufficientBudget {
                                requested: amount,
                                remaining: budget.remaining_amount,
                            },
                        );
                    }
                }
                if amount > budget.remaining_amount {
                    return Err(SettlementError::InsufficientBudget {
                        requested: amount,
                        remaining: budget.remaining_amount,
                    });
                }

                budget.remaining_amount -= amount;
                budget.payments.push(BudgetPayment {
                    reference: reference.to_owned(),
                    amount,
                    timestamp: now,
                    metadata: request.metadata.clone(),
                });
                let depleted = budget.remaining_amount <= Decimal::ZERO;
                if depleted {
                    budget.status = BudgetStatus::Depleted;
                }
                let result = BudgetPaymentResult {
                    budget_id: budget.budget_id.clone(),
                    remaining_amount: budget.remaining_amount,
                    status: budget.status,
                };
                Ok(Step::Commit((result, depleted.then(|| budget.clone()))))
            },
        )
        .await?;

        if let Some(budget) = depleted {
            #[cfg(feature = "telemetry")]
            tracing::info!(budget_id = %budget.budget_id, "Budget depleted");
            notify(
                self.events.as_ref(),
                budget.webhook_url.as_deref(),
                budget.event(EventKind::BudgetDepleted, now),
            );
        }
        Ok(result)
    }

    /// Returns the budget, applying expiry if its deadline has passed.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::NotFound`] for unknown ids.
    pub async fn get_budget_status(&self, budget_id: &str) -> Result<SessionBudget, SettlementError> {
        observe_record(
            self.store.as_ref(),
            RecordKind::Budget,
            budget_id,
            self.clock.now(),
        )
        .await
    }

    /// Cancels an active budget. Cancelling twice is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`SettlementError::InvalidState`] for depleted or expired budgets and
    /// [`SettlementError::NotFound`] for unknown ids.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.budget.cancel", skip(self), err)
    )]
    pub async fn cancel_budget(&self, budget_id: &str) -> Result<SessionBudget, SettlementError> {
        let now = self.clock.now();
        mutate(
            self.store.as_ref(),
            RecordKind::Budget,
            budget_id,
            |budget| {
                let observed = budget.observe(now);
                match budget.status {
                    BudgetStatus::Active => {
                        budget.status = BudgetStatus::Cancelled;
                        Ok(Step::Commit(budget.clone()))
                    }
                    BudgetStatus::Cancelled => Ok(Step::Skip(budget.clone())),
                    status => refuse(
                        observed,
                        SettlementError::InvalidState {
                            kind: RecordKind::Budget,
                            id: budget.budget_id.clone(),
                            status: status.as_str().to_owned(),
                            operation: "cancel",
                        },
                    ),
                }
            },
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingSink;
    use crate::timestamp::ManualClock;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn manager() -> (SessionBudgetManager, Arc<ManualClock>, Arc<RecordingSink>) {
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(5_000)));
        let events = Arc::new(RecordingSink::new());
        let manager = SessionBudgetManager::new(FeeRate::default())
            .with_clock(clock.clone())
            .with_events(events.clone());
        (manager, clock, events)
    }

    fn create(amount: &str, duration: u64) -> CreateBudgetRequest {
        CreateBudgetRequest {
            merchant_id: "merchant-1".into(),
            amount: dec(amount),
            duration,
            user_public_key: "UserKey111".into(),
            metadata: None,
            webhook_url: Some("https://merchant.example/hooks".into()),
        }
    }

    fn pay(budget_id: &str, amount: &str, reference: &str) -> BudgetPaymentRequest {
        BudgetPaymentRequest {
            budget_id: budget_id.into(),
            amount: dec(amount),
            reference: reference.into(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn fee_is_charged_once_at_creation() {
        let (manager, _, events) = manager();
        let budget = manager.create_budget(create("1.0", 3600)).await.unwrap();
        assert_eq!(budget.fee_amount, dec("0.005"));
        assert_eq!(budget.total_amount, dec("1.005"));
        assert_eq!(budget.remaining_amount, dec("1"));
        assert_eq!(budget.status, BudgetStatus::Active);
        assert_eq!(events.count(EventKind::BudgetCreated), 1);
    }

    #[tokio::test]
    async fn rejects_invalid_creation() {
        let (manager, _, _) = manager();
        assert!(matches!(
            manager.create_budget(create("1", 0)).await,
            Err(SettlementError::InvalidRequest(_))
        ));
        assert!(matches!(
            manager.create_budget(create("-1", 10)).await,
            Err(SettlementError::InvalidAmount(_))
        ));
        let mut no_key = create("1", 10);
        no_key.user_public_key = String::new();
        assert!(matches!(
            manager.create_budget(no_key).await,
            Err(SettlementError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn spends_down_to_depleted() {
        let (manager, _, events) = manager();
        let id = manager.create_budget(create("1.0", 3600)).await.unwrap().budget_id;

        let first = manager.pay_from_budget(pay(&id, "0.4", "r1")).await.unwrap();
        assert_eq!(first.remaining_amount, dec("0.6"));
        assert_eq!(first.status, BudgetStatus::Active);

        let second = manager.pay_from_budget(pay(&id, "0.6", "r2")).await.unwrap();
        assert_eq!(second.remaining_amount, Decimal::ZERO);
        assert_eq!(second.status, BudgetStatus::Depleted);
        assert_eq!(events.count(EventKind::BudgetDepleted), 1);

        let third = manager.pay_from_budget(pay(&id, "0.01", "r3")).await;
        assert!(matches!(third, Err(SettlementError::InsufficientBudget { .. })));

        let stored = manager.get_budget_status(&id).await.unwrap();
        let references: Vec<_> = stored.payments.iter().map(|p| p.reference.as_str()).collect();
        assert_eq!(references, ["r1", "r2"]);
    }

    #[tokio::test]
    async fn overspend_leaves_budget_untouched() {
        let (manager, _, _) = manager();
        let id = manager.create_budget(create("1", 3600)).await.unwrap().budget_id;
        let err = manager.pay_from_budget(pay(&id, "1.5", "r")).await.unwrap_err();
        assert_eq!(
            err,
            SettlementError::InsufficientBudget {
                requested: dec("1.5"),
                remaining: dec("1"),
            }
        );
        let stored = manager.get_budget_status(&id).await.unwrap();
        assert_eq!(stored.remaining_amount, dec("1"));
        assert!(stored.payments.is_empty());
    }

    #[tokio::test]
    async fn expiry_is_applied_and_sticky() {
        let (manager, clock, _) = manager();
        let id = manager.create_budget(create("1", 1)).await.unwrap().budget_id;
        clock.advance(2);

        let err = manager.pay_from_budget(pay(&id, "0.1", "late")).await.unwrap_err();
        assert!(matches!(err, SettlementError::Expired { .. }));
        assert_eq!(
            manager.get_budget_status(&id).await.unwrap().status,
            BudgetStatus::Expired
        );

        clock.set(UnixTimestamp::from_secs(5_000));
        assert_eq!(
            manager.get_budget_status(&id).await.unwrap().status,
            BudgetStatus::Expired
        );
        assert!(matches!(
            manager.pay_from_budget(pay(&id, "0.1", "again")).await,
            Err(SettlementError::Expired { .. })
        ));
    }

    #[tokio::test]
    async fn reading_observes_expiry() {
        let (manager, clock, _) = manager();
        let id = manager.create_budget(create("1", 60)).await.unwrap().budget_id;
        clock.advance(60);
        assert_eq!(
            manager.get_budget_status(&id).await.unwrap().status,
            BudgetStatus::Active
        );
        clock.advance(1);
        assert_eq!(
            manager.get_budget_status(&id).await.unwrap().status,
            BudgetStatus::Expired
        );
    }

    #[tokio::test]
    async fn cancelled_budget_refuses_payments() {
        let (manager, _, _) = manager();
        let id = manager.create_budget(create("1", 3600)).await.unwrap().budget_id;
        let cancelled = manager.cancel_budget(&id).await.unwrap();
        assert_eq!(cancelled.status, BudgetStatus::Cancelled);
        assert_eq!(
            manager.cancel_budget(&id).await.unwrap().status,
            BudgetStatus::Cancelled
        );

        let err = manager.pay_from_budget(pay(&id, "0.1", "r")).await.unwrap_err();
        assert!(matches!(err, SettlementError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn cannot_cancel_an_expired_budget() {
        let (manager, clock, _) = manager();
        let id = manager.create_budget(create("1", 10)).await.unwrap().budget_id;
        clock.advance(11);
        assert!(matches!(
            manager.cancel_budget(&id).await,
            Err(SettlementError::InvalidState { .. })
        ));
        assert_eq!(
            manager.get_budget_status(&id).await.unwrap().status,
            BudgetStatus::Expired
        );
    }

    #[tokio::test]
    async fn unknown_budget_is_not_found() {
        let (manager, _, _) = manager();
        assert_eq!(
            manager.get_budget_status("nope").await,
            Err(SettlementError::not_found(RecordKind::Budget, "nope"))
        );
        assert!(matches!(
            manager.pay_from_budget(pay("nope", "1", "r")).await,
            Err(SettlementError::NotFound { .. })
        ));
    }
}

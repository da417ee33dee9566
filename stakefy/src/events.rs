//! Lifecycle events and the sink that delivers them.
//!
//! Managers hand events to an [`EventSink`] after a state transition has been
//! committed. Sinks must not block and must never report failure back to the
//! manager: delivery is fire-and-forget.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::SettlementError;
use crate::timestamp::UnixTimestamp;

/// Kinds of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A payment session was created.
    #[serde(rename = "payment.created")]
    PaymentCreated,
    /// A payment session was found paid.
    #[serde(rename = "payment.completed")]
    PaymentCompleted,
    /// A payment session expired unpaid.
    #[serde(rename = "payment.failed")]
    PaymentFailed,
    /// A budget was created.
    #[serde(rename = "budget.created")]
    BudgetCreated,
    /// A budget was spent down to zero.
    #[serde(rename = "budget.depleted")]
    BudgetDepleted,
    /// A channel was opened.
    #[serde(rename = "channel.opened")]
    ChannelOpened,
    /// A channel was settled on the ledger.
    #[serde(rename = "channel.settled")]
    ChannelSettled,
}

impl EventKind {
    /// Wire name, e.g. `payment.completed`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PaymentCreated => "payment.created",
            Self::PaymentCompleted => "payment.completed",
            Self::PaymentFailed => "payment.failed",
            Self::BudgetCreated => "budget.created",
            Self::BudgetDepleted => "budget.depleted",
            Self::ChannelOpened => "channel.opened",
            Self::ChannelSettled => "channel.settled",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload delivered to a webhook URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    /// Event kind.
    pub event: EventKind,
    /// Session the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Budget the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_id: Option<String>,
    /// Channel the event concerns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    /// Merchant that owns the record.
    pub merchant_id: String,
    /// Principal amount (session amount, budget amount, channel deposit).
    pub amount: Decimal,
    /// Facilitator fee, where one applies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fee_amount: Option<Decimal>,
    /// Record status after the transition.
    pub status: String,
    /// When the event was raised.
    pub timestamp: UnixTimestamp,
    /// Deposit address for sessions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deposit_address: Option<String>,
    /// Settlement transaction, when funds moved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Receiver of lifecycle events.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Queues `event` for delivery to `url`. Must return without waiting on I/O.
    fn dispatch(&self, url: &str, event: WebhookEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn dispatch(&self, _url: &str, _event: WebhookEvent) {}
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(String, WebhookEvent)>>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything dispatched so far, with its target URL.
    #[must_use]
    pub fn events(&self) -> Vec<(String, WebhookEvent)> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of dispatched events of `kind`.
    #[must_use]
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| e.event == kind)
            .count()
    }
}

impl EventSink for RecordingSink {
    fn dispatch(&self, url: &str, event: WebhookEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((url.to_owned(), event));
    }
}

/// Checks that a caller-supplied webhook URL is an absolute `http(s)` URL.
///
/// # Errors
///
/// Returns [`SettlementError::InvalidRequest`] for anything else.
pub fn validate_webhook_url(url: Option<String>) -> Result<Option<String>, SettlementError> {
    let Some(raw) = url.filter(|u| !u.trim().is_empty()) else {
        return Ok(None);
    };
    let parsed = Url::parse(raw.trim())
        .map_err(|e| SettlementError::InvalidRequest(format!("webhookUrl is not a valid URL: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(SettlementError::InvalidRequest(format!(
            "webhookUrl must use http or https, got {}",
            parsed.scheme()
        )));
    }
    Ok(Some(parsed.into()))
}

/// Dispatches `event` if the record has a webhook URL.
pub(crate) fn notify(sink: &dyn EventSink, url: Option<&str>, event: WebhookEvent) {
    if let Some(url) = url {
        #[cfg(feature = "telemetry")]
        tracing::debug!(event = %event.event, url, "Dispatching webhook event");
        sink.dispatch(url, event);
    }
}

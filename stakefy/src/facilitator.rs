//! The three settlement managers wired to one ledger.
//!
//! Transports hold a single [`Facilitator`] and reach each manager through it. All
//! managers share the ledger, event sink and clock, and the fee rate and retry policy
//! come from one [`SessionConfig`].

use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;

use crate::budget::SessionBudgetManager;
use crate::channel::PaymentChannelManager;
use crate::events::EventSink;
use crate::ledger::Ledger;
use crate::session::{PaymentSessionManager, SessionConfig};
use crate::timestamp::Clock;

/// Settlement kinds a facilitator offers.
pub const SETTLEMENT_KINDS: [&str; 3] = ["session", "budget", "channel"];

/// What a facilitator supports, as advertised to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SupportedResponse {
    /// Fee charged on sessions and budgets, as a percentage.
    pub fee_percentage: Decimal,
    /// Session funding window in seconds.
    pub session_ttl_secs: u64,
    /// Offered settlement kinds.
    pub kinds: Vec<&'static str>,
    /// SPL token mint payments are made in.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_mint: Option<String>,
}

/// Session, budget and channel managers sharing one ledger.
#[derive(Debug, Clone)]
pub struct Facilitator {
    sessions: PaymentSessionManager,
    budgets: SessionBudgetManager,
    channels: PaymentChannelManager,
}

impl Facilitator {
    /// Builds all three managers with in-memory stores.
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, config: SessionConfig) -> Self {
        let budgets = SessionBudgetManager::new(config.fee_rate);
        let channels = PaymentChannelManager::new(Arc::clone(&ledger), config.retry);
        let sessions = PaymentSessionManager::new(ledger, config);
        Self {
            sessions,
            budgets,
            channels,
        }
    }

    /// Routes lifecycle events of every manager to `events`.
    #[must_use]
    pub fn with_events(self, events: Arc<dyn EventSink>) -> Self {
        Self {
            sessions: self.sessions.with_events(Arc::clone(&events)),
            budgets: self.budgets.with_events(Arc::clone(&events)),
            channels: self.channels.with_events(events),
        }
    }

    /// Drives every manager from `clock`.
    #[must_use]
    pub fn with_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self {
            sessions: self.sessions.with_clock(Arc::clone(&clock)),
            budgets: self.budgets.with_clock(Arc::clone(&clock)),
            channels: self.channels.with_clock(clock),
        }
    }

    /// One-time payment sessions.
    #[must_use]
    pub const fn sessions(&self) -> &PaymentSessionManager {
        &self.sessions
    }

    /// Spending budgets.
    #[must_use]
    pub const fn budgets(&self) -> &SessionBudgetManager {
        &self.budgets
    }

    /// Payment channels.
    #[must_use]
    pub const fn channels(&self) -> &PaymentChannelManager {
        &self.channels
    }

    /// Describes what this facilitator offers.
    #[must_use]
    pub fn supported(&self) -> SupportedResponse {
        let config = self.sessions.config();
        SupportedResponse {
            fee_percentage: config.fee_rate.percentage(),
            session_ttl_secs: config.ttl_secs,
            kinds: SETTLEMENT_KINDS.to_vec(),
            token_mint: config.token_mint.clone(),
        }
    }
}

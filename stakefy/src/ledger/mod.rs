//! Ledger gateway abstraction.
//!
//! The managers never talk to a blockchain directly. They go through the [`Ledger`]
//! trait, which exposes the four capabilities settlement needs: fresh deposit
//! addresses, balance checks, transfers and transaction lookups.
//!
//! - [`memory`] - In-process ledger for development and tests
//! - [`retry`] - Backoff policy applied to transient ledger failures

pub mod memory;
pub mod retry;

use std::fmt;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{RecordKind, SettlementError};
use crate::timestamp::UnixTimestamp;

pub use memory::InMemoryLedger;
pub use retry::RetryPolicy;

/// Opaque reference to a ledger transaction (a transaction signature on Solana).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionRef(String);

impl TransactionRef {
    /// Wraps a raw transaction reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// Returns the reference as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consumes the wrapper.
    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for TransactionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One destination of a (possibly multi-destination) transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferLeg {
    /// Destination address.
    pub to: String,
    /// Amount moved to `to`.
    pub amount: Decimal,
}

impl TransferLeg {
    /// Creates a leg.
    pub fn new(to: impl Into<String>, amount: Decimal) -> Self {
        Self {
            to: to.into(),
            amount,
        }
    }
}

/// Idempotency key for the single settlement transfer of a record.
///
/// Stable for the lifetime of the record, so every retry of a settlement, including a
/// new settle call after a released claim, can land at most once.
#[must_use]
pub fn settlement_key(kind: RecordKind, id: &str) -> String {
    format!("stakefy:{kind}:settle:{id}")
}

/// A confirmed ledger transaction as reported by [`Ledger::get_transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
    /// Transaction reference.
    pub reference: TransactionRef,
    /// Source address (the payer).
    pub from: String,
    /// Destinations and amounts.
    pub legs: Vec<TransferLeg>,
    /// Block height (slot) the transaction landed in.
    pub block_height: u64,
    /// Block time, when the ledger reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_time: Option<UnixTimestamp>,
    /// `false` if the transaction landed but failed.
    pub succeeded: bool,
}

impl TransactionRecord {
    /// Sum of all legs.
    #[must_use]
    pub fn total(&self) -> Decimal {
        self.legs.iter().map(|leg| leg.amount).sum()
    }
}

/// Failures reported by a [`Ledger`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// The ledger could not be reached.
    #[error("ledger unreachable: {0}")]
    Unavailable(String),
    /// The ledger did not answer in time. The outcome is unknown.
    #[error("ledger request timed out: {0}")]
    Timeout(String),
    /// The ledger refused the request.
    #[error("ledger rejected request: {0}")]
    Rejected(String),
}

impl LedgerError {
    /// Transient failures are retried by [`RetryPolicy`].
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout(_))
    }
}

impl From<LedgerError> for SettlementError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::Unavailable(msg) | LedgerError::Timeout(msg) => {
                Self::LedgerUnavailable(msg)
            }
            LedgerError::Rejected(msg) => Self::LedgerRejected(msg),
        }
    }
}

/// Capability to move and observe funds on the underlying ledger.
///
/// Implementations hold whatever key material is needed to move funds out of the
/// deposit addresses they generate; that material never leaves the implementation.
#[async_trait]
pub trait Ledger: Send + Sync + fmt::Debug {
    /// Allocates a fresh address that the ledger can later spend from.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the address cannot be allocated.
    async fn generate_deposit_address(&self) -> Result<String, LedgerError>;

    /// Returns `true` if `address` holds at least `min_amount`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the balance cannot be read.
    async fn check_balance(&self, address: &str, min_amount: Decimal) -> Result<bool, LedgerError>;

    /// Moves `amount` from `from` to `to` as a single-leg [`Ledger::transfer_many`]
    /// without an idempotency key.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the transfer is refused or the ledger is unreachable.
    async fn transfer(
        &self,
        from: &str,
        to: &str,
        amount: Decimal,
    ) -> Result<TransactionRef, LedgerError> {
        self.transfer_many(from, &[TransferLeg::new(to, amount)], None)
            .await
    }

    /// Looks up a transaction by reference. `Ok(None)` means unknown.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError`] if the ledger is unreachable.
    async fn get_transaction(
        &self,
        reference: &TransactionRef,
    ) -> Result<Option<TransactionRecord>, LedgerError>;

    /// Moves funds from `from` to every leg in one atomic transaction: either all legs
    /// land or none do.
    ///
    /// When `idempotency_key` is set, a repeated call with the same key and the same
    /// transfer must not move funds again and returns the reference of the transfer
    /// that already landed. A key reused for a different transfer is rejected. This is
    /// what makes retrying after [`LedgerError::Timeout`] safe.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Rejected`] for an empty leg list, a non-positive leg, a
    /// reused key or insufficient funds, and a transient [`LedgerError`] otherwise.
    async fn transfer_many(
        &self,
        from: &str,
        legs: &[TransferLeg],
        idempotency_key: Option<&str>,
    ) -> Result<TransactionRef, LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_errors_map_onto_taxonomy() {
        assert_eq!(
            SettlementError::from(LedgerError::Timeout("slow".into())),
            SettlementError::LedgerUnavailable("slow".into())
        );
        assert_eq!(
            SettlementError::from(LedgerError::Rejected("nope".into())),
            SettlementError::LedgerRejected("nope".into())
        );
        assert!(LedgerError::Unavailable(String::new()).is_transient());
        assert!(!LedgerError::Rejected(String::new()).is_transient());
    }

    #[test]
    fn transaction_total_sums_legs() {
        let record = TransactionRecord {
            reference: TransactionRef::new("sig"),
            from: "payer".into(),
            legs: vec![
                TransferLeg::new("a", Decimal::new(15, 1)),
                TransferLeg::new("b", Decimal::new(5, 1)),
            ],
            block_height: 7,
            block_time: None,
            succeeded: true,
        };
        assert_eq!(record.total(), Decimal::TWO);
    }

    #[test]
    fn settlement_keys_are_stable_per_record() {
        assert_eq!(
            settlement_key(RecordKind::Channel, "c-1"),
            "stakefy:channel:settle:c-1"
        );
        assert_ne!(
            settlement_key(RecordKind::Session, "x"),
            settlement_key(RecordKind::Channel, "x")
        );
    }
}

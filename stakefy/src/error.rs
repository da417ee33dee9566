//! Settlement error taxonomy.
//!
//! Every manager operation fails with a [`SettlementError`]. Each variant maps to a
//! stable numeric [`ErrorCode`] so transports can expose a fixed contract, grouped by
//! category: validation `2xxx`, payment `3xxx`, facilitator `4xxx`, session `5xxx`,
//! internal `9xxx`.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize, Serializer};

use crate::amount::AmountError;
use crate::timestamp::UnixTimestamp;

/// The kind of record an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    /// A one-time payment session.
    Session,
    /// A pre-authorized spending budget.
    Budget,
    /// A deposit-backed payment channel.
    Channel,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Session => "session",
            Self::Budget => "budget",
            Self::Channel => "channel",
        })
    }
}

/// Errors returned by the session, budget and channel managers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum SettlementError {
    /// Unknown record id.
    #[error("{kind} not found: {id}")]
    NotFound {
        /// Record kind.
        kind: RecordKind,
        /// Requested id.
        id: String,
    },

    /// The operation is not valid for the record's current status.
    #[error("cannot {operation} {kind} {id} while it is {status}")]
    InvalidState {
        /// Record kind.
        kind: RecordKind,
        /// Record id.
        id: String,
        /// Status observed when the operation was attempted.
        status: String,
        /// Operation that was refused.
        operation: &'static str,
    },

    /// The record's expiry passed. The expiry transition has been persisted.
    #[error("{kind} {id} expired at {expires_at}")]
    Expired {
        /// Record kind.
        kind: RecordKind,
        /// Record id.
        id: String,
        /// The deadline that passed.
        expires_at: UnixTimestamp,
    },

    /// A channel payment would withdraw more than the deposit.
    #[error("insufficient channel balance: requested {requested}, available {available}")]
    InsufficientBalance {
        /// Amount requested by the payment.
        requested: Decimal,
        /// Balance left in the channel.
        available: Decimal,
    },

    /// A budget payment exceeds what is left in the budget.
    #[error("insufficient budget: requested {requested}, remaining {remaining}")]
    InsufficientBudget {
        /// Amount requested by the payment.
        requested: Decimal,
        /// Budget left.
        remaining: Decimal,
    },

    /// A channel payment's nonce does not advance past the last accepted one.
    #[error("nonce {nonce} rejected: channel already at nonce {current}")]
    ReplayOrOutOfOrder {
        /// Nonce carried by the rejected payment.
        nonce: u64,
        /// Last accepted nonce.
        current: u64,
    },

    /// The payment signature does not authenticate the channel owner.
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// An amount failed validation.
    #[error("invalid amount: {0}")]
    InvalidAmount(#[from] AmountError),

    /// An address or public key could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// A request argument other than the amount failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The ledger could not be reached after retries. Safe to retry later.
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// The ledger refused the transaction.
    #[error("ledger rejected transaction: {0}")]
    LedgerRejected(String),

    /// Settlement already happened for this record.
    #[error("{kind} {id} is already settled")]
    AlreadySettled {
        /// Record kind.
        kind: RecordKind,
        /// Record id.
        id: String,
    },

    /// The record store failed or stayed contended.
    #[error("storage error: {0}")]
    Storage(String),
}

impl SettlementError {
    /// Convenience constructor for [`SettlementError::NotFound`].
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns the stable external error code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::SessionNotFound,
            Self::InvalidState { .. } => ErrorCode::SessionInvalidState,
            Self::Expired {
                kind: RecordKind::Channel,
                ..
            } => ErrorCode::SessionChannelClosed,
            Self::Expired { .. } => ErrorCode::SessionExpired,
            Self::InsufficientBalance { .. } => ErrorCode::PaymentInsufficientFunds,
            Self::InsufficientBudget { .. } => ErrorCode::SessionBudgetExceeded,
            Self::ReplayOrOutOfOrder { .. } => ErrorCode::PaymentAlreadyProcessed,
            Self::InvalidSignature(_) => ErrorCode::ValidationInvalidSignature,
            Self::InvalidAmount(_) => ErrorCode::ValidationInvalidAmount,
            Self::InvalidAddress(_) => ErrorCode::ValidationInvalidAddress,
            Self::InvalidRequest(_) => ErrorCode::ValidationInvalidRequest,
            Self::LedgerUnavailable(_) => ErrorCode::FacilitatorUnavailable,
            Self::LedgerRejected(_) => ErrorCode::PaymentTransactionFailed,
            Self::AlreadySettled { .. } => ErrorCode::PaymentAlreadySettled,
            Self::Storage(_) => ErrorCode::InternalError,
        }
    }

    /// Returns `true` if the caller may retry the same request later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::LedgerUnavailable(_))
    }

    /// Builds the serializable error body for transports.
    #[must_use]
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody::new(self.code(), self.to_string(), self.is_retryable())
    }
}

/// Stable numeric error codes exposed to API clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    /// Amount is zero, negative or too precise.
    ValidationInvalidAmount = 2001,
    /// Address could not be parsed.
    ValidationInvalidAddress = 2002,
    /// Signature failed verification.
    ValidationInvalidSignature = 2003,
    /// Some other request field is missing or malformed.
    ValidationInvalidRequest = 2006,
    /// Channel deposit does not cover the payment.
    PaymentInsufficientFunds = 3001,
    /// The ledger refused the transaction.
    PaymentTransactionFailed = 3002,
    /// Replayed or out-of-order channel payment.
    PaymentAlreadyProcessed = 3003,
    /// A claimed payment does not match its ledger transaction.
    PaymentVerificationFailed = 3004,
    /// Settlement was already executed.
    PaymentAlreadySettled = 3008,
    /// Ledger unreachable.
    FacilitatorUnavailable = 4001,
    /// Unknown session, budget or channel.
    SessionNotFound = 5001,
    /// Session or budget expired.
    SessionExpired = 5002,
    /// Budget exhausted.
    SessionBudgetExceeded = 5003,
    /// Operation not allowed in the current status.
    SessionInvalidState = 5004,
    /// Channel expired and closed.
    SessionChannelClosed = 5005,
    /// Unexpected internal failure.
    InternalError = 9001,
}

impl ErrorCode {
    /// Numeric value of the code.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Upper-snake identifier, stable across releases.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::ValidationInvalidAmount => "INVALID_AMOUNT",
            Self::ValidationInvalidAddress => "INVALID_ADDRESS",
            Self::ValidationInvalidSignature => "INVALID_SIGNATURE",
            Self::ValidationInvalidRequest => "INVALID_REQUEST",
            Self::PaymentInsufficientFunds => "INSUFFICIENT_FUNDS",
            Self::PaymentTransactionFailed => "TRANSACTION_FAILED",
            Self::PaymentAlreadyProcessed => "PAYMENT_ALREADY_PROCESSED",
            Self::PaymentVerificationFailed => "VERIFICATION_FAILED",
            Self::PaymentAlreadySettled => "ALREADY_SETTLED",
            Self::FacilitatorUnavailable => "FACILITATOR_UNAVAILABLE",
            Self::SessionNotFound => "NOT_FOUND",
            Self::SessionExpired => "EXPIRED",
            Self::SessionBudgetExceeded => "BUDGET_EXCEEDED",
            Self::SessionInvalidState => "INVALID_STATE",
            Self::SessionChannelClosed => "CHANNEL_CLOSED",
            Self::InternalError => "INTERNAL_ERROR",
        }
    }

    /// Message suitable for showing to an end user.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::ValidationInvalidAmount => "The payment amount is invalid.",
            Self::ValidationInvalidAddress => "The address is invalid.",
            Self::ValidationInvalidSignature => "The payment signature could not be verified.",
            Self::ValidationInvalidRequest => "The request is missing or has invalid fields.",
            Self::PaymentInsufficientFunds => "Not enough funds are left in the channel.",
            Self::PaymentTransactionFailed => "The transaction was rejected by the network.",
            Self::PaymentAlreadyProcessed => "This payment was already processed.",
            Self::PaymentVerificationFailed => "The payment could not be verified.",
            Self::PaymentAlreadySettled => "This payment has already been settled.",
            Self::FacilitatorUnavailable => "The payment network is temporarily unavailable.",
            Self::SessionNotFound => "The payment session could not be found.",
            Self::SessionExpired => "The payment session has expired.",
            Self::SessionBudgetExceeded => "The session budget has been used up.",
            Self::SessionInvalidState => "The payment is not in a state that allows this action.",
            Self::SessionChannelClosed => "The payment channel is closed.",
            Self::InternalError => "An unexpected error occurred.",
        }
    }

    /// Suggested recovery action.
    #[must_use]
    pub const fn recovery(self) -> &'static str {
        match self {
            Self::ValidationInvalidAmount => "Use a positive amount up to 1000000000000 with at most 9 decimal places.",
            Self::ValidationInvalidAddress => "Check the address and try again.",
            Self::ValidationInvalidSignature => "Sign the payment with the channel owner's key.",
            Self::ValidationInvalidRequest => "Fix the request fields and try again.",
            Self::PaymentInsufficientFunds => "Pay a smaller amount or open a new channel.",
            Self::PaymentTransactionFailed => "Check the source balance and retry settlement.",
            Self::PaymentAlreadyProcessed => "Use a nonce greater than the last accepted one.",
            Self::PaymentVerificationFailed => "Check the transaction signature, payer and amount.",
            Self::PaymentAlreadySettled => "No action needed.",
            Self::FacilitatorUnavailable => "Retry the request after a short delay.",
            Self::SessionNotFound => "Create a new payment session.",
            Self::SessionExpired => "Create a new payment session or budget.",
            Self::SessionBudgetExceeded => "Create a new budget with a larger amount.",
            Self::SessionInvalidState => "Check the current status before retrying.",
            Self::SessionChannelClosed => "Settle the channel and open a new one.",
            Self::InternalError => "Retry later or contact support.",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_u16())
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u16(self.as_u16())
    }
}

/// JSON error body returned by transports.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    /// Numeric code.
    pub code: ErrorCode,
    /// Stable identifier for the code.
    pub error: &'static str,
    /// Detailed developer-facing message.
    pub message: String,
    /// End-user message.
    pub user_message: &'static str,
    /// Recovery hint.
    pub recovery: &'static str,
    /// Whether the request may be retried unchanged.
    pub retryable: bool,
}

impl ErrorBody {
    /// Builds a body for `code`, filling in the code's stable texts.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            code,
            error: code.name(),
            message: message.into(),
            user_message: code.user_message(),
            recovery: code.recovery(),
            retryable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_grouped_by_category() {
        let not_found = SettlementError::not_found(RecordKind::Budget, "b1");
        assert_eq!(not_found.code().as_u16(), 5001);
        assert_eq!(not_found.to_string(), "budget not found: b1");

        let replay = SettlementError::ReplayOrOutOfOrder {
            nonce: 1,
            current: 1,
        };
        assert_eq!(replay.code().as_u16(), 3003);

        let closed = SettlementError::Expired {
            kind: RecordKind::Channel,
            id: "c".into(),
            expires_at: UnixTimestamp::from_secs(1),
        };
        assert_eq!(closed.code(), ErrorCode::SessionChannelClosed);
    }

    #[test]
    fn only_ledger_unavailability_is_retryable() {
        assert!(SettlementError::LedgerUnavailable("down".into()).is_retryable());
        assert!(!SettlementError::LedgerRejected("no".into()).is_retryable());
        assert!(!SettlementError::InvalidSignature("bad".into()).is_retryable());
    }

    #[test]
    fn body_serializes_numeric_code() {
        let body = SettlementError::InvalidRequest("missing merchantId".into()).to_body();
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], 2006);
        assert_eq!(json["error"], "INVALID_REQUEST");
        assert_eq!(json["retryable"], false);
        assert!(json["userMessage"].is_string());
    }
}

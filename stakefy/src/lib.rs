#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Settlement core for x402-style micropayments.
//!
//! A merchant answers an unpaid request with HTTP 402 and one of three settlement
//! constructs, all backed by a blockchain ledger:
//!
//! - a **payment session**: one payment into a fresh deposit address, verified on the
//!   ledger and later settled to the merchant minus the facilitator fee
//! - a **budget**: a pre-funded envelope drawn down by many small payments without any
//!   ledger traffic
//! - a **channel**: a locked deposit spent by signed, nonce-ordered off-chain payments
//!   and settled in one transaction
//!
//! Records live behind a [`store::RecordStore`] and are mutated with optimistic
//! compare-and-swap, so ledger I/O never happens under a lock.
//!
//! # Modules
//!
//! - [`amount`] - Decimal amounts and fee rates
//! - [`budget`] - Session budgets
//! - [`channel`] - Payment channels
//! - [`error`] - Error taxonomy and stable error codes
//! - [`events`] - Lifecycle events and the sink they are dispatched to
//! - [`facilitator`] - All managers wired to one ledger
//! - [`ledger`] - Ledger capability, retry policy and an in-memory ledger
//! - [`lifecycle`] - Lazy expiry and settlement claims
//! - [`proof`] - Payment receipts and their integrity proofs
//! - [`session`] - One-time payment sessions
//! - [`signature`] - Ed25519 authentication of channel payments
//! - [`store`] - Versioned record storage
//! - [`timestamp`] - Unix timestamps and clocks
//!
//! # Feature Flags
//!
//! - `telemetry` - Enables tracing instrumentation

pub mod amount;
pub mod budget;
pub mod channel;
pub mod error;
pub mod events;
pub mod facilitator;
pub mod ledger;
pub mod lifecycle;
pub mod proof;
pub mod session;
pub mod signature;
pub mod store;
pub mod timestamp;

pub use error::{ErrorCode, SettlementError};
pub use facilitator::Facilitator;

#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Tower middleware that puts routes behind a stakefy payment session.
//!
//! A request carrying `X-Session-Id` of a completed session for the route's merchant
//! and price is passed through. Anything else gets `402 Payment Required` with a fresh
//! session to pay into:
//!
//! ```json
//! {
//!   "error": "Payment Required",
//!   "message": "This resource requires payment",
//!   "payment": {
//!     "sessionId": "...",
//!     "amount": "0.01",
//!     "feeAmount": "0.00005",
//!     "merchantId": "...",
//!     "depositAddress": "...",
//!     "expiresAt": "1700000900",
//!     "solanaPayUrl": "solana:..."
//!   },
//!   "instructions": ["..."]
//! }
//! ```
//!
//! The session status on the ledger is authoritative. A pending session is re-checked
//! against the ledger on each request, so the client only has to retry with the same
//! `X-Session-Id` once the deposit has landed. `X-Payment-Proof` is accepted but never
//! grants access on its own.
//!
//! ```ignore
//! use stakefy_http::PaywallLayer;
//!
//! let paywall = PaywallLayer::new(facilitator.sessions().clone(), "merchant-1", price);
//! let app = Router::new().route("/premium", get(handler)).layer(paywall);
//! ```

pub mod constants;
pub mod error;
pub mod layer;
pub mod paywall;

pub use error::PaywallError;
pub use layer::{PaywallLayer, PaywallService};
pub use paywall::{PaymentRequired, Paywall};

//! HTTP facilitator for stakefy payment sessions, budgets and channels.
//!
//! Exposes the settlement core over a REST API, delivers lifecycle webhooks and talks
//! to a remote ledger signer service.
//!
//! # Modules
//!
//! - [`config`] - TOML configuration with environment variable expansion
//! - [`error`] - API error responses
//! - [`handlers`] - Axum route handlers and router builder
//! - [`ledger_client`] - HTTP client for the remote ledger service
//! - [`util`] - Shutdown coordination
//! - [`webhook`] - Background webhook delivery

pub mod config;
pub mod error;
pub mod handlers;
pub mod ledger_client;
pub mod util;
pub mod webhook;

pub use handlers::{AppState, SharedState, facilitator_router};

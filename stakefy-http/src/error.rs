//! Paywall outcomes that end the request before it reaches the inner service.

use axum_core::response::{IntoResponse, Response};
use http::{StatusCode, header};
use stakefy::SettlementError;

use crate::paywall::PaymentRequired;

/// Why a request was not let through.
#[derive(Debug, thiserror::Error)]
pub enum PaywallError {
    /// The request must be paid for first.
    #[error("payment required: {}", .0.message)]
    PaymentRequired(Box<PaymentRequired>),
    /// The session could not be looked up or created.
    #[error(transparent)]
    Settlement(#[from] SettlementError),
}

impl PaywallError {
    /// HTTP status of the response.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            Self::Settlement(err) if err.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            Self::Settlement(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PaywallError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            Self::PaymentRequired(required) => serde_json::to_vec(required),
            Self::Settlement(err) => {
                #[cfg(feature = "telemetry")]
                tracing::error!(error = %err, "Paywall could not reach the settlement core");
                serde_json::to_vec(&err.to_body())
            }
        };
        match body {
            Ok(body) => (status, [(header::CONTENT_TYPE, "application/json")], body).into_response(),
            Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        }
    }
}

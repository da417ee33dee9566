//! Error responses for the facilitator API.
//!
//! Every error is rendered as the JSON [`ErrorBody`] carrying a stable numeric code,
//! with an HTTP status derived from the error kind.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use stakefy::error::{ErrorBody, ErrorCode};
use stakefy::proof::ReceiptError;
use stakefy::SettlementError;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A settlement operation failed.
    #[error(transparent)]
    Settlement(#[from] SettlementError),

    /// A receipt could not be verified.
    #[error(transparent)]
    Receipt(#[from] ReceiptError),

    /// The request body is not valid JSON for the endpoint.
    #[error("invalid request body: {0}")]
    InvalidBody(#[from] JsonRejection),
}

impl ApiError {
    /// HTTP status for this error.
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Settlement(err) => settlement_status(err),
            Self::Receipt(ReceiptError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Receipt(ReceiptError::Ledger(err)) => {
                settlement_status(&SettlementError::from(err.clone()))
            }
            Self::Receipt(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidBody(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::Settlement(err) => err.to_body(),
            Self::Receipt(err) => err.to_body(),
            Self::InvalidBody(rejection) => {
                ErrorBody::new(ErrorCode::ValidationInvalidRequest, rejection.body_text(), false)
            }
        }
    }
}

fn settlement_status(err: &SettlementError) -> StatusCode {
    match err {
        SettlementError::NotFound { .. } => StatusCode::NOT_FOUND,
        SettlementError::InvalidState { .. }
        | SettlementError::AlreadySettled { .. }
        | SettlementError::ReplayOrOutOfOrder { .. } => StatusCode::CONFLICT,
        SettlementError::Expired { .. } => StatusCode::GONE,
        SettlementError::InsufficientBalance { .. } | SettlementError::InsufficientBudget { .. } => {
            StatusCode::PAYMENT_REQUIRED
        }
        SettlementError::InvalidSignature(_) => StatusCode::UNAUTHORIZED,
        SettlementError::InvalidAmount(_)
        | SettlementError::InvalidAddress(_)
        | SettlementError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        SettlementError::LedgerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        SettlementError::LedgerRejected(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "Request rejected");
        }
        (status, Json(self.body())).into_response()
    }
}

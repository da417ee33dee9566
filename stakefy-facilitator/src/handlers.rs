//! Axum route handlers for the facilitator REST API.
//!
//! Paths mirror the merchant SDK: `/api/payment/*` for one-time sessions,
//! `/api/budget/*` for pre-funded budgets, `/api/channel/*` for payment channels and
//! `/api/receipt/*` for receipt checks. Request and response bodies are camelCase JSON.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use stakefy::Facilitator;
use stakefy::budget::{
    BudgetPaymentRequest, BudgetPaymentResult, CreateBudgetRequest, SessionBudget,
};
use stakefy::channel::{
    ChannelPaymentRequest, ChannelPaymentResult, ChannelSettlement, CreateChannelRequest,
    PaymentChannel,
};
use stakefy::facilitator::SupportedResponse;
use stakefy::ledger::Ledger;
use stakefy::proof::{
    PaymentReceipt, ReceiptQuery, VerifiedSession, validate_proof, verify_receipt,
    verify_session,
};
use stakefy::session::{
    CreatePaymentRequest, PaymentSession, PaymentSettlement, PaymentVerification,
};

use crate::error::ApiError;

/// State shared by all handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Settlement managers.
    pub facilitator: Facilitator,
    /// Ledger used for receipt lookups.
    pub ledger: Arc<dyn Ledger>,
}

/// Shared application state for the facilitator service.
pub type SharedState = Arc<AppState>;

type JsonBody<T> = Result<Json<T>, JsonRejection>;

/// Body of `POST /api/payment/verify`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentBody {
    /// Session to check.
    pub session_id: String,
}

/// Body of `POST /api/payment/settle`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlePaymentBody {
    /// Session to settle.
    pub session_id: String,
    /// Merchant destination address.
    pub merchant_address: String,
}

/// Body of `POST /api/channel/settle`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettleChannelBody {
    /// Channel to settle.
    pub channel_id: String,
    /// Merchant destination address.
    pub merchant_address: String,
}

/// Body of `POST /api/receipt/session`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySessionBody {
    /// Caller-chosen label for the aggregate.
    pub session_id: String,
    /// Transactions to verify.
    pub payments: Vec<ReceiptQuery>,
}

/// Result of `POST /api/receipt/validate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofValidation {
    /// Whether the receipt's proof matches its fields.
    pub valid: bool,
}

/// `POST /api/payment/create`
///
/// # Errors
///
/// Returns 400 on invalid input, 503 if no deposit address could be allocated.
pub async fn create_payment(
    State(state): State<SharedState>,
    payload: JsonBody<CreatePaymentRequest>,
) -> Result<Json<PaymentSession>, ApiError> {
    let Json(body) = payload?;
    let session = state.facilitator.sessions().create_payment(body).await?;
    Ok(Json(session))
}

/// `POST /api/payment/verify`
///
/// # Errors
///
/// Returns 404 for unknown sessions, 503 if the ledger cannot be reached.
pub async fn verify_payment(
    State(state): State<SharedState>,
    payload: JsonBody<VerifyPaymentBody>,
) -> Result<Json<PaymentVerification>, ApiError> {
    let Json(body) = payload?;
    let verification = state
        .facilitator
        .sessions()
        .verify_payment(&body.session_id)
        .await?;
    Ok(Json(verification))
}

/// `POST /api/payment/settle`
///
/// # Errors
///
/// Returns 409 unless the session is completed and unsettled.
pub async fn settle_payment(
    State(state): State<SharedState>,
    payload: JsonBody<SettlePaymentBody>,
) -> Result<Json<PaymentSettlement>, ApiError> {
    let Json(body) = payload?;
    let settlement = state
        .facilitator
        .sessions()
        .settle_payment(&body.session_id, &body.merchant_address)
        .await?;
    Ok(Json(settlement))
}

/// `GET /api/payment/status/{sessionId}`
///
/// # Errors
///
/// Returns 404 for unknown sessions.
pub async fn payment_status(
    State(state): State<SharedState>,
    Path(session_id): Path<String>,
) -> Result<Json<PaymentSession>, ApiError> {
    let session = state.facilitator.sessions().get_status(&session_id).await?;
    Ok(Json(session))
}

/// `POST /api/budget/create`
///
/// # Errors
///
/// Returns 400 on invalid input.
pub async fn create_budget(
    State(state): State<SharedState>,
    payload: JsonBody<CreateBudgetRequest>,
) -> Result<Json<SessionBudget>, ApiError> {
    let Json(body) = payload?;
    let budget = state.facilitator.budgets().create_budget(body).await?;
    Ok(Json(budget))
}

/// `POST /api/budget/payment`
///
/// # Errors
///
/// Returns 402 when the budget cannot cover the amount, 410 once it has expired.
pub async fn budget_payment(
    State(state): State<SharedState>,
    payload: JsonBody<BudgetPaymentRequest>,
) -> Result<Json<BudgetPaymentResult>, ApiError> {
    let Json(body) = payload?;
    let result = state.facilitator.budgets().pay_from_budget(body).await?;
    Ok(Json(result))
}

/// `GET /api/budget/{budgetId}`
///
/// # Errors
///
/// Returns 404 for unknown budgets.
pub async fn budget_status(
    State(state): State<SharedState>,
    Path(budget_id): Path<String>,
) -> Result<Json<SessionBudget>, ApiError> {
    let budget = state
        .facilitator
        .budgets()
        .get_budget_status(&budget_id)
        .await?;
    Ok(Json(budget))
}

/// `POST /api/budget/{budgetId}/cancel`
///
/// # Errors
///
/// Returns 409 if the budget is no longer active.
pub async fn cancel_budget(
    State(state): State<SharedState>,
    Path(budget_id): Path<String>,
) -> Result<Json<SessionBudget>, ApiError> {
    let budget = state.facilitator.budgets().cancel_budget(&budget_id).await?;
    Ok(Json(budget))
}

/// `POST /api/channel/create`
///
/// # Errors
///
/// Returns 400 on invalid input or a malformed user key.
pub async fn create_channel(
    State(state): State<SharedState>,
    payload: JsonBody<CreateChannelRequest>,
) -> Result<Json<PaymentChannel>, ApiError> {
    let Json(body) = payload?;
    let channel = state.facilitator.channels().create_channel(body).await?;
    Ok(Json(channel))
}

/// `POST /api/channel/payment`
///
/// # Errors
///
/// Returns 401 for bad signatures, 409 for replayed nonces, 402 when the channel
/// balance is too low.
pub async fn channel_payment(
    State(state): State<SharedState>,
    payload: JsonBody<ChannelPaymentRequest>,
) -> Result<Json<ChannelPaymentResult>, ApiError> {
    let Json(body) = payload?;
    let result = state
        .facilitator
        .channels()
        .make_channel_payment(body)
        .await?;
    Ok(Json(result))
}

/// `POST /api/channel/settle`
///
/// # Errors
///
/// Returns 409 if the channel is already settled or being settled.
pub async fn settle_channel(
    State(state): State<SharedState>,
    payload: JsonBody<SettleChannelBody>,
) -> Result<Json<ChannelSettlement>, ApiError> {
    let Json(body) = payload?;
    let settlement = state
        .facilitator
        .channels()
        .settle_channel(&body.channel_id, &body.merchant_address)
        .await?;
    Ok(Json(settlement))
}

/// `GET /api/channel/{channelId}`
///
/// # Errors
///
/// Returns 404 for unknown channels.
pub async fn channel_status(
    State(state): State<SharedState>,
    Path(channel_id): Path<String>,
) -> Result<Json<PaymentChannel>, ApiError> {
    let channel = state
        .facilitator
        .channels()
        .get_channel_status(&channel_id)
        .await?;
    Ok(Json(channel))
}

/// `POST /api/receipt/validate` checks a receipt's proof hash offline.
///
/// # Errors
///
/// Returns 400 if the body is not a receipt.
pub async fn validate_receipt(
    payload: JsonBody<PaymentReceipt>,
) -> Result<Json<ProofValidation>, ApiError> {
    let Json(receipt) = payload?;
    Ok(Json(ProofValidation {
        valid: validate_proof(&receipt),
    }))
}

/// `POST /api/receipt/verify` looks a transaction up on the ledger.
///
/// # Errors
///
/// Returns 404 for unknown transactions, 422 when the transaction does not match.
pub async fn verify_receipt_handler(
    State(state): State<SharedState>,
    payload: JsonBody<ReceiptQuery>,
) -> Result<Json<PaymentReceipt>, ApiError> {
    let Json(query) = payload?;
    let receipt = verify_receipt(state.ledger.as_ref(), &query).await?;
    Ok(Json(receipt))
}

/// `POST /api/receipt/session` verifies a batch of transactions as one aggregate.
///
/// # Errors
///
/// Returns 400 if the body is malformed. Individual failures are reported in the body.
pub async fn verify_receipt_session(
    State(state): State<SharedState>,
    payload: JsonBody<VerifySessionBody>,
) -> Result<Json<VerifiedSession>, ApiError> {
    let Json(body) = payload?;
    let session = verify_session(state.ledger.as_ref(), &body.session_id, &body.payments).await;
    Ok(Json(session))
}

/// `GET /api/supported`
pub async fn supported(State(state): State<SharedState>) -> Json<SupportedResponse> {
    Json(state.facilitator.supported())
}

/// `GET /health`
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Builds the API router.
pub fn facilitator_router(state: SharedState) -> Router {
    Router::new()
        .route("/api/payment/create", post(create_payment))
        .route("/api/payment/verify", post(verify_payment))
        .route("/api/payment/settle", post(settle_payment))
        .route("/api/payment/status/{sessionId}", get(payment_status))
        .route("/api/budget/create", post(create_budget))
        .route("/api/budget/payment", post(budget_payment))
        .route("/api/budget/{budgetId}", get(budget_status))
        .route("/api/budget/{budgetId}/cancel", post(cancel_budget))
        .route("/api/channel/create", post(create_channel))
        .route("/api/channel/payment", post(channel_payment))
        .route("/api/channel/settle", post(settle_channel))
        .route("/api/channel/{channelId}", get(channel_status))
        .route("/api/receipt/validate", post(validate_receipt))
        .route("/api/receipt/verify", post(verify_receipt_handler))
        .route("/api/receipt/session", post(verify_receipt_session))
        .route("/api/supported", get(supported))
        .route("/health", get(health))
        .with_state(state)
}

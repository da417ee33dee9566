//! Access decision for one protected route.

use http::{HeaderMap, HeaderValue, Uri};
use rust_decimal::Decimal;
use serde::Serialize;
use stakefy::SettlementError;
use stakefy::session::{CreatePaymentRequest, PaymentSession, PaymentSessionManager, SessionStatus};
use stakefy::timestamp::UnixTimestamp;

#[cfg(feature = "telemetry")]
use tracing::instrument;

use crate::constants::SESSION_HEADER;
use crate::error::PaywallError;

/// Body of a `402 Payment Required` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentRequired {
    /// Always `"Payment Required"`.
    pub error: &'static str,
    /// Why access was refused.
    pub message: String,
    /// Session to pay into.
    pub payment: PaymentOffer,
    /// Human-readable steps for the client.
    pub instructions: Vec<String>,
}

/// The payable part of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentOffer {
    /// Session id to send back in `X-Session-Id`.
    pub session_id: String,
    /// Price of the resource.
    pub amount: Decimal,
    /// Facilitator fee on top of the price.
    pub fee_amount: Decimal,
    /// Merchant being paid.
    pub merchant_id: String,
    /// Where to send `amount + feeAmount`.
    pub deposit_address: String,
    /// Deadline for the deposit.
    pub expires_at: UnixTimestamp,
    /// Solana Pay transfer request for wallets.
    pub solana_pay_url: String,
}

impl From<&PaymentSession> for PaymentOffer {
    fn from(session: &PaymentSession) -> Self {
        Self {
            session_id: session.session_id.clone(),
            amount: session.amount,
            fee_amount: session.fee_amount,
            merchant_id: session.merchant_id.clone(),
            deposit_address: session.deposit_address.clone(),
            expires_at: session.expires_at,
            solana_pay_url: session.solana_pay_url.clone(),
        }
    }
}

impl PaymentRequired {
    fn new(session: &PaymentSession, message: String) -> Self {
        let instructions = vec![
            format!(
                "Send {} to {}",
                session.total_due(),
                session.deposit_address
            ),
            format!(
                "Retry the request with header X-Session-Id: {}",
                session.session_id
            ),
            format!("The session expires at {} (unix seconds)", session.expires_at),
        ];
        Self {
            error: "Payment Required",
            message,
            payment: PaymentOffer::from(session),
            instructions,
        }
    }
}

/// Gate in front of one route: a merchant and a fixed price.
///
/// Every unpaid request that carries no usable session gets a fresh session with its
/// own deposit address, so anonymous traffic creates records. Run
/// [`PaymentSessionManager::prune_expired`] periodically on the same manager to drop
/// the ones that expire unpaid.
#[derive(Debug, Clone)]
pub struct Paywall {
    sessions: PaymentSessionManager,
    merchant_id: String,
    price: Decimal,
    description: Option<String>,
}

impl Paywall {
    /// Requires `price` to be paid to `merchant_id` through `sessions`.
    #[must_use]
    pub fn new(sessions: PaymentSessionManager, merchant_id: impl Into<String>, price: Decimal) -> Self {
        Self {
            sessions,
            merchant_id: merchant_id.into(),
            price,
            description: None,
        }
    }

    /// Describes what the payment buys. Stored in the session metadata.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Price of the route.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Decides whether a request may pass. Returns the id of the paying session.
    ///
    /// # Errors
    ///
    /// Returns [`PaywallError::PaymentRequired`] with a session to pay into, or
    /// [`PaywallError::Settlement`] if the settlement core could not be reached.
    #[cfg_attr(
        feature = "telemetry",
        instrument(name = "stakefy.paywall.authorize", skip_all, fields(path = %uri.path()))
    )]
    pub async fn authorize(&self, headers: &HeaderMap, uri: &Uri) -> Result<String, PaywallError> {
        let Some(session_id) = headers.get(SESSION_HEADER).and_then(header_text) else {
            return Err(self
                .demand(uri, "This resource requires payment".to_owned())
                .await);
        };
        #[cfg(feature = "telemetry")]
        if headers.contains_key(crate::constants::PROOF_HEADER) {
            tracing::debug!(session_id, "Ignoring client payment proof, checking the ledger");
        }

        let session = match self.sessions.get_status(session_id).await {
            Ok(session) => session,
            Err(SettlementError::NotFound { .. }) => {
                return Err(self
                    .demand(uri, format!("Unknown payment session {session_id}"))
                    .await);
            }
            Err(err) => return Err(err.into()),
        };
        if session.merchant_id != self.merchant_id || session.amount != self.price {
            return Err(self
                .demand(
                    uri,
                    format!("Session {session_id} does not pay for this resource"),
                )
                .await);
        }

        let status = match session.status {
            SessionStatus::Pending => self.sessions.verify_payment(session_id).await?.status,
            status => status,
        };
        match status {
            SessionStatus::Completed => Ok(session.session_id),
            SessionStatus::Pending => Err(PaywallError::PaymentRequired(Box::new(
                PaymentRequired::new(
                    &session,
                    format!("Payment for session {session_id} has not been received yet"),
                ),
            ))),
            SessionStatus::Failed => Err(self
                .demand(uri, format!("Session {session_id} expired unpaid"))
                .await),
        }
    }

    async fn demand(&self, uri: &Uri, message: String) -> PaywallError {
        let metadata = serde_json::json!({
            "resource": uri.path(),
            "description": self.description,
        });
        let request = CreatePaymentRequest {
            merchant_id: self.merchant_id.clone(),
            amount: self.price,
            reference: uri.path().to_owned(),
            metadata: Some(metadata),
            webhook_url: None,
        };
        match self.sessions.create_payment(request).await {
            Ok(session) => {
                PaywallError::PaymentRequired(Box::new(PaymentRequired::new(&session, message)))
            }
            Err(err) => err.into(),
        }
    }
}

fn header_text(value: &HeaderValue) -> Option<&str> {
    value.to_str().ok().map(str::trim).filter(|s| !s.is_empty())
}

//! A [`Ledger`] backed by a remote ledger signer service over HTTP.
//!
//! The service holds the keys for generated deposit addresses and exposes four JSON
//! endpoints relative to its base URL:
//!
//! - `POST ./addresses` → `{ "address": "..." }`
//! - `GET ./balances/{address}` → `{ "address": "...", "balance": "1.25" }`
//! - `POST ./transfers` with `{ "from": "...", "legs": [{ "to": "...", "amount": "1" }] }`
//!   → `{ "signature": "..." }`. Settlement transfers carry an `Idempotency-Key`
//!   header; the service must answer a repeated key with the original signature
//!   instead of moving funds again.
//! - `GET ./transactions/{signature}` → a transaction record, or `404`
//!
//! Connection failures, timeouts, `429` and `5xx` responses are reported as transient
//! [`LedgerError`]s so the managers retry them. Other `4xx` responses are rejections.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stakefy::ledger::{Ledger, LedgerError, TransactionRecord, TransactionRef, TransferLeg};
use url::Url;

/// Header carrying the idempotency key of a transfer.
pub const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct BalanceResponse {
    balance: Decimal,
}

#[derive(Debug, Serialize)]
struct TransferRequest<'a> {
    from: &'a str,
    legs: &'a [TransferLeg],
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    signature: TransactionRef,
}

/// HTTP client for a remote ledger service.
#[derive(Clone, Debug)]
pub struct RemoteLedger {
    /// Base URL of the service, ending with `/`.
    base_url: Url,
    /// Full URL of `POST ./addresses`.
    addresses_url: Url,
    /// Full URL of `POST ./transfers`.
    transfers_url: Url,
    client: Client,
    auth_token: Option<String>,
    timeout: Option<Duration>,
}

impl RemoteLedger {
    /// Creates a client for the service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`url::ParseError`] if the endpoint URLs cannot be derived.
    pub fn try_new(base_url: Url) -> Result<Self, url::ParseError> {
        let base_url = normalize(base_url);
        Ok(Self {
            addresses_url: base_url.join("./addresses")?,
            transfers_url: base_url.join("./transfers")?,
            base_url,
            client: Client::new(),
            auth_token: None,
            timeout: None,
        })
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    #[must_use]
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    /// Sets a per-request timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Base URL of the service.
    #[must_use]
    pub const fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, LedgerError> {
        self.base_url
            .join(path)
            .map_err(|e| LedgerError::Rejected(format!("invalid ledger path {path}: {e}")))
    }

    fn prepare(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }
        if let Some(timeout) = self.timeout {
            request = request.timeout(timeout);
        }
        request
    }

    async fn send(
        &self,
        request: RequestBuilder,
        context: &'static str,
    ) -> Result<Response, LedgerError> {
        let response = self
            .prepare(request)
            .send()
            .await
            .map_err(|e| transport_error(context, &e))?;
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("{context}: HTTP {status}: {body}");
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            Err(LedgerError::Unavailable(message))
        } else {
            Err(LedgerError::Rejected(message))
        }
    }

    async fn json<R: DeserializeOwned>(
        response: Response,
        context: &'static str,
    ) -> Result<R, LedgerError> {
        if response.status() == StatusCode::NOT_FOUND {
            return Err(LedgerError::Rejected(format!("{context}: HTTP 404")));
        }
        response
            .json::<R>()
            .await
            .map_err(|e| LedgerError::Rejected(format!("{context}: malformed response: {e}")))
    }
}

#[async_trait]
impl Ledger for RemoteLedger {
    async fn generate_deposit_address(&self) -> Result<String, LedgerError> {
        const CONTEXT: &str = "POST /addresses";
        let response = self
            .send(self.client.post(self.addresses_url.clone()), CONTEXT)
            .await?;
        let body: AddressResponse = Self::json(response, CONTEXT).await?;
        Ok(body.address)
    }

    async fn check_balance(&self, address: &str, min_amount: Decimal) -> Result<bool, LedgerError> {
        const CONTEXT: &str = "GET /balances";
        let url = self.endpoint(&format!("./balances/{address}"))?;
        let response = self.send(self.client.get(url), CONTEXT).await?;
        let body: BalanceResponse = Self::json(response, CONTEXT).await?;
        Ok(body.balance >= min_amount)
    }

    async fn get_transaction(
        &self,
        reference: &TransactionRef,
    ) -> Result<Option<TransactionRecord>, LedgerError> {
        const CONTEXT: &str = "GET /transactions";
        let url = self.endpoint(&format!("./transactions/{reference}"))?;
        let response = self.send(self.client.get(url), CONTEXT).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        Self::json(response, CONTEXT).await.map(Some)
    }

    async fn transfer_many(
        &self,
        from: &str,
        legs: &[TransferLeg],
        idempotency_key: Option<&str>,
    ) -> Result<TransactionRef, LedgerError> {
        const CONTEXT: &str = "POST /transfers";
        let mut request = self
            .client
            .post(self.transfers_url.clone())
            .json(&TransferRequest { from, legs });
        if let Some(key) = idempotency_key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key);
        }
        let response = self.send(request, CONTEXT).await?;
        let body: TransferResponse = Self::json(response, CONTEXT).await?;
        tracing::debug!(from, legs = legs.len(), signature = %body.signature, "Ledger transfer submitted");
        Ok(body.signature)
    }
}

/// Ensures the base path ends with `/` so relative joins stay under it.
fn normalize(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}

fn transport_error(context: &'static str, err: &reqwest::Error) -> LedgerError {
    let message = format!("{context}: {err}");
    if err.is_timeout() {
        LedgerError::Timeout(message)
    } else if err.is_builder() {
        LedgerError::Rejected(message)
    } else {
        LedgerError::Unavailable(message)
    }
}

/// Parses a base URL string into a [`RemoteLedger`].
impl TryFrom<&str> for RemoteLedger {
    type Error = url::ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::try_new(Url::parse(value)?)
    }
}

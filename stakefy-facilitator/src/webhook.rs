//! Webhook delivery.
//!
//! [`WebhookNotifier`] is the [`EventSink`] the facilitator hands to the settlement
//! core. `dispatch` only queues a background task, so a slow or dead merchant
//! endpoint never delays the state transition that raised the event.
//!
//! Each delivery is a JSON `POST` with three headers:
//!
//! - `X-Stakefy-Event`: the event name, e.g. `payment.completed`
//! - `X-Stakefy-Delivery`: an id that stays the same across retries
//! - `X-Stakefy-Signature`: lowercase hex HMAC-SHA256 of the body under the configured
//!   secret, or a plain SHA-256 of the body when no secret is set
//!
//! Non-2xx responses and transport errors are retried with exponential backoff up to
//! `max_attempts`. Exhausted deliveries are logged and dropped.

use std::fmt::{self, Write as _};
use std::time::Duration;

use hmac::{Hmac, Mac};
use reqwest::Client;
use sha2::Sha256;
use stakefy::events::{EventSink, WebhookEvent};
use stakefy::proof::sha256_hex;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::WebhookConfig;

/// Header carrying the event name.
pub const EVENT_HEADER: &str = "X-Stakefy-Event";
/// Header carrying the body signature.
pub const SIGNATURE_HEADER: &str = "X-Stakefy-Signature";
/// Header carrying the delivery id.
pub const DELIVERY_HEADER: &str = "X-Stakefy-Delivery";

type HmacSha256 = Hmac<Sha256>;

/// Failure to deliver one event.
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The event could not be serialized.
    #[error("failed to encode webhook payload: {0}")]
    Encode(#[from] serde_json::Error),
    /// Every attempt failed.
    #[error("webhook delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last_error: String,
    },
}

/// Posts lifecycle events to merchant webhook URLs in the background.
#[derive(Clone)]
pub struct WebhookNotifier {
    client: Client,
    config: WebhookConfig,
    tracker: TaskTracker,
}

impl fmt::Debug for WebhookNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebhookNotifier")
            .field("max_attempts", &self.config.max_attempts)
            .field("base_delay_ms", &self.config.base_delay_ms)
            .field("signed", &self.config.secret.is_some())
            .field("in_flight", &self.tracker.len())
            .finish_non_exhaustive()
    }
}

impl WebhookNotifier {
    /// Creates a notifier.
    ///
    /// # Errors
    ///
    /// Returns [`reqwest::Error`] if the HTTP client cannot be built.
    pub fn new(config: WebhookConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            config,
            tracker: TaskTracker::new(),
        })
    }

    /// Signature header value for `body`.
    #[must_use]
    pub fn sign(&self, body: &[u8]) -> String {
        let mac = self
            .config
            .secret
            .as_deref()
            .and_then(|secret| HmacSha256::new_from_slice(secret.as_bytes()).ok());
        match mac {
            Some(mut mac) => {
                mac.update(body);
                to_hex(&mac.finalize().into_bytes())
            }
            None => sha256_hex(body),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.config.base_delay_ms.saturating_mul(factor))
    }

    /// Delivers `event` to `url`, retrying until it is accepted or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns [`WebhookError::Exhausted`] when no attempt got a 2xx response.
    pub async fn deliver(&self, url: &str, event: &WebhookEvent) -> Result<(), WebhookError> {
        let body = serde_json::to_vec(event)?;
        let signature = self.sign(&body);
        let delivery_id = Uuid::new_v4().to_string();
        let attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let result = self
                .client
                .post(url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .header(EVENT_HEADER, event.event.as_str())
                .header(SIGNATURE_HEADER, &signature)
                .header(DELIVERY_HEADER, &delivery_id)
                .body(body.clone())
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(url, event = %event.event, attempt, "Webhook delivered");
                    return Ok(());
                }
                Ok(response) => last_error = format!("HTTP {}", response.status()),
                Err(err) => last_error = err.to_string(),
            }
            if attempt < attempts {
                let delay = self.backoff(attempt);
                tracing::debug!(url, attempt, error = %last_error, delay_ms = delay.as_millis(), "Webhook attempt failed, retrying");
                tokio::time::sleep(delay).await;
            }
        }

        Err(WebhookError::Exhausted {
            attempts,
            last_error,
        })
    }

    /// Waits for queued deliveries, up to `timeout`. Returns `false` if some were cut off.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.tracker.close();
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "Waiting for webhook deliveries");
        }
        tokio::time::timeout(timeout, self.tracker.wait())
            .await
            .is_ok()
    }
}

impl EventSink for WebhookNotifier {
    fn dispatch(&self, url: &str, event: WebhookEvent) {
        if url.starts_with("http://") {
            tracing::warn!(url, "Delivering webhook over plain http");
        }
        let notifier = self.clone();
        let url = url.to_owned();
        self.tracker.spawn(async move {
            if let Err(err) = notifier.deliver(&url, &event).await {
                tracing::warn!(url, event = %event.event, error = %err, "Dropping webhook event");
            }
        });
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            let _ = write!(s, "{b:02x}");
            s
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use stakefy::events::EventKind;
    use stakefy::timestamp::UnixTimestamp;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(secret: Option<&str>, max_attempts: u32) -> WebhookConfig {
        WebhookConfig {
            secret: secret.map(str::to_owned),
            max_attempts,
            base_delay_ms: 10,
            timeout_secs: 2,
        }
    }

    fn event() -> WebhookEvent {
        WebhookEvent {
            event: EventKind::PaymentCompleted,
            session_id: Some("s1".into()),
            budget_id: None,
            channel_id: None,
            merchant_id: "merchant".into(),
            amount: Decimal::TEN,
            fee_amount: Some(Decimal::new(5, 2)),
            status: "completed".into(),
            timestamp: UnixTimestamp::from_secs(1_700_000_000),
            deposit_address: Some("Dep1".into()),
            signature: None,
        }
    }

    #[test]
    fn signs_with_hmac_when_a_secret_is_set() {
        let signed = WebhookNotifier::new(config(Some("key"), 1)).unwrap();
        let unsigned = WebhookNotifier::new(config(None, 1)).unwrap();
        let body = b"The quick brown fox jumps over the lazy dog";

        assert_eq!(
            signed.sign(body),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
        assert_eq!(unsigned.sign(body), sha256_hex(body));
    }

    #[tokio::test]
    async fn delivers_with_headers() {
        let server = MockServer::start().await;
        let notifier = WebhookNotifier::new(config(Some("secret"), 3)).unwrap();
        let body = serde_json::to_vec(&event()).unwrap();
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header(EVENT_HEADER, "payment.completed"))
            .and(header(SIGNATURE_HEADER, notifier.sign(&body).as_str()))
            .and(header_exists(DELIVERY_HEADER))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        notifier
            .deliver(&format!("{}/hook", server.uri()), &event())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retries_server_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(None, 3)).unwrap();
        notifier
            .deliver(&format!("{}/hook", server.uri()), &event())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(None, 2)).unwrap();
        let err = notifier
            .deliver(&format!("{}/hook", server.uri()), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, WebhookError::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test]
    async fn dispatch_runs_in_background_and_drains() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(2)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(config(None, 1)).unwrap();
        let url = format!("{}/hook", server.uri());
        notifier.dispatch(&url, event());
        notifier.dispatch(&url, event());

        assert!(notifier.drain(Duration::from_secs(5)).await);
    }
}

//! Tower [`Layer`] wrapping routes in a [`Paywall`].

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use axum_core::extract::Request;
use axum_core::response::{IntoResponse, Response};
use http::{HeaderName, HeaderValue};
use rust_decimal::Decimal;
use stakefy::session::PaymentSessionManager;
use tower::util::BoxCloneSyncService;
use tower::{Layer, Service};

use crate::constants::SESSION_ACCEPTED_HEADER;
use crate::paywall::Paywall;

/// Layer that charges a fixed price for every request to the wrapped service.
#[derive(Debug, Clone)]
pub struct PaywallLayer {
    paywall: Paywall,
}

impl PaywallLayer {
    /// Charges `price` per session, paid to `merchant_id`.
    #[must_use]
    pub fn new(sessions: PaymentSessionManager, merchant_id: impl Into<String>, price: Decimal) -> Self {
        Self {
            paywall: Paywall::new(sessions, merchant_id, price),
        }
    }

    /// Describes what the payment buys.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.paywall = self.paywall.with_description(description);
        self
    }
}

impl<S> Layer<S> for PaywallLayer
where
    S: Service<Request, Response = Response, Error = Infallible> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
{
    type Service = PaywallService;

    fn layer(&self, inner: S) -> Self::Service {
        PaywallService {
            paywall: self.paywall.clone(),
            inner: BoxCloneSyncService::new(inner),
        }
    }
}

/// Service produced by [`PaywallLayer`].
#[derive(Clone)]
#[allow(missing_debug_implementations)] // BoxCloneSyncService does not implement Debug
pub struct PaywallService {
    paywall: Paywall,
    inner: BoxCloneSyncService<Request, Response, Infallible>,
}

impl Service<Request> for PaywallService {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let paywall = self.paywall.clone();
        let ready = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, ready);

        Box::pin(async move {
            let session_id = match paywall.authorize(req.headers(), req.uri()).await {
                Ok(session_id) => session_id,
                Err(err) => return Ok(err.into_response()),
            };
            let mut response = inner.call(req).await?;
            if let Ok(value) = HeaderValue::from_str(&session_id) {
                response
                    .headers_mut()
                    .insert(HeaderName::from_static(SESSION_ACCEPTED_HEADER), value);
            }
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum_core::body::Body;
    use http::{Request as HttpRequest, StatusCode};
    use serde_json::Value;
    use stakefy::ledger::{InMemoryLedger, RetryPolicy};
    use stakefy::session::SessionConfig;
    use tower::ServiceExt;

    use crate::constants::SESSION_HEADER;

    fn service() -> (PaywallService, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let config = SessionConfig::default().with_retry(RetryPolicy::new(1, Duration::ZERO));
        let sessions = PaymentSessionManager::new(ledger.clone(), config);
        let inner = tower::service_fn(|_req: Request| async {
            Ok::<_, Infallible>(Response::new(Body::from("premium content")))
        });
        let layer = PaywallLayer::new(sessions, "merchant-1", Decimal::new(25, 2))
            .with_description("Premium article");
        (layer.layer(inner), ledger)
    }

    async fn json(response: Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn answers_402_then_serves_paid_requests() {
        let (service, ledger) = service();

        let response = service
            .clone()
            .oneshot(HttpRequest::get("/premium").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);
        let body = json(response).await;
        assert_eq!(body["error"], "Payment Required");
        assert_eq!(body["payment"]["amount"], "0.25");
        let session_id = body["payment"]["sessionId"].as_str().unwrap().to_owned();
        let deposit = body["payment"]["depositAddress"].as_str().unwrap().to_owned();

        ledger.credit(&deposit, Decimal::ONE);
        let response = service
            .oneshot(
                HttpRequest::get("/premium")
                    .header(SESSION_HEADER, &session_id)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(SESSION_ACCEPTED_HEADER).unwrap(),
            session_id.as_str()
        );
    }

    #[tokio::test]
    async fn ledger_outage_is_503() {
        let (service, ledger) = service();
        ledger.fail_next(1);
        let response = service
            .oneshot(HttpRequest::get("/premium").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(response).await["retryable"], true);
    }
}

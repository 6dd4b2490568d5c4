//! Circuit breaker middleware.
//!
//! Every non-excluded request asks the breaker for admission. A rejected
//! request never reaches the inner service and gets a 503 with `Retry-After`.
//! An admitted request reports its outcome: a 5xx response, an error from
//! the inner service or a panicking handler counts as a failure, anything
//! else as a success. A panic is recorded and then resumed.

use crate::error::CircuitOpenRejection;
use analytics_runtime::circuit_breaker::{Admission, CircuitBreaker};
use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use futures::FutureExt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer guarding a router with a [`CircuitBreaker`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl CircuitBreakerLayer {
    /// Guard requests with `breaker`.
    #[must_use]
    pub const fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

impl<S> Layer<S> for CircuitBreakerLayer {
    type Service = CircuitBreakerMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CircuitBreakerMiddleware {
            inner,
            breaker: Arc::clone(&self.breaker),
        }
    }
}

/// Middleware service produced by [`CircuitBreakerLayer`].
#[derive(Clone, Debug)]
pub struct CircuitBreakerMiddleware<S> {
    inner: S,
    breaker: Arc<CircuitBreaker>,
}

impl<S> Service<Request> for CircuitBreakerMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Send,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        // Take the service that was driven to readiness, leave a clone behind.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let breaker = Arc::clone(&self.breaker);

        Box::pin(async move {
            let path = req.uri().path().to_string();
            if breaker.is_excluded(&path) {
                return inner.call(req).await;
            }

            if let Admission::Reject { retry_after_secs } = breaker.admit(&path).await {
                tracing::warn!(path = %path, retry_after_secs, "Circuit open, request rejected");
                return Ok(CircuitOpenRejection { retry_after_secs }.into_response());
            }

            let outcome = match AssertUnwindSafe(inner.call(req)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(panic) => {
                    tracing::error!(path = %path, "Handler panicked");
                    breaker.record_outcome(false).await;
                    resume_unwind(panic);
                }
            };

            match outcome {
                Ok(response) => {
                    let failed = response.status().is_server_error();
                    if failed {
                        tracing::warn!(path = %path, status = %response.status(), "Request failed");
                    }
                    breaker.record_outcome(!failed).await;
                    Ok(response)
                }
                Err(e) => {
                    tracing::error!(path = %path, "Request errored");
                    breaker.record_outcome(false).await;
                    Err(e)
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use analytics_runtime::circuit_breaker::{CircuitBreakerConfig, State};
    use analytics_testing::test_clock;
    use axum::{
        Router,
        body::Body,
        http::{StatusCode, header},
        routing::get,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn app(breaker: Arc<CircuitBreaker>) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route(
                "/boom",
                get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
            )
            .route("/health", get(|| async { "healthy" }))
            .layer(CircuitBreakerLayer::new(breaker))
    }

    async fn get_status(app: &Router, uri: &str) -> StatusCode {
        app.clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
            .status()
    }

    fn breaker(clock: analytics_testing::ManualClock) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig::builder()
                .failure_threshold(2)
                .success_threshold(1)
                .timeout(Duration::from_secs(30))
                .build(),
            Arc::new(clock),
        ))
    }

    #[tokio::test]
    async fn test_server_errors_open_the_circuit() {
        let clock = test_clock();
        let breaker = breaker(clock.clone());
        let app = app(Arc::clone(&breaker));

        assert_eq!(get_status(&app, "/boom").await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(get_status(&app, "/boom").await, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(breaker.state().await, State::Open);

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/ok").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "30");
        assert_eq!(breaker.metrics().rejected_requests, 1);
    }

    #[tokio::test]
    async fn test_excluded_paths_bypass_open_circuit() {
        let clock = test_clock();
        let breaker = breaker(clock.clone());
        let app = app(Arc::clone(&breaker));

        get_status(&app, "/boom").await;
        get_status(&app, "/boom").await;
        let before = breaker.metrics().total_requests;

        assert_eq!(get_status(&app, "/health").await, StatusCode::OK);
        assert_eq!(breaker.metrics().total_requests, before);
    }

    #[tokio::test]
    async fn test_probe_after_timeout_closes_circuit() {
        let clock = test_clock();
        let breaker = breaker(clock.clone());
        let app = app(Arc::clone(&breaker));

        get_status(&app, "/boom").await;
        get_status(&app, "/boom").await;
        clock.advance(Duration::from_secs(31));

        assert_eq!(get_status(&app, "/ok").await, StatusCode::OK);
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn test_panicking_handler_counts_as_failure() {
        let clock = test_clock();
        let breaker = breaker(clock.clone());
        let app = Router::new()
            .route(
                "/panic",
                get(|| async {
                    if true {
                        panic!("handler blew up");
                    }
                    "unreachable"
                }),
            )
            .layer(CircuitBreakerLayer::new(Arc::clone(&breaker)));

        for _ in 0..2 {
            let app = app.clone();
            let result = tokio::spawn(async move {
                app.oneshot(Request::builder().uri("/panic").body(Body::empty()).unwrap())
                    .await
            })
            .await;
            assert!(result.unwrap_err().is_panic());
        }

        let metrics = breaker.metrics();
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 2);
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn test_client_errors_are_successes() {
        let breaker = breaker(test_clock());
        let app = app(Arc::clone(&breaker));

        for _ in 0..5 {
            assert_eq!(get_status(&app, "/missing").await, StatusCode::NOT_FOUND);
        }
        assert_eq!(breaker.state().await, State::Closed);
        assert_eq!(breaker.metrics().failed_requests, 0);
    }
}

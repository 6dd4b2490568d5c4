//! Rate limit middleware.
//!
//! Attach one [`RateLimitLayer`] per route with the quotas that route
//! declares. The caller is identified from the gateway headers, or by client
//! address when unauthenticated. Allowed responses carry the
//! `X-RateLimit-*` headers of the tightest quota; rejected requests get a 429
//! and never reach the handler. Routes without the layer are exempt.

use crate::error::{
    RATE_LIMIT_LIMIT_HEADER, RATE_LIMIT_REMAINING_HEADER, RATE_LIMIT_RESET_HEADER,
    RateLimitRejection,
};
use crate::extractors::{caller_identity, client_ip};
use analytics_runtime::rate_limit::{QuotaPolicy, RateLimitDecision, RateLimitQuota, RateLimiter};
use axum::{
    extract::Request,
    http::HeaderValue,
    response::{IntoResponse, Response},
};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Layer enforcing a set of quotas on a route.
#[derive(Clone, Debug)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
    policies: Arc<[QuotaPolicy]>,
}

impl RateLimitLayer {
    /// Enforce every policy in `policies`.
    #[must_use]
    pub fn new(limiter: Arc<RateLimiter>, policies: impl IntoIterator<Item = QuotaPolicy>) -> Self {
        Self {
            limiter,
            policies: policies.into_iter().collect(),
        }
    }

    /// Quota from the caller's pricing plan.
    #[must_use]
    pub fn tiered(limiter: Arc<RateLimiter>) -> Self {
        Self::new(limiter, [QuotaPolicy::Tiered])
    }

    /// The configured strict quota.
    #[must_use]
    pub fn strict(limiter: Arc<RateLimiter>) -> Self {
        Self::new(limiter, [QuotaPolicy::Strict])
    }

    /// A fixed quota for every caller.
    #[must_use]
    pub fn fixed(limiter: Arc<RateLimiter>, quota: RateLimitQuota) -> Self {
        Self::new(limiter, [QuotaPolicy::Fixed(quota)])
    }

    /// Declared policies.
    #[must_use]
    pub fn policies(&self) -> &[QuotaPolicy] {
        &self.policies
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitMiddleware {
            inner,
            limiter: Arc::clone(&self.limiter),
            policies: Arc::clone(&self.policies),
        }
    }
}

/// Middleware service produced by [`RateLimitLayer`].
#[derive(Clone, Debug)]
pub struct RateLimitMiddleware<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
    policies: Arc<[QuotaPolicy]>,
}

impl<S> Service<Request> for RateLimitMiddleware<S>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let limiter = Arc::clone(&self.limiter);
        let policies = Arc::clone(&self.policies);

        Box::pin(async move {
            if policies.is_empty() {
                return inner.call(req).await;
            }

            let identity = caller_identity(req.headers());
            let ip = client_ip(req.headers(), req.extensions());
            let assignments: Vec<_> = policies
                .iter()
                .map(|policy| limiter.assign(*policy, identity.as_ref(), ip))
                .collect();

            match limiter.admit_all(&assignments).await {
                RateLimitDecision::Reject {
                    retry_after_secs,
                    plan,
                    limit,
                } => {
                    tracing::warn!(
                        path = %req.uri().path(),
                        user_id = identity.as_ref().map(|i| i.user_id.as_str()),
                        plan,
                        limit,
                        "Rate limit exceeded"
                    );
                    Ok(RateLimitRejection {
                        plan,
                        limit,
                        retry_after_secs,
                    }
                    .into_response())
                }
                RateLimitDecision::Allow {
                    limit,
                    remaining,
                    reset_after_secs,
                } => {
                    let mut response = inner.call(req).await?;
                    let headers = response.headers_mut();
                    headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(limit));
                    headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(remaining));
                    headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(reset_after_secs));
                    Ok(response)
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use analytics_runtime::rate_limit::{InMemoryCounterStore, RateLimiterConfig};
    use analytics_testing::{ManualClock, test_clock};
    use axum::{
        Router,
        body::Body,
        http::{StatusCode, header},
        routing::get,
    };
    use std::time::Duration;
    use tower::ServiceExt;

    fn limiter(clock: &ManualClock) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::with_clock(
            RateLimiterConfig::default(),
            Arc::new(InMemoryCounterStore::new(Arc::new(clock.clone()))),
            Arc::new(clock.clone()),
        ))
    }

    fn request(uri: &str, user: Option<(&str, &str)>) -> Request {
        let mut builder = Request::builder().uri(uri).header("X-Real-IP", "198.51.100.7");
        if let Some((user_id, plan)) = user {
            builder = builder
                .header("x-gateway-authenticated", "true")
                .header("x-user-id", user_id)
                .header("x-user-pricing-plan", plan);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_tiered_quota_rejects_over_limit() {
        let clock = test_clock();
        let limiter = limiter(&clock);
        let app = Router::new().route(
            "/tiered",
            get(|| async { "ok" }).layer(RateLimitLayer::tiered(Arc::clone(&limiter))),
        );

        for n in 1..=20_u64 {
            let response = app.clone().oneshot(request("/tiered", Some(("u1", "free")))).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "20");
            assert_eq!(
                response.headers()[RATE_LIMIT_REMAINING_HEADER],
                (20 - n).to_string().as_str()
            );
        }

        let response = app.clone().oneshot(request("/tiered", Some(("u1", "free")))).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");

        // Another user has their own counter.
        let response = app.clone().oneshot(request("/tiered", Some(("u2", "free")))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unauthenticated_callers_keyed_by_ip() {
        let clock = test_clock();
        let app = Router::new().route(
            "/tiered",
            get(|| async { "ok" }).layer(RateLimitLayer::tiered(limiter(&clock))),
        );

        for _ in 0..10 {
            let response = app.clone().oneshot(request("/tiered", None)).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
        let response = app.clone().oneshot(request("/tiered", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["currentPlan"], "unauthenticated");
    }

    #[tokio::test]
    async fn test_window_rollover_admits_again() {
        let clock = test_clock();
        let quota = RateLimitQuota::per_minute(1);
        let app = Router::new().route(
            "/fixed",
            get(|| async { "ok" }).layer(RateLimitLayer::fixed(limiter(&clock), quota)),
        );

        assert_eq!(app.clone().oneshot(request("/fixed", None)).await.unwrap().status(), StatusCode::OK);
        assert_eq!(
            app.clone().oneshot(request("/fixed", None)).await.unwrap().status(),
            StatusCode::TOO_MANY_REQUESTS
        );

        clock.advance(Duration::from_secs(60));
        assert_eq!(app.clone().oneshot(request("/fixed", None)).await.unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_rejected_request_never_reaches_handler() {
        let clock = test_clock();
        let hits = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/strict",
            get(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    "ok"
                }
            })
            .layer(RateLimitLayer::strict(limiter(&clock))),
        );

        for _ in 0..7 {
            let _ = app.clone().oneshot(request("/strict", Some(("u1", "enterprise")))).await.unwrap();
        }
        assert_eq!(hits.load(std::sync::atomic::Ordering::SeqCst), 5);
    }

    #[test]
    fn test_layer_constructors() {
        let clock = test_clock();
        let limiter = limiter(&clock);
        assert_eq!(RateLimitLayer::tiered(Arc::clone(&limiter)).policies(), &[QuotaPolicy::Tiered]);
        assert_eq!(RateLimitLayer::strict(Arc::clone(&limiter)).policies(), &[QuotaPolicy::Strict]);
        assert!(RateLimitLayer::new(limiter, []).policies().is_empty());
    }
}

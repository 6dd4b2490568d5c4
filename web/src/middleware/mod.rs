//! Axum middleware layers.
//!
//! - [`correlation_id_layer`]: correlation IDs in request extensions, tracing
//!   spans and the response header
//! - [`CircuitBreakerLayer`]: sheds requests with 503 while the breaker is open
//! - [`RateLimitLayer`]: per-endpoint quotas with 429 rejections
//!
//! # Example
//!
//! ```ignore
//! use analytics_web::middleware::{correlation_id_layer, CircuitBreakerLayer, RateLimitLayer};
//!
//! let app = Router::new()
//!     .route(
//!         "/api/v1/reports",
//!         get(list_reports).layer(RateLimitLayer::tiered(limiter.clone())),
//!     )
//!     .layer(CircuitBreakerLayer::new(breaker))
//!     .layer(correlation_id_layer());
//! ```
//!
//! Layers added later wrap the earlier ones, so in the example a request
//! meets the correlation layer first, then the breaker, then the limiter.

mod circuit_breaker;
mod rate_limit;

pub use circuit_breaker::{CircuitBreakerLayer, CircuitBreakerMiddleware};
pub use rate_limit::{RateLimitLayer, RateLimitMiddleware};

use axum::{extract::Request, http::HeaderValue, response::Response};
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::Instrument;
use uuid::Uuid;

/// Header name for correlation ID.
pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Create a layer that adds correlation ID tracking to all requests.
///
/// This layer:
/// - Extracts correlation ID from request header or generates new UUID
/// - Stores correlation ID in request extensions
/// - Creates tracing span with `correlation_id` field
/// - Injects correlation ID into response header
#[must_use]
pub const fn correlation_id_layer() -> CorrelationIdLayer {
    CorrelationIdLayer
}

/// Layer for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdLayer;

impl<S> Layer<S> for CorrelationIdLayer {
    type Service = CorrelationIdMiddleware<S>;

    fn layer(&self, inner: S) -> Self::Service {
        CorrelationIdMiddleware { inner }
    }
}

/// Middleware service for correlation ID tracking.
#[derive(Clone, Debug)]
pub struct CorrelationIdMiddleware<S> {
    inner: S,
}

impl<S> Service<Request> for CorrelationIdMiddleware<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request) -> Self::Future {
        let correlation_id = req
            .headers()
            .get(CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        req.extensions_mut().insert(correlation_id);

        let span = tracing::info_span!(
            "http_request",
            correlation_id = %correlation_id,
            method = %req.method(),
            path = %req.uri().path(),
        );

        let fut = self.inner.call(req);

        Box::pin(async move {
            let mut response = fut.instrument(span).await?;

            if let Ok(header_value) = HeaderValue::from_str(&correlation_id.to_string()) {
                response
                    .headers_mut()
                    .insert(CORRELATION_ID_HEADER, header_value);
            }

            Ok(response)
        })
    }
}

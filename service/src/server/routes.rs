//! Router configuration for the analytics service.
//!
//! Builds the complete Axum router with the resilience layers attached.

use super::rate_limit_examples;
use analytics_runtime::rate_limit::{QuotaPolicy, RateLimitQuota};
use analytics_web::handlers::{analytics_health, health_check, metrics};
use analytics_web::{AppState, CircuitBreakerLayer, RateLimitLayer, correlation_id_layer};
use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

/// Build the complete Axum router.
///
/// Configures:
/// - Liveness, health and Prometheus endpoints
/// - Rate limit example endpoints under `/api/v1/rate-limit-examples`
///
/// Every route sits behind the circuit breaker; the health and metrics paths
/// are in its default exclusion list. Rate limits are declared per route.
#[must_use]
pub fn build_router(state: AppState) -> Router {
    let limiter = Arc::clone(&state.limiter);

    let examples = Router::new()
        .route(
            "/basic",
            get(rate_limit_examples::basic).layer(RateLimitLayer::fixed(
                Arc::clone(&limiter),
                RateLimitQuota::per_minute(10),
            )),
        )
        .route(
            "/dynamic",
            get(rate_limit_examples::dynamic).layer(RateLimitLayer::tiered(Arc::clone(&limiter))),
        )
        .route(
            "/strict",
            get(rate_limit_examples::strict).layer(RateLimitLayer::strict(Arc::clone(&limiter))),
        )
        .route(
            "/multiple",
            get(rate_limit_examples::multiple).layer(RateLimitLayer::new(
                Arc::clone(&limiter),
                [
                    QuotaPolicy::Fixed(RateLimitQuota::per_minute(20)),
                    QuotaPolicy::Fixed(RateLimitQuota::per_hour(100)),
                ],
            )),
        )
        .route("/no-limit", get(rate_limit_examples::no_limit))
        .route("/info", get(rate_limit_examples::info));

    Router::new()
        // Health checks and metrics (breaker-excluded)
        .route("/health", get(health_check))
        .route("/api/v1/analytics/health", get(analytics_health))
        .route("/metrics", get(metrics))
        .nest("/api/v1/rate-limit-examples", examples)
        // A panicking handler becomes a 500, which the breaker counts.
        .layer(CatchPanicLayer::new())
        .layer(CircuitBreakerLayer::new(Arc::clone(&state.breaker)))
        .layer(correlation_id_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

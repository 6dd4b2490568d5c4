//! Health check endpoints.
//!
//! These endpoints are used by load balancers and monitoring systems
//! to verify service health. Both are excluded from the circuit breaker by
//! default, so they keep answering while the breaker sheds traffic.

use crate::state::AppState;
use analytics_runtime::circuit_breaker::{CircuitSnapshot, State as CircuitState};
use analytics_runtime::consumer::{ConnectionState, ConsumerStatus};
use axum::{Json, extract::State, http::StatusCode};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Simple health check endpoint (for basic liveness).
///
/// Returns 200 OK to indicate the process is running. Does not look at any
/// dependency.
///
/// # Endpoint
///
/// ```text
/// GET /health
/// ```
#[allow(clippy::unused_async)]
pub async fn health_check() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

/// Broker section of the health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KafkaHealth {
    /// Whether the consumer runs at all
    pub enabled: bool,
    /// `connected` or `disconnected`
    pub kafka: &'static str,
    /// Consumer details when enabled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerStatus>,
}

/// Rate limiter section of the health report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitHealth {
    /// `shared` or `in-process`
    pub store: &'static str,
}

/// Body of `GET /api/v1/analytics/health`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsHealth {
    /// `healthy` or `degraded`
    pub status: &'static str,
    /// Broker consumer
    pub kafka: KafkaHealth,
    /// Circuit breaker snapshot
    pub circuit_breaker: CircuitSnapshot,
    /// Counter store in use
    pub rate_limit: RateLimitHealth,
    /// When the report was produced
    pub timestamp: DateTime<Utc>,
}

/// Service health with dependency details (for readiness dashboards).
///
/// Always 200: a disconnected broker or an open circuit is reported as
/// `degraded`, never as a failing probe.
///
/// # Endpoint
///
/// ```text
/// GET /api/v1/analytics/health
/// ```
///
/// # Response
///
/// ```json
/// {
///   "status": "healthy",
///   "kafka": { "enabled": true, "kafka": "connected", "consumer": { "state": "connected", ... } },
///   "circuitBreaker": { "state": "CLOSED", "failureCount": 0, ... },
///   "rateLimit": { "store": "shared" },
///   "timestamp": "2025-01-01T00:00:00Z"
/// }
/// ```
pub async fn analytics_health(State(state): State<AppState>) -> (StatusCode, Json<AnalyticsHealth>) {
    let consumer = match &state.consumer {
        Some(consumer) => Some(consumer.status().await),
        None => None,
    };
    let connected = consumer
        .as_ref()
        .is_some_and(|status| status.state == ConnectionState::Connected);

    let kafka = KafkaHealth {
        enabled: consumer.is_some(),
        kafka: if connected { "connected" } else { "disconnected" },
        consumer,
    };
    let circuit_breaker = state.breaker.snapshot().await;

    let degraded = (kafka.enabled && !connected) || circuit_breaker.state != CircuitState::Closed;

    let health = AnalyticsHealth {
        status: if degraded { "degraded" } else { "healthy" },
        kafka,
        circuit_breaker,
        rate_limit: RateLimitHealth {
            store: state.limiter.store_mode().as_str(),
        },
        timestamp: state.clock.now(),
    };

    (StatusCode::OK, Json(health))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use analytics_core::environment::Clock;
    use analytics_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
    use analytics_runtime::rate_limit::{InMemoryCounterStore, RateLimiter, RateLimiterConfig};
    use analytics_testing::test_clock;
    use std::sync::Arc;

    fn state() -> AppState {
        let clock = Arc::new(test_clock());
        AppState::new(
            Arc::new(CircuitBreaker::with_clock(
                CircuitBreakerConfig::default(),
                clock.clone(),
            )),
            Arc::new(RateLimiter::with_clock(
                RateLimiterConfig::default(),
                Arc::new(InMemoryCounterStore::new(clock.clone())),
                clock.clone(),
            )),
        )
        .with_clock(clock)
    }

    #[tokio::test]
    async fn test_simple_health_check() {
        let (status, body) = health_check().await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_health_without_consumer() {
        let (status, Json(health)) = analytics_health(State(state())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "healthy");
        assert!(!health.kafka.enabled);
        assert_eq!(health.kafka.kafka, "disconnected");
        assert_eq!(health.rate_limit.store, "in-process");
        assert_eq!(health.timestamp, test_clock().now());

        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["circuitBreaker"]["state"], "CLOSED");
        assert_eq!(json["kafka"]["enabled"], false);
        assert!(json["kafka"].get("consumer").is_none());
    }

    #[tokio::test]
    async fn test_open_circuit_reports_degraded() {
        let state = state();
        for _ in 0..5 {
            state.breaker.record_outcome(false).await;
        }

        let (status, Json(health)) = analytics_health(State(state)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health.status, "degraded");
        assert_eq!(health.circuit_breaker.state, CircuitState::Open);
        assert_eq!(health.circuit_breaker.failure_count, 5);
    }
}

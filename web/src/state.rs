//! Application state for Axum handlers.
//!
//! One [`AppState`] per process, cloned into every handler. It owns nothing
//! itself: the breaker, limiter and consumer are the same `Arc`-shared
//! instances the middleware and the background tasks use.

use analytics_core::environment::{Clock, SystemClock};
use analytics_runtime::circuit_breaker::CircuitBreaker;
use analytics_runtime::consumer::EventConsumer;
use analytics_runtime::rate_limit::RateLimiter;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

/// Application state shared across all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    /// Breaker guarding the request path
    pub breaker: Arc<CircuitBreaker>,
    /// Rate limiter for quota layers
    pub limiter: Arc<RateLimiter>,
    /// Event consumer; `None` when the broker integration is disabled
    pub consumer: Option<EventConsumer>,
    /// Prometheus handle for `/metrics`
    pub metrics: Option<PrometheusHandle>,
    /// Clock for health timestamps
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("breaker", &self.breaker)
            .field("limiter", &self.limiter)
            .field("consumer_enabled", &self.consumer.is_some())
            .field("metrics_installed", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Create state with no consumer and no metrics handle.
    #[must_use]
    pub fn new(breaker: Arc<CircuitBreaker>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            breaker,
            limiter,
            consumer: None,
            metrics: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Attach the running event consumer.
    #[must_use]
    pub fn with_consumer(mut self, consumer: EventConsumer) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Attach the Prometheus handle.
    #[must_use]
    pub fn with_metrics(mut self, handle: Option<PrometheusHandle>) -> Self {
        self.metrics = handle;
        self
    }

    /// Use `clock` for timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

//! Prometheus metrics for observability and monitoring.
//!
//! This module provides metric collection for the resilience components:
//! - Circuit breaker state and request counters
//! - Rate limiter decisions
//! - Event consumer messages, dead letters and connection attempts
//! - Dispatcher retries
//!
//! The recorder is installed once per process by [`MetricsServer::start`] and
//! rendered by the service's `/metrics` route.
//!
//! # Example
//!
//! ```rust,no_run
//! use analytics_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new();
//! server.start()?;
//!
//! let body = server.render().unwrap_or_default();
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use thiserror::Error;

// Re-export metrics macros for use in other modules
pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus recorder handle.
///
/// Installs the global recorder and renders the scrape body. Serving the body
/// over HTTP is left to the service router.
#[derive(Default)]
pub struct MetricsServer {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsServer")
            .field("installed", &self.handle.is_some())
            .finish()
    }
}

impl MetricsServer {
    /// Create a metrics server with no recorder installed yet.
    #[must_use]
    pub const fn new() -> Self {
        Self { handle: None }
    }

    /// Register metric descriptions and install the Prometheus recorder.
    ///
    /// # Errors
    ///
    /// Returns error if the metrics exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        match builder.install_recorder() {
            Ok(handle) => {
                self.handle = Some(handle);
                tracing::info!("Prometheus metrics recorder installed");
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if the recorder was not installed by this server.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_requests_total",
        "Total number of requests seen by the circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful requests"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of failed requests"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected requests (circuit open)"
    );

    // Rate Limit Metrics
    describe_counter!(
        "rate_limit_allowed_total",
        "Total number of requests admitted by the rate limiter"
    );
    describe_counter!(
        "rate_limit_rejected_total",
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        "rate_limit_store_errors_total",
        "Total number of counter store errors (request admitted)"
    );

    // Consumer Metrics
    describe_gauge!(
        "consumer_connected",
        "Whether the event consumer holds a broker session (0/1)"
    );
    describe_counter!(
        "consumer_connection_attempts_total",
        "Total number of broker connection attempts"
    );
    describe_counter!(
        "consumer_cooldowns_total",
        "Total number of cooldown periods after exhausting connection retries"
    );
    describe_counter!(
        "consumer_messages_total",
        "Total number of messages read from the input topic"
    );
    describe_counter!(
        "consumer_messages_failed_total",
        "Total number of messages that failed decoding or handling"
    );
    describe_counter!(
        "consumer_dead_letters_published_total",
        "Total number of dead-letter records published"
    );
    describe_counter!(
        "consumer_dead_letters_dropped_total",
        "Total number of dead-letter records dropped (producer unavailable)"
    );
    describe_histogram!(
        "consumer_handle_duration_seconds",
        "Time taken to handle one message"
    );

    // Retry Metrics
    describe_counter!(
        "retry_attempts_total",
        "Total number of retry attempts"
    );
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after retrying"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of operations that exhausted their attempts"
    );
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    pub fn record_state(state: State) {
        gauge!("circuit_breaker_state").set(state.gauge_value());
    }

    /// Record an admitted or rejected request.
    pub fn record_call() {
        counter!("circuit_breaker_requests_total").increment(1);
    }

    /// Record a successful request.
    pub fn record_success() {
        counter!("circuit_breaker_successes_total").increment(1);
    }

    /// Record a failed request.
    pub fn record_failure() {
        counter!("circuit_breaker_failures_total").increment(1);
    }

    /// Record a rejected request (circuit open).
    pub fn record_rejection() {
        counter!("circuit_breaker_rejections_total").increment(1);
    }
}

/// Rate limiter metrics recorder.
pub struct RateLimitMetrics;

impl RateLimitMetrics {
    /// Record an admitted request.
    pub fn record_allowed(scope: &'static str) {
        counter!("rate_limit_allowed_total", "scope" => scope).increment(1);
    }

    /// Record a rejected request.
    pub fn record_rejected(scope: &'static str, plan: &'static str) {
        counter!("rate_limit_rejected_total", "scope" => scope, "plan" => plan).increment(1);
    }

    /// Record a counter store failure.
    pub fn record_store_error() {
        counter!("rate_limit_store_errors_total").increment(1);
    }
}

/// Event consumer metrics recorder.
pub struct ConsumerMetrics;

impl ConsumerMetrics {
    /// Record whether a broker session is held.
    pub fn record_connected(connected: bool) {
        gauge!("consumer_connected").set(if connected { 1.0 } else { 0.0 });
    }

    /// Record a connection attempt.
    pub fn record_connection_attempt() {
        counter!("consumer_connection_attempts_total").increment(1);
    }

    /// Record a cooldown period.
    pub fn record_cooldown() {
        counter!("consumer_cooldowns_total").increment(1);
    }

    /// Record a message handled successfully.
    pub fn record_message(duration: Duration) {
        counter!("consumer_messages_total").increment(1);
        histogram!("consumer_handle_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a message that failed decoding or handling.
    pub fn record_message_failed() {
        counter!("consumer_messages_total").increment(1);
        counter!("consumer_messages_failed_total").increment(1);
    }

    /// Record a dead-letter record published.
    pub fn record_dead_letter_published() {
        counter!("consumer_dead_letters_published_total").increment(1);
    }

    /// Record a dead-letter record dropped.
    pub fn record_dead_letter_dropped() {
        counter!("consumer_dead_letters_dropped_total").increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let server = MetricsServer::new();
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_metrics_server_start_and_render() {
        let mut server = MetricsServer::new();
        server.start().unwrap();

        CircuitBreakerMetrics::record_state(State::Open);
        CircuitBreakerMetrics::record_call();
        ConsumerMetrics::record_dead_letter_dropped();
        RateLimitMetrics::record_rejected("tiered", "free");

        // If another test installed the recorder first, handle is None.
        // Metrics are still recorded globally.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("circuit_breaker_state"));
            assert!(rendered.contains("circuit_breaker_requests_total"));
            assert!(rendered.contains("consumer_dead_letters_dropped_total"));
            assert!(rendered.contains("rate_limit_rejected_total"));
        }
    }

    #[test]
    fn test_second_start_is_tolerated() {
        let mut first = MetricsServer::new();
        let mut second = MetricsServer::new();

        assert!(first.start().is_ok());
        assert!(second.start().is_ok());
    }
}

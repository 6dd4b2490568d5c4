//! Circuit breaker for shedding load while a downstream dependency is failing.
//!
//! The breaker sits in front of the HTTP request path. It is told about each
//! request twice: once before the handler runs ([`CircuitBreaker::admit`]) and
//! once after it finished ([`CircuitBreaker::record_outcome`]).
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Failures are counted,
//!   successes pay the count back down by one.
//! - **Open**: Too many failures detected. Requests are rejected until
//!   `timeout` has passed since the last failure.
//! - **`HalfOpen`**: Probing. Requests pass through; `success_threshold`
//!   successes close the circuit, a single failure re-opens it.
//!
//! Requests whose path starts with one of the excluded prefixes (health,
//! docs, metrics) bypass the breaker entirely and are not counted.
//!
//! The breaker never retries and never invokes the guarded operation for a
//! rejected request.
//!
//! # Example
//!
//! ```rust
//! use analytics_runtime::circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_threshold(5)
//!     .timeout(Duration::from_secs(60))
//!     .success_threshold(2)
//!     .build();
//!
//! let breaker = CircuitBreaker::new(config);
//!
//! if breaker.admit("/api/v1/analytics/dashboards").await == Admission::Allow {
//!     // run the handler, then report how it went
//!     breaker.record_outcome(true).await;
//! }
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics;
use analytics_core::environment::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Path prefixes that bypass the breaker unless configured otherwise.
pub const DEFAULT_EXCLUDED_PATHS: &[&str] = &[
    "/api/v1/analytics/health",
    "/health",
    "/docs",
    "/openapi.json",
    "/redoc",
    "/metrics",
];

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of failures before opening the circuit
    pub failure_threshold: u32,
    /// Duration to wait after the last failure before probing in `HalfOpen`
    pub timeout: Duration,
    /// Number of successes in `HalfOpen` state before closing the circuit
    pub success_threshold: u32,
    /// Request path prefixes that bypass the breaker
    pub excluded_path_prefixes: Vec<String>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
            excluded_path_prefixes: None,
        }
    }

    /// Whether `path` bypasses the breaker.
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.excluded_path_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<u32>,
    timeout: Option<Duration>,
    success_threshold: Option<u32>,
    excluded_path_prefixes: Option<Vec<String>>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    ///
    /// Circuit opens when the failure count reaches this value.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the timeout duration.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the success threshold.
    ///
    /// Number of successes in `HalfOpen` state before closing the circuit.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Replace the excluded path prefixes.
    #[must_use]
    pub fn excluded_paths<I, S>(mut self, prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded_path_prefixes = Some(prefixes.into_iter().map(Into::into).collect());
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(5),
            timeout: self.timeout.unwrap_or(Duration::from_secs(60)),
            success_threshold: self.success_threshold.unwrap_or(2),
            excluded_path_prefixes: self.excluded_path_prefixes.unwrap_or_else(|| {
                DEFAULT_EXCLUDED_PATHS
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            }),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Gauge value exported for this state (0=closed, 1=half-open, 2=open).
    #[must_use]
    pub const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Outcome of [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Run the request.
    Allow,
    /// Shed the request.
    Reject {
        /// Seconds until the breaker will probe again.
        retry_after_secs: u64,
    },
}

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

impl CircuitBreakerState {
    const fn closed() -> Self {
        Self {
            state: State::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
        }
    }
}

/// Circuit breaker guarding the request path.
///
/// One instance per process, shared as `Arc<CircuitBreaker>` between the
/// HTTP middleware and the health endpoint.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    clock: Arc<dyn Clock>,
    state: Arc<RwLock<CircuitBreakerState>>,
    // Metrics
    total_requests: Arc<AtomicU64>,
    failed_requests: Arc<AtomicU64>,
    rejected_requests: Arc<AtomicU64>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("metrics", &self.metrics())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker using the system clock.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a new circuit breaker reading time from `clock`.
    #[must_use]
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        CircuitBreakerMetrics::record_state(State::Closed);
        Self {
            config: Arc::new(config),
            clock,
            state: Arc::new(RwLock::new(CircuitBreakerState::closed())),
            total_requests: Arc::new(AtomicU64::new(0)),
            failed_requests: Arc::new(AtomicU64::new(0)),
            rejected_requests: Arc::new(AtomicU64::new(0)),
        }
    }

    /// The breaker's configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Whether `path` bypasses the breaker.
    #[must_use]
    pub fn is_excluded(&self, path: &str) -> bool {
        self.config.is_excluded(path)
    }

    /// Get the current state of the circuit breaker.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Decide whether a request for `path` may run.
    ///
    /// An Open circuit whose timeout has strictly elapsed since the last
    /// failure moves to `HalfOpen` and admits the request.
    pub async fn admit(&self, path: &str) -> Admission {
        if self.is_excluded(path) {
            return Admission::Allow;
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_call();

        let mut state = self.state.write().await;
        if state.state != State::Open {
            return Admission::Allow;
        }

        let now = self.clock.now();
        let elapsed = state
            .last_failure_time
            .map_or(Duration::MAX, |last| {
                (now - last).to_std().unwrap_or(Duration::ZERO)
            });

        if elapsed > self.config.timeout {
            tracing::info!("Circuit breaker transitioning OPEN -> HALF_OPEN");
            state.state = State::HalfOpen;
            state.success_count = 0;
            CircuitBreakerMetrics::record_state(State::HalfOpen);
            return Admission::Allow;
        }

        self.rejected_requests.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_rejection();

        let remaining = self.config.timeout.saturating_sub(elapsed);
        let retry_after_secs =
            (remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0)).max(1);
        tracing::warn!(path, retry_after_secs, "Circuit breaker is OPEN, rejecting request");

        Admission::Reject { retry_after_secs }
    }

    /// Report how an admitted request finished.
    ///
    /// `success` is false for a 5xx response or an error from the inner
    /// service.
    pub async fn record_outcome(&self, success: bool) {
        if success {
            self.on_success().await;
        } else {
            self.on_failure().await;
        }
    }

    /// Handle successful operation.
    async fn on_success(&self) {
        CircuitBreakerMetrics::record_success();
        let mut state = self.state.write().await;

        match state.state {
            State::Closed => {
                state.failure_count = state.failure_count.saturating_sub(1);
            }
            State::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(
                        successes = state.success_count,
                        "Circuit breaker transitioning HALF_OPEN -> CLOSED"
                    );
                    *state = CircuitBreakerState::closed();
                    CircuitBreakerMetrics::record_state(State::Closed);
                }
            }
            State::Open => {}
        }
    }

    /// Handle failed operation.
    async fn on_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_failure();

        let mut state = self.state.write().await;
        state.last_failure_time = Some(self.clock.now());

        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning CLOSED -> OPEN"
                    );
                    state.state = State::Open;
                    CircuitBreakerMetrics::record_state(State::Open);
                }
            }
            State::HalfOpen => {
                tracing::warn!("Circuit breaker transitioning HALF_OPEN -> OPEN (recovery failed)");
                state.state = State::Open;
                state.success_count = 0;
                CircuitBreakerMetrics::record_state(State::Open);
            }
            // In-flight requests admitted before the circuit opened.
            State::Open => {}
        }
    }

    /// Cumulative request counters.
    #[must_use]
    pub fn metrics(&self) -> CircuitMetricsSnapshot {
        CircuitMetricsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            rejected_requests: self.rejected_requests.load(Ordering::Relaxed),
        }
    }

    /// Point-in-time view of state, counters and metrics for health output.
    pub async fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.read().await;
        CircuitSnapshot {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            last_failure_time: state.last_failure_time,
            metrics: self.metrics(),
        }
    }

    /// Reset the circuit breaker to closed state.
    ///
    /// Cumulative metrics are kept.
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!("Circuit breaker manually reset to CLOSED");
        *state = CircuitBreakerState::closed();
        CircuitBreakerMetrics::record_state(State::Closed);
    }
}

/// Cumulative request counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetricsSnapshot {
    /// Requests seen by the breaker (excluded paths are not counted)
    pub total_requests: u64,
    /// Requests that finished with a failure
    pub failed_requests: u64,
    /// Requests rejected while the circuit was open
    pub rejected_requests: u64,
}

impl CircuitMetricsSnapshot {
    /// Calculate failure rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.failed_requests as f64 / self.total_requests as f64
    }
}

/// Health view of a [`CircuitBreaker`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    /// Current state
    pub state: State,
    /// Failures counted while Closed
    pub failure_count: u32,
    /// Successes counted while `HalfOpen`
    pub success_count: u32,
    /// Time of the most recent failure
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Cumulative counters
    pub metrics: CircuitMetricsSnapshot,
}

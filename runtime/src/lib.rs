//! # Analytics Runtime
//!
//! Resilience runtime for the analytics service.
//!
//! ## Core Components
//!
//! - **Circuit breaker**: admission control for inbound HTTP requests
//! - **Rate limiter**: tiered fixed-window quotas over shared or in-process counters
//! - **Event consumer**: broker session with bounded retry, cooldown and a dead-letter topic
//! - **Retry**: fixed-delay retry for outbound calls
//! - **Metrics**: Prometheus recorder and per-component metric recorders
//!
//! ## Example
//!
//! ```ignore
//! use analytics_runtime::consumer::EventConsumer;
//!
//! let consumer = EventConsumer::builder()
//!     .connector(connector)
//!     .handler(handler)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! ```

/// Circuit breaker for inbound requests
pub mod circuit_breaker;

/// Event consumer with retry, cooldown and dead-lettering
pub mod consumer;

/// Event handler trait used by the consumer
pub mod handlers;

/// Prometheus metrics for observability
pub mod metrics;

/// Tiered fixed-window rate limiting
pub mod rate_limit;

/// Fixed-delay retry for outbound calls
pub mod retry;

pub use circuit_breaker::{Admission, CircuitBreaker, CircuitBreakerConfig, State};
pub use consumer::{
    ConnectionState, ConsumerConfig, ConsumerHandle, ConsumerStatus, EventConsumer,
    ReconnectPolicy,
};
pub use handlers::{EventHandler, HandlerError};
pub use rate_limit::{RateLimitDecision, RateLimiter};
pub use retry::RetryPolicy;

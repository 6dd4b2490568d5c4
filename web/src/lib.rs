//! Axum integration for the analytics service.
//!
//! This crate is the HTTP shell around the resilience runtime: it turns
//! breaker admissions and rate-limit decisions into responses, reads the
//! caller identity the API gateway forwards, and serves health and metrics.
//!
//! # Request Flow
//!
//! ```text
//! request ─► correlation id ─► circuit breaker ─► rate limit ─► handler
//!                                   │                 │
//!                                   ▼                 ▼
//!                              503 + Retry-After  429 + Retry-After
//! ```
//!
//! # Example
//!
//! ```ignore
//! use analytics_web::{AppState, middleware::{correlation_id_layer, CircuitBreakerLayer, RateLimitLayer}};
//! use axum::{Router, routing::get};
//!
//! let app = Router::new()
//!     .route("/api/v1/reports", get(reports).layer(RateLimitLayer::tiered(state.limiter.clone())))
//!     .route("/api/v1/analytics/health", get(analytics_web::handlers::analytics_health))
//!     .layer(CircuitBreakerLayer::new(state.breaker.clone()))
//!     .layer(correlation_id_layer())
//!     .with_state(state);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod state;

// Re-export key types for convenience
pub use error::{AppError, CircuitOpenRejection, RateLimitRejection};
pub use extractors::{Authenticated, ClientIp, CorrelationId, GatewayIdentity};
pub use middleware::{
    CORRELATION_ID_HEADER, CircuitBreakerLayer, RateLimitLayer, correlation_id_layer,
};
pub use state::AppState;

/// Result type alias for web handlers.
pub type WebResult<T> = Result<T, AppError>;

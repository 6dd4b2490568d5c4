//! Analytics service.
//!
//! Consumes beat events from Redpanda, turns `BEAT_CREATED` into beat metrics
//! calculations, and serves an HTTP surface guarded by a circuit breaker and
//! per-caller rate limits.
//!
//! # Architecture
//!
//! ```text
//!   beats-events ──► EventConsumer ──► AnalyticsEventHandler ──► BeatCreatedDispatcher
//!                        │                                            │ (3 attempts)
//!                        ▼ on failure                                 ▼
//!                  analytics-dlq                          POST beat-metrics/calculate
//!
//!   HTTP ──► correlation id ──► circuit breaker ──► rate limit ──► handler
//! ```
//!
//! - [`config`]: environment configuration
//! - [`events`]: event handler, dispatcher and outbound trigger
//! - [`server`]: router and demonstration endpoints
//! - [`lifecycle`]: startup, serving and graceful shutdown

pub mod config;
pub mod events;
pub mod lifecycle;
pub mod server;

pub use config::{Config, ConfigError, DEFAULT_BEAT_METRICS_ENDPOINT};
pub use lifecycle::Application;

//! HTTP request handlers shared by services built on this crate.

pub mod health;
pub mod metrics;

pub use health::{analytics_health, health_check};
pub use metrics::metrics;

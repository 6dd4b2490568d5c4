//! Event processing for the analytics input topic.
//!
//! - [`handler`]: the consumer's [`EventHandler`](analytics_runtime::EventHandler),
//!   routing by event type
//! - [`dispatcher`]: `BEAT_CREATED` validation and bounded retry
//! - [`trigger`]: the outbound beat metrics call

pub mod dispatcher;
pub mod handler;
pub mod trigger;

pub use dispatcher::BeatCreatedDispatcher;
pub use handler::AnalyticsEventHandler;
pub use trigger::{BeatMetricsRequest, BeatMetricsTrigger, DispatchError, HttpBeatMetricsTrigger};

//! # Analytics Core
//!
//! Core traits and types shared by the analytics service resilience core.
//!
//! The service guards its request and event paths with three mechanisms
//! (circuit breaker, rate limiter, event consumer). They are implemented in
//! `analytics-runtime`; this crate holds the vocabulary they share:
//!
//! - **Environment**: injected time ([`environment::Clock`]) and suspension
//!   ([`environment::Sleeper`]) so every timeout, window and cooldown can be
//!   fast-forwarded in tests
//! - **Events**: the inbound message envelope, the tagged domain event enum
//!   and the dead-letter record ([`event`])
//! - **Event bus**: the broker abstraction the consumer connects through
//!   ([`event_bus`])
//!
//! ## Example
//!
//! ```
//! use analytics_core::event::{AnalyticsEvent, EventEnvelope};
//!
//! let raw = br#"{"type":"BEAT_CREATED","payload":{"beatId":"b1","audioUrl":"s3://b1.wav"}}"#;
//! let envelope = EventEnvelope::decode(raw).unwrap();
//!
//! match AnalyticsEvent::from_envelope(&envelope) {
//!     AnalyticsEvent::BeatCreated(beat) => assert_eq!(beat.beat_id.as_deref(), Some("b1")),
//!     AnalyticsEvent::Unknown { event_type } => panic!("unexpected {event_type}"),
//! }
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

pub mod event;
pub mod event_bus;

/// Environment module - Dependency injection traits
///
/// All sources of time used by the resilience core are abstracted behind
/// these traits and injected into the components that need them.
pub mod environment {
    use chrono::{DateTime, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::time::Duration;

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use analytics_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }

    /// Sleeper trait - abstracts task suspension for testability
    ///
    /// Retry delays and connection cooldowns go through a `Sleeper` so tests
    /// can observe the requested durations without waiting on the wall clock.
    ///
    /// The trait returns a boxed future (instead of `async fn`) so it can be
    /// used as `Arc<dyn Sleeper>`.
    pub trait Sleeper: Send + Sync {
        /// Suspend the calling task for `duration`.
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
    }

    /// Production sleeper backed by `tokio::time::sleep`.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct TokioSleeper;

    impl Sleeper for TokioSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            Box::pin(tokio::time::sleep(duration))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::environment::{Clock, Sleeper, SystemClock, TokioSleeper};
    use std::time::Duration;

    #[test]
    fn system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }

    #[tokio::test(start_paused = true)]
    async fn tokio_sleeper_waits_for_duration() {
        let start = tokio::time::Instant::now();
        TokioSleeper.sleep(Duration::from_secs(30)).await;
        assert!(start.elapsed() >= Duration::from_secs(30));
    }
}

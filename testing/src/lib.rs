//! # Analytics Testing
//!
//! Testing utilities and doubles for the analytics service.
//!
//! This crate provides:
//! - Controllable implementations of the environment traits
//!   ([`ManualClock`], [`RecordingSleeper`])
//! - Broker doubles ([`InMemoryEventBus`], [`ScriptedConnector`])
//! - Test helpers
//!
//! ## Example
//!
//! ```
//! use analytics_core::environment::Clock;
//! use analytics_testing::test_clock;
//! use std::time::Duration;
//!
//! let clock = test_clock();
//! let start = clock.now();
//! clock.advance(Duration::from_secs(61));
//! assert_eq!((clock.now() - start).num_seconds(), 61);
//! ```

use chrono::{DateTime, Utc};
use analytics_core::environment::{Clock, Sleeper};

pub mod event_bus;

/// Mock implementations of Environment traits
pub mod mocks {
    use super::{Clock, DateTime, Sleeper, Utc};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// Manually driven clock for deterministic tests
    ///
    /// Time only moves when the test calls [`advance`](Self::advance) or
    /// [`set`](Self::set). Clones share the same time source.
    ///
    /// # Example
    ///
    /// ```
    /// use analytics_testing::mocks::ManualClock;
    /// use analytics_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = ManualClock::new(Utc::now());
    /// let time1 = clock.now();
    /// let time2 = clock.now();
    /// assert_eq!(time1, time2);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Create a new clock starting at the given time
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move the clock forward.
        ///
        /// Durations too large for `chrono` saturate to the maximum delta.
        pub fn advance(&self, by: Duration) {
            let delta = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time += delta;
        }

        /// Jump to an absolute time.
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = to;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }

    /// Manual clock at 2025-01-01T00:00:00Z, a whole-minute boundary.
    #[must_use]
    pub fn test_clock() -> ManualClock {
        ManualClock::new(DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::seconds(1_735_689_600))
    }

    /// Sleeper that records requested durations instead of waiting.
    ///
    /// Each call yields to the scheduler once so that loops driven by the
    /// sleeper stay cooperative. When linked to a [`ManualClock`] the clock is
    /// advanced by the requested duration.
    #[derive(Debug, Clone, Default)]
    pub struct RecordingSleeper {
        sleeps: Arc<Mutex<Vec<Duration>>>,
        clock: Option<ManualClock>,
    }

    impl RecordingSleeper {
        /// Create a sleeper that only records.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a sleeper that also advances `clock`.
        #[must_use]
        pub fn with_clock(clock: ManualClock) -> Self {
            Self {
                sleeps: Arc::default(),
                clock: Some(clock),
            }
        }

        /// Durations requested so far, in order.
        #[must_use]
        pub fn sleeps(&self) -> Vec<Duration> {
            self.sleeps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        /// Number of sleeps requested so far.
        #[must_use]
        pub fn count(&self) -> usize {
            self.sleeps.lock().unwrap_or_else(PoisonError::into_inner).len()
        }
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
            self.sleeps
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(duration);
            if let Some(clock) = &self.clock {
                clock.advance(duration);
            }
            Box::pin(tokio::task::yield_now())
        }
    }
}

/// Test helpers and utilities
pub mod helpers {
    use std::future::Future;
    use std::time::Duration;

    /// Install a `tracing` subscriber that writes to the test output.
    ///
    /// Safe to call from every test; only the first call installs.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    /// Poll `condition` until it holds or `timeout` elapses.
    ///
    /// Returns whether the condition was met.
    pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition() {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Poll an async `condition` until it holds or `timeout` elapses.
    pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if condition().await {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

// Re-export commonly used items
pub use event_bus::{InMemoryEventBus, InboundSender, ScriptedConnector};
pub use mocks::{ManualClock, RecordingSleeper, test_clock};

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_manual_clock_is_fixed_until_advanced() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);

        clock.advance(Duration::from_millis(1500));
        assert_eq!((clock.now() - time1).num_milliseconds(), 1500);
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = test_clock();
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), other.now());
    }

    #[tokio::test]
    async fn test_recording_sleeper_records_and_advances() {
        let clock = test_clock();
        let start = clock.now();
        let sleeper = RecordingSleeper::with_clock(clock.clone());

        sleeper.sleep(Duration::from_secs(3)).await;
        sleeper.sleep(Duration::from_secs(30)).await;

        assert_eq!(
            sleeper.sleeps(),
            vec![Duration::from_secs(3), Duration::from_secs(30)]
        );
        assert_eq!((clock.now() - start).num_seconds(), 33);
    }
}

//! Bounded retry with a fixed delay for transient downstream failures.
//!
//! Used by the event dispatcher around its outbound call: a fixed number of
//! attempts with the same pause between each, after which the last error is
//! returned. Delays go through an injected [`Sleeper`] so only the calling
//! task is suspended and tests can observe the pauses.
//!
//! # Example
//!
//! ```rust
//! use analytics_core::environment::TokioSleeper;
//! use analytics_runtime::retry::{RetryPolicy, retry_with_delay};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), String> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .delay(Duration::from_secs(2))
//!     .build();
//!
//! let result = retry_with_delay(&policy, &TokioSleeper, || async {
//!     Ok::<_, String>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::metrics::RetryMetrics;
use analytics_core::environment::Sleeper;
use std::future::Future;
use std::time::Duration;

/// Fixed-delay retry policy.
///
/// # Default Values
///
/// - `max_attempts`: 3 (the first try included)
/// - `delay`: 2 seconds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first
    pub max_attempts: u32,
    /// Pause between consecutive attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            delay: None,
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    delay: Option<Duration>,
}

impl RetryPolicyBuilder {
    /// Set the total number of attempts. Values below 1 are treated as 1.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the pause between attempts.
    #[must_use]
    pub const fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Build the [`RetryPolicy`].
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(3).max(1),
            delay: self.delay.unwrap_or(Duration::from_secs(2)),
        }
    }
}

/// Retry an async operation with a fixed delay between attempts.
///
/// Every error is treated as retryable.
///
/// # Errors
///
/// Returns the error of the final attempt once `max_attempts` are used up.
pub async fn retry_with_delay<F, Fut, T, E>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    retry_with_predicate(policy, sleeper, operation, |_| true).await
}

/// Retry an async operation, giving up early on errors `is_retryable`
/// rejects.
///
/// # Errors
///
/// Returns the first non-retryable error, or the error of the final attempt
/// once `max_attempts` are used up.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    mut operation: F,
    is_retryable: P,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    RetryMetrics::record_success();
                    tracing::info!(attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !is_retryable(&err) {
                    tracing::warn!(
                        error = %err,
                        "Error is not retryable, failing immediately"
                    );
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    RetryMetrics::record_exhausted();
                    tracing::error!(
                        attempt,
                        error = %err,
                        "Operation failed after max attempts"
                    );
                    return Err(err);
                }

                RetryMetrics::record_attempt();
                tracing::warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = u64::try_from(policy.delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, retrying..."
                );

                sleeper.sleep(policy.delay).await;
                attempt += 1;
            }
        }
    }
}

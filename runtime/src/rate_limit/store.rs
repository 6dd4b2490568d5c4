//! Fixed-window counter stores.
//!
//! A [`CounterStore`] owns the only mutable rate-limit state: how many
//! requests each key has made in the current window. Keys carry their window
//! bucket, so a counter is never reset; it simply expires along with its
//! window.
//!
//! The store is chosen once at startup by [`select_counter_store`]: Redis
//! when it answers within the connect timeout, otherwise an in-process map for
//! the rest of the process lifetime.

use super::redis_store::RedisCounterStore;
use analytics_core::environment::Clock;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// How long startup waits for Redis before falling back.
pub const REDIS_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// In-process entries are swept once the map grows past this size.
const SWEEP_THRESHOLD: usize = 10_000;

/// Errors from counter store operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CounterStoreError {
    /// Could not reach the backend at startup
    #[error("Counter store connection failed: {0}")]
    Connection(String),

    /// A counter operation failed
    #[error("Counter store operation failed: {0}")]
    Operation(String),
}

/// Which backend holds the counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// Counters are shared between instances (Redis)
    Shared,
    /// Counters live in this process only
    InProcess,
}

impl StoreMode {
    /// Mode name as reported by health.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Shared => "shared",
            Self::InProcess => "in-process",
        }
    }
}

/// Fixed-window counter backend.
///
/// # Dyn Compatibility
///
/// Explicit `Pin<Box<dyn Future>>` returns keep the trait usable as
/// `Arc<dyn CounterStore>`.
pub trait CounterStore: Send + Sync {
    /// Increment the counter for `key` and return the post-increment value.
    ///
    /// The counter expires `window` after its first increment.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError::Operation`] if the backend fails.
    fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<u64, CounterStoreError>> + Send + '_>>;

    /// Which backend this is.
    fn mode(&self) -> StoreMode;
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Counters held in a process-local map.
pub struct InMemoryCounterStore {
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Entry>>,
}

impl std::fmt::Debug for InMemoryCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCounterStore")
            .field("keys", &self.len())
            .finish_non_exhaustive()
    }
}

impl InMemoryCounterStore {
    /// Create an empty store reading time from `clock`.
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Number of live and not-yet-swept keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the store holds no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn increment_now(&self, key: &str, window: Duration) -> u64 {
        let now = self.clock.now();
        let expires_at = chrono::Duration::from_std(window)
            .ok()
            .and_then(|window| now.checked_add_signed(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if entries.len() > SWEEP_THRESHOLD {
            entries.retain(|_, entry| entry.expires_at > now);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            expires_at,
        });
        if entry.expires_at <= now {
            *entry = Entry {
                count: 0,
                expires_at,
            };
        }
        entry.count += 1;
        entry.count
    }
}

impl CounterStore for InMemoryCounterStore {
    fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<u64, CounterStoreError>> + Send + '_>> {
        let count = self.increment_now(key, window);
        Box::pin(async move { Ok(count) })
    }

    fn mode(&self) -> StoreMode {
        StoreMode::InProcess
    }
}

/// Choose the counter store for the lifetime of the process.
///
/// With a `redis_url`, tries to connect and ping within
/// [`REDIS_CONNECT_TIMEOUT`]. Any failure (or no URL) selects the in-process
/// store. The decision is logged and never revisited.
pub async fn select_counter_store(
    redis_url: Option<&str>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn CounterStore> {
    let Some(url) = redis_url.filter(|u| !u.trim().is_empty()) else {
        tracing::info!(mode = StoreMode::InProcess.as_str(), "No Redis URL configured, using in-process rate limit counters");
        return Arc::new(InMemoryCounterStore::new(clock));
    };

    match tokio::time::timeout(REDIS_CONNECT_TIMEOUT, RedisCounterStore::connect(url)).await {
        Ok(Ok(store)) => {
            tracing::info!(mode = StoreMode::Shared.as_str(), "Rate limit counters stored in Redis");
            Arc::new(store)
        }
        Ok(Err(e)) => {
            tracing::warn!(
                error = %e,
                mode = StoreMode::InProcess.as_str(),
                "Redis unavailable, rate limits are per-instance for this process"
            );
            Arc::new(InMemoryCounterStore::new(clock))
        }
        Err(_) => {
            tracing::warn!(
                timeout_secs = REDIS_CONNECT_TIMEOUT.as_secs(),
                mode = StoreMode::InProcess.as_str(),
                "Redis connection timed out, rate limits are per-instance for this process"
            );
            Arc::new(InMemoryCounterStore::new(clock))
        }
    }
}

//! Redis-backed counter store.
//!
//! Each increment runs `INCR` and `EXPIRE` in one atomic pipeline. Keys carry
//! their window bucket, so refreshing the TTL on every hit never stretches a
//! window; it only delays cleanup of the finished bucket.

use super::store::{CounterStore, CounterStoreError, StoreMode};
use redis::Client;
use redis::aio::ConnectionManager;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Counter store shared between instances through Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    /// Connection manager for connection pooling.
    conn_manager: ConnectionManager,
}

impl std::fmt::Debug for RedisCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCounterStore").finish_non_exhaustive()
    }
}

impl RedisCounterStore {
    /// Connect to Redis and verify the connection with `PING`.
    ///
    /// # Errors
    ///
    /// Returns [`CounterStoreError::Connection`] if the URL is invalid or the
    /// server does not answer.
    pub async fn connect(redis_url: &str) -> Result<Self, CounterStoreError> {
        let client = Client::open(redis_url).map_err(|e| {
            CounterStoreError::Connection(format!("Failed to create Redis client: {e}"))
        })?;

        let mut conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            CounterStoreError::Connection(format!(
                "Failed to create Redis connection manager: {e}"
            ))
        })?;

        let _pong: String = redis::cmd("PING")
            .query_async(&mut conn_manager)
            .await
            .map_err(|e| CounterStoreError::Connection(format!("Redis PING failed: {e}")))?;

        Ok(Self { conn_manager })
    }
}

impl CounterStore for RedisCounterStore {
    fn increment(
        &self,
        key: &str,
        window: Duration,
    ) -> Pin<Box<dyn Future<Output = Result<u64, CounterStoreError>> + Send + '_>> {
        let key = key.to_string();
        let mut conn = self.conn_manager.clone();
        let ttl_secs = i64::try_from(window.as_secs().max(1)).unwrap_or(i64::MAX);

        Box::pin(async move {
            let (count,): (u64,) = redis::pipe()
                .atomic()
                .incr(&key, 1)
                .expire(&key, ttl_secs)
                .ignore()
                .query_async(&mut conn)
                .await
                .map_err(|e| {
                    tracing::error!(
                        error = %e,
                        key = %key,
                        "Redis pipeline failed during rate limit increment"
                    );
                    CounterStoreError::Operation(e.to_string())
                })?;

            Ok(count)
        })
    }

    fn mode(&self) -> StoreMode {
        StoreMode::Shared
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[tokio::test]
    async fn invalid_url_is_a_connection_error() {
        let result = RedisCounterStore::connect("not a url").await;
        assert!(matches!(result, Err(CounterStoreError::Connection(_))));
    }

    #[tokio::test]
    #[ignore = "requires Redis at redis://127.0.0.1:6379"]
    async fn increments_shared_counter() {
        let store = RedisCounterStore::connect("redis://127.0.0.1:6379")
            .await
            .unwrap();
        let key = format!("rate_limit:test:{}", chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0));

        assert_eq!(store.increment(&key, Duration::from_secs(60)).await.unwrap(), 1);
        assert_eq!(store.increment(&key, Duration::from_secs(60)).await.unwrap(), 2);
        assert_eq!(store.mode(), StoreMode::Shared);
    }
}

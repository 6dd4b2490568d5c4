//! Configuration management for the analytics service.
//!
//! Loads configuration from environment variables with sensible defaults.
//! `main` reads an optional `.env` file through `dotenvy` first, so both
//! sources end up in the process environment.
//!
//! Numeric settings fall back to their default when unparseable. Quota
//! settings are strict: a malformed `RATE_LIMIT_*` value fails startup
//! instead of silently loosening a limit.
//!
//! `BEAT_METRICS_ENDPOINT` must be set to the beat metrics calculation
//! service in every deployment. Its default is a local development
//! placeholder; this service serves no such route, so dispatches against
//! the default fail and land in the dead-letter topic.

use analytics_redpanda::RedpandaConnector;
use analytics_runtime::circuit_breaker::{CircuitBreakerConfig, DEFAULT_EXCLUDED_PATHS};
use analytics_runtime::consumer::{ConsumerConfig, ReconnectPolicy};
use analytics_runtime::rate_limit::{QuotaParseError, RateLimitQuota, RateLimiterConfig, TierTable};
use analytics_runtime::retry::RetryPolicy;
use std::env;
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A quota variable does not use `<count>/<period>` notation.
    #[error("{var}: {source}")]
    InvalidQuota {
        /// Offending variable
        var: &'static str,
        /// Parse failure
        #[source]
        source: QuotaParseError,
    },
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Redpanda/Kafka configuration
    pub redpanda: RedpandaConfig,
    /// Rate limiter configuration
    pub rate_limit: RateLimitConfig,
    /// Circuit breaker configuration
    pub circuit_breaker: CircuitBreakerSettings,
    /// `BEAT_CREATED` dispatcher configuration
    pub dispatcher: DispatcherConfig,
}

/// Server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to bind to
    pub port: u16,
    /// Log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Seconds to wait for the consumer to stop on shutdown
    pub shutdown_timeout: u64,
}

impl ServerConfig {
    /// `host:port` to bind.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Redpanda/Kafka configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedpandaConfig {
    /// Run the event consumer at all
    pub enabled: bool,
    /// Broker addresses (comma-separated)
    pub brokers: String,
    /// Consumer group
    pub consumer_group: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Topic carrying beat events
    pub input_topic: String,
    /// Dead-letter topic
    pub dead_letter_topic: String,
    /// Failed connection attempts before a cooldown
    pub max_retries: u32,
    /// Pause between failed connection attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Pause after `max_retries` failures, in milliseconds
    pub cooldown_ms: u64,
    /// Session timeout in milliseconds (default: 30000)
    pub session_timeout_ms: u32,
    /// Heartbeat interval in milliseconds (default: 10000)
    pub heartbeat_interval_ms: u32,
    /// Max poll interval in milliseconds (default: 300000)
    pub max_poll_interval_ms: u32,
    /// Reconnect when the read loop loses its session (default: true)
    pub reconnect_on_disconnect: bool,
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Redis URL for shared counters; `None` keeps counters in process
    pub redis_url: Option<String>,
    /// Per-plan quotas
    pub tiers: TierTable,
    /// Quota for callers without a gateway identity
    pub unauthenticated: RateLimitQuota,
    /// Quota for endpoints declared strict
    pub strict: RateLimitQuota,
}

/// Circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerSettings {
    /// Failures before the circuit opens
    pub failure_threshold: u32,
    /// Probe successes before the circuit closes
    pub success_threshold: u32,
    /// Seconds the circuit stays open after the last failure
    pub timeout_secs: u64,
    /// Path prefixes that bypass the breaker
    pub excluded_paths: Vec<String>,
}

/// Development placeholder for `BEAT_METRICS_ENDPOINT`.
///
/// Points at port 3003 on localhost, where nothing answers this path. Set
/// the variable to the real calculation endpoint.
pub const DEFAULT_BEAT_METRICS_ENDPOINT: &str =
    "http://localhost:3003/api/v1/analytics/beat-metrics/calculate";

/// `BEAT_CREATED` dispatcher configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
    /// Beat metrics calculation endpoint, served by another service
    pub endpoint: String,
    /// Attempts per event, the first included
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Per-request timeout in seconds
    pub timeout_secs: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQuota`] if a `RATE_LIMIT_*` variable is
    /// malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidQuota`] if a `RATE_LIMIT_*` variable is
    /// malformed.
    #[allow(clippy::too_many_lines)] // Config loading is naturally long but simple
    pub fn from_lookup<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let limiter_defaults = RateLimiterConfig::default();

        Ok(Self {
            server: ServerConfig {
                host: var("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: var("PORT").and_then(|s| s.parse().ok()).unwrap_or(3003),
                log_level: var("RUST_LOG")
                    .unwrap_or_else(|| "analytics_service=info,tower_http=info".to_string()),
                shutdown_timeout: var("SHUTDOWN_TIMEOUT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            },
            redpanda: RedpandaConfig {
                enabled: var("ENABLE_KAFKA")
                    .and_then(|s| parse_flag(&s))
                    .unwrap_or(true),
                brokers: var("KAFKA_BROKER").unwrap_or_else(|| "localhost:9092".to_string()),
                consumer_group: var("KAFKA_CONSUMER_GROUP")
                    .unwrap_or_else(|| "analytics-service-group".to_string()),
                client_id: var("KAFKA_CLIENT_ID")
                    .unwrap_or_else(|| "analytics-and-dashboards".to_string()),
                input_topic: var("KAFKA_INPUT_TOPIC")
                    .unwrap_or_else(|| "beats-events".to_string()),
                dead_letter_topic: var("KAFKA_DLQ_TOPIC")
                    .unwrap_or_else(|| "analytics-dlq".to_string()),
                max_retries: var("KAFKA_CONNECTION_MAX_RETRIES")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
                retry_delay_ms: var("KAFKA_CONNECTION_RETRY_DELAY")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3000),
                cooldown_ms: var("KAFKA_COOLDOWN")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30_000),
                session_timeout_ms: var("KAFKA_SESSION_TIMEOUT_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30_000),
                heartbeat_interval_ms: var("KAFKA_HEARTBEAT_INTERVAL_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10_000),
                max_poll_interval_ms: var("KAFKA_MAX_POLL_INTERVAL_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(300_000),
                reconnect_on_disconnect: var("KAFKA_RECONNECT_ON_DISCONNECT")
                    .and_then(|s| parse_flag(&s))
                    .unwrap_or(true),
            },
            rate_limit: RateLimitConfig {
                redis_url: var("REDIS_URL")
                    .map_or_else(|| Some("redis://localhost:6379".to_string()), |url| {
                        Some(url).filter(|u| !u.trim().is_empty())
                    }),
                tiers: match non_empty(var("RATE_LIMIT_TIERS")) {
                    Some(raw) => raw.parse().map_err(|source| ConfigError::InvalidQuota {
                        var: "RATE_LIMIT_TIERS",
                        source,
                    })?,
                    None => limiter_defaults.tiers,
                },
                unauthenticated: quota(
                    &var,
                    "RATE_LIMIT_UNAUTHENTICATED",
                    limiter_defaults.unauthenticated,
                )?,
                strict: quota(&var, "RATE_LIMIT_STRICT", limiter_defaults.strict)?,
            },
            circuit_breaker: CircuitBreakerSettings {
                failure_threshold: var("CIRCUIT_BREAKER_FAILURE_THRESHOLD")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
                success_threshold: var("CIRCUIT_BREAKER_SUCCESS_THRESHOLD")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2),
                timeout_secs: var("CIRCUIT_BREAKER_TIMEOUT")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
                excluded_paths: non_empty(var("CIRCUIT_BREAKER_EXCLUDED_PATHS")).map_or_else(
                    || DEFAULT_EXCLUDED_PATHS.iter().map(ToString::to_string).collect(),
                    |raw| {
                        raw.split(',')
                            .map(str::trim)
                            .filter(|p| !p.is_empty())
                            .map(str::to_string)
                            .collect()
                    },
                ),
            },
            dispatcher: DispatcherConfig {
                endpoint: var("BEAT_METRICS_ENDPOINT")
                    .unwrap_or_else(|| DEFAULT_BEAT_METRICS_ENDPOINT.to_string()),
                max_attempts: var("DISPATCH_MAX_ATTEMPTS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3),
                retry_delay_ms: var("DISPATCH_RETRY_DELAY_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(2000),
                timeout_secs: var("DISPATCH_TIMEOUT_SECS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            },
        })
    }

    /// Consumer settings for the input topic.
    #[must_use]
    pub fn consumer_config(&self) -> ConsumerConfig {
        let redpanda = &self.redpanda;
        ConsumerConfig::builder()
            .name("analytics-consumer")
            .input_topic(redpanda.input_topic.clone())
            .dead_letter_topic(redpanda.dead_letter_topic.clone())
            .max_retries(redpanda.max_retries)
            .retry_delay(Duration::from_millis(redpanda.retry_delay_ms))
            .cooldown(Duration::from_millis(redpanda.cooldown_ms))
            .reconnect(if redpanda.reconnect_on_disconnect {
                ReconnectPolicy::Reconnect
            } else {
                ReconnectPolicy::Never
            })
            .build()
    }

    /// Broker connector for the consumer.
    #[must_use]
    pub fn redpanda_connector(&self) -> RedpandaConnector {
        let redpanda = &self.redpanda;
        RedpandaConnector::builder()
            .brokers(redpanda.brokers.clone())
            .consumer_group(redpanda.consumer_group.clone())
            .client_id(redpanda.client_id.clone())
            .session_timeout_ms(redpanda.session_timeout_ms)
            .heartbeat_interval_ms(redpanda.heartbeat_interval_ms)
            .max_poll_interval_ms(redpanda.max_poll_interval_ms)
            .build()
    }

    /// Quotas for the rate limiter.
    #[must_use]
    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            tiers: self.rate_limit.tiers.clone(),
            unauthenticated: self.rate_limit.unauthenticated,
            strict: self.rate_limit.strict,
        }
    }

    /// Thresholds for the request-path circuit breaker.
    #[must_use]
    pub fn circuit_breaker_config(&self) -> CircuitBreakerConfig {
        let settings = &self.circuit_breaker;
        CircuitBreakerConfig::builder()
            .failure_threshold(settings.failure_threshold)
            .success_threshold(settings.success_threshold)
            .timeout(Duration::from_secs(settings.timeout_secs))
            .excluded_paths(settings.excluded_paths.iter().cloned())
            .build()
    }

    /// Retry policy for the dispatcher's outbound call.
    #[must_use]
    pub fn dispatch_retry_policy(&self) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(self.dispatcher.max_attempts)
            .delay(Duration::from_millis(self.dispatcher.retry_delay_ms))
            .build()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn quota<F>(var: &F, key: &'static str, default: RateLimitQuota) -> Result<RateLimitQuota, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    non_empty(var(key)).map_or(Ok(default), |raw| {
        raw.parse()
            .map_err(|source| ConfigError::InvalidQuota { var: key, source })
    })
}

/// `true`/`false` in the spellings people put in `.env` files.
fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

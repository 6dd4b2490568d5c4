//! Tier-aware fixed-window rate limiter.
//!
//! Callers are keyed by identity (`user:<id>`) when the gateway vouched for
//! them and by address (`ip:<addr>`) otherwise. Each endpoint declares one or
//! more [`QuotaPolicy`] entries; every declared quota is enforced and the
//! first one exceeded rejects the request.

use super::quota::{PricingPlan, RateLimitQuota, TierTable};
use super::store::{CounterStore, StoreMode};
use crate::metrics::RateLimitMetrics;
use analytics_core::environment::{Clock, SystemClock};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Plan name reported for callers without an identity.
pub const UNAUTHENTICATED_PLAN: &str = "unauthenticated";

/// Caller identity as forwarded by the trusted gateway.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CallerIdentity {
    /// User id
    pub user_id: String,
    /// Roles granted to the user
    pub roles: Vec<String>,
    /// Raw pricing plan header, if any
    pub pricing_plan: Option<String>,
}

impl CallerIdentity {
    /// Identity for `user_id` with no roles and the given plan.
    #[must_use]
    pub fn new(user_id: impl Into<String>, pricing_plan: Option<&str>) -> Self {
        Self {
            user_id: user_id.into(),
            roles: Vec::new(),
            pricing_plan: pricing_plan.map(str::to_string),
        }
    }

    /// Parsed plan; unknown or missing plans are [`PricingPlan::Free`].
    #[must_use]
    pub fn plan(&self) -> PricingPlan {
        PricingPlan::parse_or_free(self.pricing_plan.as_deref())
    }
}

/// Quota declared for an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaPolicy {
    /// Quota from the caller's plan (unauthenticated quota without identity)
    Tiered,
    /// The configured strict quota
    Strict,
    /// A fixed quota regardless of plan
    Fixed(RateLimitQuota),
}

impl QuotaPolicy {
    const fn scope(self) -> &'static str {
        match self {
            Self::Tiered => "tiered",
            Self::Strict => "strict",
            Self::Fixed(_) => "fixed",
        }
    }
}

/// Counter key, quota and plan resolved for one caller and one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaAssignment {
    /// `user:<id>` or `ip:<addr>`
    pub key: String,
    /// Quota to enforce
    pub quota: RateLimitQuota,
    /// Caller's plan, `None` when unauthenticated
    pub plan: Option<PricingPlan>,
    /// Which policy produced this assignment
    pub scope: &'static str,
}

impl QuotaAssignment {
    /// Plan name for rejection payloads.
    #[must_use]
    pub fn plan_name(&self) -> &'static str {
        self.plan.map_or(UNAUTHENTICATED_PLAN, PricingPlan::as_str)
    }
}

/// Result of [`RateLimiter::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// Within quota.
    Allow {
        /// Quota count
        limit: u64,
        /// Requests left in the current window
        remaining: u64,
        /// Seconds until the current window ends
        reset_after_secs: u64,
    },
    /// Over quota.
    Reject {
        /// Seconds until the current window ends
        retry_after_secs: u64,
        /// Caller's plan name, or `"unauthenticated"`
        plan: &'static str,
        /// Quota count that was exceeded
        limit: u64,
    },
}

impl RateLimitDecision {
    /// Whether the request may proceed.
    #[must_use]
    pub const fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimiterConfig {
    /// Quotas for authenticated callers by plan
    pub tiers: TierTable,
    /// Quota for callers without an identity
    pub unauthenticated: RateLimitQuota,
    /// Quota for endpoints declared strict
    pub strict: RateLimitQuota,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            unauthenticated: RateLimitQuota::per_minute(10),
            strict: RateLimitQuota::new(5, Duration::from_secs(15 * 60)),
        }
    }
}

/// Tier-aware fixed-window rate limiter.
///
/// One instance per process, shared as `Arc<RateLimiter>`.
#[derive(Clone)]
pub struct RateLimiter {
    config: Arc<RateLimiterConfig>,
    store: Arc<dyn CounterStore>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("config", &self.config)
            .field("store", &self.store.mode())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter over `store` using the system clock.
    #[must_use]
    pub fn new(config: RateLimiterConfig, store: Arc<dyn CounterStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a limiter reading window boundaries from `clock`.
    #[must_use]
    pub fn with_clock(
        config: RateLimiterConfig,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            clock,
        }
    }

    /// The limiter's configuration.
    #[must_use]
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Which counter store was selected at startup.
    #[must_use]
    pub fn store_mode(&self) -> StoreMode {
        self.store.mode()
    }

    /// Counter key for a caller.
    #[must_use]
    pub fn key_for(identity: Option<&CallerIdentity>, client_ip: IpAddr) -> String {
        match identity {
            Some(identity) => format!("user:{}", identity.user_id),
            None => format!("ip:{client_ip}"),
        }
    }

    /// Tiered quota for a caller.
    #[must_use]
    pub fn quota_for(&self, identity: Option<&CallerIdentity>, client_ip: IpAddr) -> QuotaAssignment {
        self.assign(QuotaPolicy::Tiered, identity, client_ip)
    }

    /// Resolve one endpoint policy for a caller.
    #[must_use]
    pub fn assign(
        &self,
        policy: QuotaPolicy,
        identity: Option<&CallerIdentity>,
        client_ip: IpAddr,
    ) -> QuotaAssignment {
        let plan = identity.map(CallerIdentity::plan);
        let quota = match policy {
            QuotaPolicy::Tiered => plan.map_or(self.config.unauthenticated, |plan| {
                self.config.tiers.quota(plan)
            }),
            QuotaPolicy::Strict => self.config.strict,
            QuotaPolicy::Fixed(quota) => quota,
        };

        QuotaAssignment {
            key: Self::key_for(identity, client_ip),
            quota,
            plan,
            scope: policy.scope(),
        }
    }

    /// Count one request against `assignment` and decide.
    ///
    /// A failing counter store admits the request and logs the error.
    pub async fn admit(&self, assignment: &QuotaAssignment) -> RateLimitDecision {
        let quota = assignment.quota;
        let window_ms = u64::try_from(quota.window.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        let now_ms = u64::try_from(self.clock.now().timestamp_millis()).unwrap_or(0);
        let bucket = now_ms / window_ms;
        let window_end_ms = bucket.saturating_add(1).saturating_mul(window_ms);
        let reset_after_secs = (window_end_ms - now_ms).div_ceil(1000).max(1);

        let counter_key = format!(
            "rate_limit:{}:{}:{}:{bucket}",
            assignment.scope,
            assignment.key,
            quota.window.as_secs()
        );

        let count = match self.store.increment(&counter_key, quota.window).await {
            Ok(count) => count,
            Err(e) => {
                RateLimitMetrics::record_store_error();
                tracing::error!(
                    error = %e,
                    key = %assignment.key,
                    "Rate limit counter unavailable, admitting request"
                );
                return RateLimitDecision::Allow {
                    limit: quota.count,
                    remaining: quota.count,
                    reset_after_secs,
                };
            }
        };

        if count > quota.count {
            RateLimitMetrics::record_rejected(assignment.scope, assignment.plan_name());
            tracing::info!(
                key = %assignment.key,
                plan = assignment.plan_name(),
                limit = quota.count,
                count,
                retry_after_secs = reset_after_secs,
                "Rate limit exceeded"
            );
            return RateLimitDecision::Reject {
                retry_after_secs: reset_after_secs,
                plan: assignment.plan_name(),
                limit: quota.count,
            };
        }

        RateLimitMetrics::record_allowed(assignment.scope);
        RateLimitDecision::Allow {
            limit: quota.count,
            remaining: quota.count - count,
            reset_after_secs,
        }
    }

    /// Enforce every assignment in order.
    ///
    /// Stops at the first rejection. When all pass, reports the assignment
    /// with the fewest remaining requests.
    pub async fn admit_all(&self, assignments: &[QuotaAssignment]) -> RateLimitDecision {
        let mut tightest: Option<RateLimitDecision> = None;

        for assignment in assignments {
            let decision = self.admit(assignment).await;
            let RateLimitDecision::Allow { remaining, .. } = decision else {
                return decision;
            };
            let tighter = match &tightest {
                Some(RateLimitDecision::Allow { remaining: best, .. }) => remaining < *best,
                _ => true,
            };
            if tighter {
                tightest = Some(decision);
            }
        }

        tightest.unwrap_or(RateLimitDecision::Allow {
            limit: 0,
            remaining: 0,
            reset_after_secs: 0,
        })
    }
}

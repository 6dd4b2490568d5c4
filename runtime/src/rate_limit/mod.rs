//! Adaptive rate limiting.
//!
//! - [`quota`]: quota notation, pricing plans and the tier table
//! - [`store`]: fixed-window counter stores and startup selection
//! - [`redis_store`]: the shared Redis store
//! - [`limiter`]: per-caller quota assignment and admission

pub mod limiter;
pub mod quota;
pub mod redis_store;
pub mod store;

pub use limiter::{
    CallerIdentity, QuotaAssignment, QuotaPolicy, RateLimitDecision, RateLimiter,
    RateLimiterConfig, UNAUTHENTICATED_PLAN,
};
pub use quota::{MAX_WINDOW, PricingPlan, QuotaParseError, RateLimitQuota, TierTable};
pub use redis_store::RedisCounterStore;
pub use store::{
    CounterStore, CounterStoreError, InMemoryCounterStore, StoreMode, select_counter_store,
};

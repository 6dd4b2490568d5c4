//! Quotas, pricing plans and the tier table.
//!
//! Quotas are written as `"<count>/<period>"` where the period is an optional
//! multiplier followed by a unit: `20/minute`, `5/15minute`, `100/hour`.
//! Windows longer than [`MAX_WINDOW`] are rejected.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Longest window quota notation accepts (one year).
pub const MAX_WINDOW: Duration = Duration::from_secs(366 * 86_400);

/// Errors raised while parsing quota notation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaParseError {
    /// Missing `/` separator.
    #[error("Quota '{0}' must look like '<count>/<period>'")]
    MissingSeparator(String),

    /// Count is not a positive integer.
    #[error("Invalid quota count in '{0}'")]
    InvalidCount(String),

    /// Period is not `[<n>]second|minute|hour|day`, or exceeds [`MAX_WINDOW`].
    #[error("Invalid quota period in '{0}'")]
    InvalidPeriod(String),

    /// Tier entry is not `<plan>=<quota>`.
    #[error("Invalid tier entry '{0}', expected '<plan>=<count>/<period>'")]
    InvalidTier(String),
}

/// A request budget: at most `count` requests per fixed `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitQuota {
    /// Requests allowed per window
    pub count: u64,
    /// Window length
    pub window: Duration,
}

impl RateLimitQuota {
    /// `count` requests per `window`.
    #[must_use]
    pub const fn new(count: u64, window: Duration) -> Self {
        Self { count, window }
    }

    /// `count` requests per minute.
    #[must_use]
    pub const fn per_minute(count: u64) -> Self {
        Self::new(count, Duration::from_secs(60))
    }

    /// `count` requests per hour.
    #[must_use]
    pub const fn per_hour(count: u64) -> Self {
        Self::new(count, Duration::from_secs(3600))
    }
}

impl FromStr for RateLimitQuota {
    type Err = QuotaParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (count, period) = trimmed
            .split_once('/')
            .ok_or_else(|| QuotaParseError::MissingSeparator(trimmed.to_string()))?;

        let count: u64 = count
            .trim()
            .parse()
            .ok()
            .filter(|n| *n > 0)
            .ok_or_else(|| QuotaParseError::InvalidCount(trimmed.to_string()))?;

        let period = period.trim();
        let digits = period.bytes().take_while(u8::is_ascii_digit).count();
        let (multiplier, unit) = period.split_at(digits);
        let multiplier: u64 = if multiplier.is_empty() {
            1
        } else {
            multiplier
                .parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| QuotaParseError::InvalidPeriod(trimmed.to_string()))?
        };

        let unit_secs = match unit.trim().trim_end_matches('s') {
            "second" | "sec" => 1,
            "minute" | "min" => 60,
            "hour" => 3600,
            "day" => 86_400,
            _ => return Err(QuotaParseError::InvalidPeriod(trimmed.to_string())),
        };

        let window = multiplier
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .filter(|window| *window <= MAX_WINDOW)
            .ok_or_else(|| QuotaParseError::InvalidPeriod(trimmed.to_string()))?;

        Ok(Self::new(count, window))
    }
}

impl fmt::Display for RateLimitQuota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.window.as_secs();
        let (n, unit) = [(86_400, "day"), (3600, "hour"), (60, "minute")]
            .into_iter()
            .find(|(size, _)| secs >= *size && secs % size == 0)
            .map_or((secs, "second"), |(size, unit)| (secs / size, unit));

        if n == 1 {
            write!(f, "{}/{unit}", self.count)
        } else {
            write!(f, "{}/{n}{unit}", self.count)
        }
    }
}

/// Pricing plan announced by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingPlan {
    /// Default plan, also used for unknown plan names
    Free,
    /// Entry paid plan
    Basic,
    /// Professional plan
    Pro,
    /// Studio plan
    Studio,
    /// Enterprise plan
    Enterprise,
}

impl PricingPlan {
    /// All plans, cheapest first.
    pub const ALL: [Self; 5] = [
        Self::Free,
        Self::Basic,
        Self::Pro,
        Self::Studio,
        Self::Enterprise,
    ];

    /// Lowercase plan name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Basic => "basic",
            Self::Pro => "pro",
            Self::Studio => "studio",
            Self::Enterprise => "enterprise",
        }
    }

    /// Parse a plan name, case-insensitively. Unknown names are `None`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL
            .into_iter()
            .find(|plan| plan.as_str().eq_ignore_ascii_case(name))
    }

    /// Parse a plan name, falling back to [`PricingPlan::Free`].
    #[must_use]
    pub fn parse_or_free(name: Option<&str>) -> Self {
        name.and_then(Self::parse).unwrap_or(Self::Free)
    }
}

impl fmt::Display for PricingPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-plan quotas for authenticated callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: HashMap<PricingPlan, RateLimitQuota>,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            tiers: HashMap::from([
                (PricingPlan::Free, RateLimitQuota::per_minute(20)),
                (PricingPlan::Basic, RateLimitQuota::per_minute(50)),
                (PricingPlan::Pro, RateLimitQuota::per_minute(50)),
                (PricingPlan::Studio, RateLimitQuota::per_minute(200)),
                (PricingPlan::Enterprise, RateLimitQuota::per_minute(1000)),
            ]),
        }
    }
}

impl TierTable {
    /// Quota for `plan`, or the free quota when the plan has no entry.
    #[must_use]
    pub fn quota(&self, plan: PricingPlan) -> RateLimitQuota {
        self.tiers
            .get(&plan)
            .or_else(|| self.tiers.get(&PricingPlan::Free))
            .copied()
            .unwrap_or(RateLimitQuota::per_minute(20))
    }

    /// Override the quota for one plan.
    #[must_use]
    pub fn with(mut self, plan: PricingPlan, quota: RateLimitQuota) -> Self {
        self.tiers.insert(plan, quota);
        self
    }
}

impl FromStr for TierTable {
    type Err = QuotaParseError;

    /// Parse `plan=quota` pairs separated by commas, applied over the
    /// defaults: `free=20/minute,studio=300/minute`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .map(str::trim)
            .filter(|entry| !entry.is_empty())
            .try_fold(Self::default(), |table, entry| {
                let (plan, quota) = entry
                    .split_once('=')
                    .ok_or_else(|| QuotaParseError::InvalidTier(entry.to_string()))?;
                let plan = PricingPlan::parse(plan)
                    .ok_or_else(|| QuotaParseError::InvalidTier(entry.to_string()))?;
                Ok(table.with(plan, quota.parse()?))
            })
    }
}

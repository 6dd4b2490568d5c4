//! Demonstration endpoints for the rate limit layers.
//!
//! Each route shows one way of declaring quotas: a fixed quota, the caller's
//! plan quota, the strict quota, two stacked quotas, and no quota at all.

use analytics_runtime::rate_limit::PricingPlan;
use analytics_web::{AppState, Authenticated};
use axum::{Json, extract::State};
use serde_json::{Value, json};

/// `GET /basic`: 10 requests per minute for every caller.
#[allow(clippy::unused_async)]
pub async fn basic() -> Json<Value> {
    Json(json!({
        "message": "This endpoint has a fixed rate limit of 10 requests per minute",
        "endpoint": "/rate-limit-examples/basic"
    }))
}

/// `GET /dynamic`: quota follows the caller's pricing plan.
#[allow(clippy::unused_async)]
pub async fn dynamic(Authenticated(identity): Authenticated) -> Json<Value> {
    let plan = identity.plan();
    Json(json!({
        "message": format!("Rate limit adjusts based on your plan: {plan}"),
        "userId": identity.user_id,
        "plan": plan,
        "endpoint": "/rate-limit-examples/dynamic"
    }))
}

/// `GET /strict`: the strict quota, for expensive operations.
#[allow(clippy::unused_async)]
pub async fn strict(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> Json<Value> {
    let strict = state.limiter.config().strict;
    Json(json!({
        "message": format!("This endpoint has strict rate limiting ({strict})"),
        "userId": identity.user_id,
        "endpoint": "/rate-limit-examples/strict",
        "useCase": "Expensive operations like exports or heavy computations"
    }))
}

/// `GET /multiple`: a burst quota and a sustained quota, both enforced.
#[allow(clippy::unused_async)]
pub async fn multiple(Authenticated(identity): Authenticated) -> Json<Value> {
    Json(json!({
        "message": "This endpoint has multiple rate limits",
        "limits": {
            "shortTerm": "20 requests/minute",
            "longTerm": "100 requests/hour"
        },
        "userId": identity.user_id,
        "endpoint": "/rate-limit-examples/multiple"
    }))
}

/// `GET /no-limit`: exempt from rate limiting.
#[allow(clippy::unused_async)]
pub async fn no_limit() -> Json<Value> {
    Json(json!({
        "message": "This endpoint is exempt from rate limiting",
        "endpoint": "/rate-limit-examples/no-limit",
        "warning": "Use exemptions sparingly!"
    }))
}

/// `GET /info`: the caller's quota and the configured tier table.
#[allow(clippy::unused_async)]
pub async fn info(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
) -> Json<Value> {
    let config = state.limiter.config();
    let plan = identity.plan();

    let all_plans: serde_json::Map<String, Value> = PricingPlan::ALL
        .into_iter()
        .map(|p| (p.as_str().to_string(), json!(config.tiers.quota(p).to_string())))
        .collect();

    Json(json!({
        "userId": identity.user_id,
        "currentPlan": plan,
        "currentLimit": config.tiers.quota(plan).to_string(),
        "allPlans": all_plans,
        "specialLimits": {
            "strict": config.strict.to_string(),
            "unauthenticated": config.unauthenticated.to_string()
        },
        "store": state.limiter.store_mode().as_str(),
        "upgradeInfo": "Upgrade your plan for higher rate limits"
    }))
}

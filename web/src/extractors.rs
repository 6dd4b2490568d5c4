//! Custom Axum extractors.
//!
//! - `CorrelationId`: Extract or generate request correlation IDs
//! - `ClientIp`: Client address from proxy headers or the connection
//! - `GatewayIdentity`: Caller identity forwarded by the API gateway, if any
//! - `Authenticated`: Same, but rejects with 401 when absent
//!
//! The gateway validates tokens upstream and forwards the result in headers.
//! This service trusts those headers and never sees a token.
//!
//! # Proxy trust
//!
//! `X-Forwarded-For` and `X-Real-IP` are trusted unconditionally and take
//! priority over the socket address, so the service must only be reachable
//! through the gateway. Exposed directly, any caller can pick the address
//! its rate-limit bucket is keyed on.
//!
//! # Examples
//!
//! ```ignore
//! use analytics_web::extractors::{Authenticated, ClientIp};
//!
//! async fn handler(Authenticated(identity): Authenticated, client_ip: ClientIp) -> String {
//!     format!("{} from {}", identity.user_id, client_ip.0)
//! }
//! ```

use crate::error::AppError;
use analytics_runtime::rate_limit::CallerIdentity;
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts},
    http::{Extensions, HeaderMap, request::Parts},
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use uuid::Uuid;

/// Set to `"true"` by the gateway after it validated the caller.
pub const GATEWAY_AUTHENTICATED_HEADER: &str = "x-gateway-authenticated";
/// Authenticated user id.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Roles as a JSON array, or a comma-separated list.
pub const USER_ROLES_HEADER: &str = "x-user-roles";
/// Pricing plan name.
pub const USER_PRICING_PLAN_HEADER: &str = "x-user-pricing-plan";

/// Correlation ID for request tracing.
///
/// Uses the ID stored by [`correlation_id_layer`](crate::middleware::correlation_id_layer)
/// when present, then the `X-Correlation-ID` header, else a new UUID v4.
#[derive(Debug, Clone, Copy)]
pub struct CorrelationId(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for CorrelationId
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        if let Some(id) = parts.extensions.get::<Uuid>() {
            return Ok(Self(*id));
        }

        let correlation_id = parts
            .headers
            .get(crate::middleware::CORRELATION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);

        Ok(Self(correlation_id))
    }
}

/// Client IP address.
///
/// # Priority
///
/// 1. `X-Forwarded-For` (first IP in the list)
/// 2. `X-Real-IP`
/// 3. Connection address (when served with connect info)
/// 4. `127.0.0.1`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientIp(pub IpAddr);

#[async_trait]
impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(client_ip(&parts.headers, &parts.extensions)))
    }
}

/// Resolve the client address from proxy headers or connection info.
///
/// Order: first `X-Forwarded-For` entry, then `X-Real-IP`, then the socket
/// address, then loopback. Proxy headers win even when a socket address is
/// known; see the module docs on proxy trust.
#[must_use]
pub fn client_ip(headers: &HeaderMap, extensions: &Extensions) -> IpAddr {
    let forwarded = headers
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    if let Some(ip) = forwarded {
        return ip;
    }

    let real_ip = headers
        .get("X-Real-IP")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());
    if let Some(ip) = real_ip {
        return ip;
    }

    extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map_or(IpAddr::V4(Ipv4Addr::LOCALHOST), |info| info.0.ip())
}

/// Read the gateway identity headers.
///
/// Returns `None` unless `x-gateway-authenticated` is exactly `"true"` and a
/// non-empty `x-user-id` is present.
#[must_use]
pub fn caller_identity(headers: &HeaderMap) -> Option<CallerIdentity> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    if header(GATEWAY_AUTHENTICATED_HEADER) != Some("true") {
        return None;
    }
    let user_id = header(USER_ID_HEADER).map(str::trim).filter(|id| !id.is_empty())?;

    Some(CallerIdentity {
        user_id: user_id.to_string(),
        roles: header(USER_ROLES_HEADER).map(parse_roles).unwrap_or_default(),
        pricing_plan: header(USER_PRICING_PLAN_HEADER)
            .map(str::trim)
            .filter(|plan| !plan.is_empty())
            .map(str::to_string),
    })
}

/// Roles from a JSON array, a JSON string, or a comma-separated list.
fn parse_roles(raw: &str) -> Vec<String> {
    match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(serde_json::Value::Array(values)) => values
            .into_iter()
            .filter_map(|v| match v {
                serde_json::Value::String(s) => Some(s),
                serde_json::Value::Null => None,
                other => Some(other.to_string()),
            })
            .collect(),
        Ok(serde_json::Value::String(role)) => vec![role],
        _ => raw
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string)
            .collect(),
    }
}

/// Caller identity if the gateway vouched for the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayIdentity(pub Option<CallerIdentity>);

#[async_trait]
impl<S> FromRequestParts<S> for GatewayIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Self(caller_identity(&parts.headers)))
    }
}

/// Caller identity, required.
///
/// Rejects with 401 when the gateway headers are missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authenticated(pub CallerIdentity);

#[async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        caller_identity(&parts.headers).map(Self).ok_or_else(|| {
            tracing::warn!(path = %parts.uri.path(), "Unauthenticated request, gateway headers missing");
            AppError::unauthorized("Authentication required. Request must come through API Gateway.")
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::http::{Request, StatusCode};

    fn parts(headers: &[(&str, &str)]) -> Parts {
        let mut builder = Request::builder();
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn test_correlation_id_from_header() {
        let uuid = Uuid::new_v4();
        let mut parts = parts(&[("X-Correlation-ID", uuid.to_string().as_str())]);
        let correlation_id = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(correlation_id.0, uuid);
    }

    #[tokio::test]
    async fn test_correlation_id_prefers_extension() {
        let stored = Uuid::new_v4();
        let mut parts = parts(&[("X-Correlation-ID", Uuid::new_v4().to_string().as_str())]);
        parts.extensions.insert(stored);
        let correlation_id = CorrelationId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(correlation_id.0, stored);
    }

    #[tokio::test]
    async fn test_client_ip_from_x_forwarded_for() {
        let mut parts = parts(&[("X-Forwarded-For", "203.0.113.1, 198.51.100.1")]);
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "203.0.113.1");
    }

    #[tokio::test]
    async fn test_client_ip_from_x_real_ip() {
        let mut parts = parts(&[("X-Real-IP", "198.51.100.42")]);
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "198.51.100.42");
    }

    #[tokio::test]
    async fn test_client_ip_from_connect_info() {
        let mut parts = parts(&[("X-Forwarded-For", "garbage")]);
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 51000))));
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "192.0.2.9");
    }

    #[tokio::test]
    async fn test_proxy_headers_override_socket_address() {
        let mut parts = parts(&[
            ("X-Forwarded-For", "203.0.113.7"),
            ("X-Real-IP", "198.51.100.42"),
        ]);
        parts
            .extensions
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 9], 51000))));
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "203.0.113.7");

        parts.headers.remove("X-Forwarded-For");
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "198.51.100.42");
    }

    #[tokio::test]
    async fn test_client_ip_fallback() {
        let mut parts = parts(&[]);
        let client_ip = ClientIp::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(client_ip.0.to_string(), "127.0.0.1");
    }

    #[test]
    fn test_identity_requires_gateway_flag_and_user_id() {
        let headers = parts(&[("x-user-id", "u1")]).headers;
        assert!(caller_identity(&headers).is_none());

        let headers = parts(&[("x-gateway-authenticated", "TRUE"), ("x-user-id", "u1")]).headers;
        assert!(caller_identity(&headers).is_none());

        let headers = parts(&[("x-gateway-authenticated", "true"), ("x-user-id", " ")]).headers;
        assert!(caller_identity(&headers).is_none());
    }

    #[test]
    fn test_identity_reads_roles_and_plan() {
        let headers = parts(&[
            ("x-gateway-authenticated", "true"),
            ("x-user-id", "u1"),
            ("x-user-roles", r#"["admin","artist"]"#),
            ("x-user-pricing-plan", "studio"),
        ])
        .headers;

        let identity = caller_identity(&headers).unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.roles, vec!["admin".to_string(), "artist".to_string()]);
        assert_eq!(identity.pricing_plan.as_deref(), Some("studio"));
    }

    #[test]
    fn test_roles_fallback_formats() {
        assert_eq!(parse_roles("admin, artist ,"), vec!["admin", "artist"]);
        assert_eq!(parse_roles(r#""admin""#), vec!["admin"]);
        assert_eq!(parse_roles("[1, null]"), vec!["1"]);
        assert!(parse_roles("").is_empty());
    }

    #[tokio::test]
    async fn test_authenticated_rejects_without_identity() {
        let mut parts = parts(&[]);
        let err = Authenticated::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);

        let mut parts = parts_with_identity();
        let Authenticated(identity) = Authenticated::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(identity.user_id, "u9");
        assert!(identity.pricing_plan.is_none());
    }

    fn parts_with_identity() -> Parts {
        parts(&[("x-gateway-authenticated", "true"), ("x-user-id", "u9")])
    }
}

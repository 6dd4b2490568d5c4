//! Error types for web handlers and resilience rejections.
//!
//! [`AppError`] bridges handler failures to HTTP responses. The two
//! rejections, [`CircuitOpenRejection`] and [`RateLimitRejection`], are not
//! errors from the service's point of view: they are the normal answer when a
//! request is shed, and carry the body and `Retry-After` header clients
//! expect.

use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::fmt;

/// Application error type for web handlers.
///
/// # Examples
///
/// ```ignore
/// async fn handler(identity: Authenticated) -> Result<Json<Data>, AppError> {
///     let data = load(&identity.0.user_id)
///         .await
///         .map_err(|e| AppError::internal("Failed to load data").with_source(e.into()))?;
///     Ok(Json(data))
/// }
/// ```
#[derive(Debug)]
pub struct AppError {
    /// HTTP status code
    status: StatusCode,
    /// Error message (user-facing)
    message: String,
    /// Error code (for client error handling)
    code: &'static str,
    /// Internal error (for logging, not exposed to client)
    source: Option<anyhow::Error>,
}

impl AppError {
    /// Create a new application error.
    #[must_use]
    pub const fn new(status: StatusCode, message: String, code: &'static str) -> Self {
        Self {
            status,
            message,
            code,
            source: None,
        }
    }

    /// Attach the underlying error (logged, never sent to the client).
    #[must_use]
    pub fn with_source(mut self, source: anyhow::Error) -> Self {
        self.source = Some(source);
        self
    }

    /// HTTP status of this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.status
    }

    /// Create a 400 Bad Request error.
    #[must_use]
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message.into(), "BAD_REQUEST")
    }

    /// Create a 401 Unauthorized error.
    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message.into(), "UNAUTHORIZED")
    }

    /// Create a 500 Internal Server Error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            message.into(),
            "INTERNAL_SERVER_ERROR",
        )
    }

    /// Create a 503 Service Unavailable error.
    #[must_use]
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            message.into(),
            "SERVICE_UNAVAILABLE",
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn std::error::Error + 'static))
    }
}

/// Error response body (JSON).
#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            match &self.source {
                Some(source) => tracing::error!(
                    status = %self.status,
                    code = self.code,
                    message = %self.message,
                    error = %source,
                    "Internal server error"
                ),
                None => tracing::error!(
                    status = %self.status,
                    code = self.code,
                    message = %self.message,
                    "Internal server error"
                ),
            }
        }

        let mut response = (
            self.status,
            Json(ErrorResponse {
                code: self.code,
                message: self.message,
            }),
        )
            .into_response();

        if self.status == StatusCode::UNAUTHORIZED {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }

        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::internal("An internal error occurred").with_source(err)
    }
}

/// 503 returned while the circuit breaker is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitOpenRejection {
    /// Seconds until the breaker probes again
    pub retry_after_secs: u64,
}

#[derive(Serialize)]
struct CircuitOpenBody {
    error: &'static str,
    message: &'static str,
    retry_after: u64,
}

impl IntoResponse for CircuitOpenRejection {
    fn into_response(self) -> Response {
        let body = CircuitOpenBody {
            error: "Service temporarily unavailable",
            message: "Circuit breaker is open. Service is experiencing issues.",
            retry_after: self.retry_after_secs,
        };
        let mut response = (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response();
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        response
    }
}

/// 429 returned when a caller exceeds a quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRejection {
    /// Caller's plan name, or `"unauthenticated"`
    pub plan: &'static str,
    /// Quota count that was exceeded
    pub limit: u64,
    /// Seconds until the window resets
    pub retry_after_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RateLimitBody {
    error: &'static str,
    message: String,
    current_plan: &'static str,
    upgrade_info: &'static str,
    retry_after: u64,
}

impl IntoResponse for RateLimitRejection {
    fn into_response(self) -> Response {
        let body = RateLimitBody {
            error: "Too many requests",
            message: format!("Rate limit exceeded for {} plan", self.plan),
            current_plan: self.plan,
            upgrade_info: "Upgrade your plan for higher limits",
            retry_after: self.retry_after_secs,
        };
        let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
        let headers = response.headers_mut();
        headers.insert(header::RETRY_AFTER, HeaderValue::from(self.retry_after_secs));
        headers.insert(RATE_LIMIT_LIMIT_HEADER, HeaderValue::from(self.limit));
        headers.insert(RATE_LIMIT_REMAINING_HEADER, HeaderValue::from(0_u64));
        headers.insert(RATE_LIMIT_RESET_HEADER, HeaderValue::from(self.retry_after_secs));
        response
    }
}

/// Quota count of the tightest quota on the endpoint.
pub const RATE_LIMIT_LIMIT_HEADER: &str = "x-ratelimit-limit";
/// Requests left in the current window.
pub const RATE_LIMIT_REMAINING_HEADER: &str = "x-ratelimit-remaining";
/// Seconds until the current window ends.
pub const RATE_LIMIT_RESET_HEADER: &str = "x-ratelimit-reset";

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_error_display() {
        let err = AppError::bad_request("Invalid input");
        assert_eq!(err.to_string(), "[BAD_REQUEST] Invalid input");
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_anyhow_becomes_internal() {
        let err: AppError = anyhow::anyhow!("redis went away").into();
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(err.to_string(), "[INTERNAL_SERVER_ERROR] An internal error occurred");
    }

    #[tokio::test]
    async fn test_unauthorized_carries_www_authenticate() {
        let response = AppError::unauthorized("Not authenticated").into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");

        let body = body_json(response).await;
        assert_eq!(body["code"], "UNAUTHORIZED");
        assert_eq!(body["message"], "Not authenticated");
    }

    #[tokio::test]
    async fn test_circuit_open_body_and_header() {
        let response = CircuitOpenRejection { retry_after_secs: 42 }.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "42");

        let body = body_json(response).await;
        assert_eq!(body["error"], "Service temporarily unavailable");
        assert_eq!(
            body["message"],
            "Circuit breaker is open. Service is experiencing issues."
        );
        assert_eq!(body["retry_after"], 42);
    }

    #[tokio::test]
    async fn test_rate_limit_body_and_headers() {
        let response = RateLimitRejection {
            plan: "free",
            limit: 20,
            retry_after_secs: 15,
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "15");
        assert_eq!(response.headers()[RATE_LIMIT_LIMIT_HEADER], "20");
        assert_eq!(response.headers()[RATE_LIMIT_REMAINING_HEADER], "0");

        let body = body_json(response).await;
        assert_eq!(body["error"], "Too many requests");
        assert_eq!(body["message"], "Rate limit exceeded for free plan");
        assert_eq!(body["currentPlan"], "free");
        assert_eq!(body["upgradeInfo"], "Upgrade your plan for higher limits");
        assert_eq!(body["retryAfter"], 15);
    }
}

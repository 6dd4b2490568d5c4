//! Outbound call that starts a beat metrics calculation.
//!
//! The calculation endpoint sits behind the API gateway's trust boundary, so
//! the request carries the gateway identity headers itself: an admin on the
//! enterprise plan acting for the uploading user (or `system`).

use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Why one outbound attempt failed. Every variant is retryable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The request never produced a response.
    #[error("Beat metrics request failed: {0}")]
    Transport(String),

    /// The endpoint answered with a non-2xx status.
    #[error("Beat metrics endpoint returned {status}: {body}")]
    Status {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The HTTP client could not be built.
    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Form body of a calculation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatMetricsRequest {
    /// Beat to analyse
    pub beat_id: String,
    /// Where its audio lives
    pub audio_url: String,
    /// Uploading user; sent as a header, not in the form
    #[serde(skip)]
    pub user_id: Option<String>,
}

/// Starts a beat metrics calculation.
#[async_trait]
pub trait BeatMetricsTrigger: Send + Sync {
    /// Make one attempt.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError`] on a transport failure or a non-2xx answer.
    async fn trigger(&self, request: &BeatMetricsRequest) -> Result<(), DispatchError>;
}

/// [`BeatMetricsTrigger`] posting a form to the calculation endpoint.
#[derive(Debug, Clone)]
pub struct HttpBeatMetricsTrigger {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpBeatMetricsTrigger {
    /// Trigger against `endpoint` with a per-request `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Client`] if the TLS backend cannot be
    /// initialised.
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DispatchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Client(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    /// Target URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl BeatMetricsTrigger for HttpBeatMetricsTrigger {
    async fn trigger(&self, request: &BeatMetricsRequest) -> Result<(), DispatchError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("x-gateway-authenticated", "true")
            .header("x-user-id", request.user_id.as_deref().unwrap_or("system"))
            .header("x-user-roles", r#"["admin"]"#)
            .header("x-user-pricing-plan", "enterprise")
            .form(request)
            .send()
            .await
            .map_err(|e| DispatchError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(beat_id = %request.beat_id, status = status.as_u16(), "Beat metrics calculation accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(DispatchError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use axum::{
        Form, Router,
        extract::State,
        http::{HeaderMap, StatusCode},
        routing::post,
    };
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    type Captured = Arc<Mutex<Vec<(HeaderMap, HashMap<String, String>)>>>;

    /// Local endpoint that records requests and answers with `status`.
    async fn serve(status: StatusCode) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let app = Router::new()
            .route(
                "/calculate",
                post(
                    move |State(captured): State<Captured>,
                          headers: HeaderMap,
                          Form(form): Form<HashMap<String, String>>| async move {
                        captured.lock().unwrap().push((headers, form));
                        (status, "done")
                    },
                ),
            )
            .with_state(Arc::clone(&captured));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{addr}/calculate"), captured)
    }

    fn request(user_id: Option<&str>) -> BeatMetricsRequest {
        BeatMetricsRequest {
            beat_id: "b1".to_string(),
            audio_url: "https://cdn.example.com/b1.wav".to_string(),
            user_id: user_id.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_posts_form_with_gateway_headers() {
        let (endpoint, captured) = serve(StatusCode::CREATED).await;
        let trigger = HttpBeatMetricsTrigger::new(endpoint, Duration::from_secs(5)).unwrap();

        trigger.trigger(&request(Some("u42"))).await.unwrap();

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1);
        let (headers, form) = &captured[0];
        assert_eq!(headers["x-gateway-authenticated"], "true");
        assert_eq!(headers["x-user-id"], "u42");
        assert_eq!(headers["x-user-roles"], r#"["admin"]"#);
        assert_eq!(headers["x-user-pricing-plan"], "enterprise");
        assert_eq!(form["beatId"], "b1");
        assert_eq!(form["audioUrl"], "https://cdn.example.com/b1.wav");
        assert!(!form.contains_key("userId"));
    }

    #[tokio::test]
    async fn test_missing_user_acts_as_system() {
        let (endpoint, captured) = serve(StatusCode::OK).await;
        let trigger = HttpBeatMetricsTrigger::new(endpoint, Duration::from_secs(5)).unwrap();

        trigger.trigger(&request(None)).await.unwrap();

        assert_eq!(captured.lock().unwrap()[0].0["x-user-id"], "system");
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let (endpoint, _captured) = serve(StatusCode::BAD_GATEWAY).await;
        let trigger = HttpBeatMetricsTrigger::new(endpoint, Duration::from_secs(5)).unwrap();

        let err = trigger.trigger(&request(None)).await.unwrap_err();
        assert_eq!(
            err,
            DispatchError::Status {
                status: 502,
                body: "done".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transport_error() {
        let trigger =
            HttpBeatMetricsTrigger::new("http://127.0.0.1:1/calculate", Duration::from_secs(2)).unwrap();

        let err = trigger.trigger(&request(None)).await.unwrap_err();
        assert!(matches!(err, DispatchError::Transport(_)));
    }
}

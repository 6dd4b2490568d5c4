//! Prometheus scrape endpoint.

use crate::state::AppState;
use axum::{
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};

/// Render the Prometheus exposition.
///
/// # Endpoint
///
/// ```text
/// GET /metrics
/// ```
///
/// Returns 503 when this process did not install the recorder.
#[allow(clippy::unused_async)]
pub async fn metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

//! `BEAT_CREATED` dispatcher.
//!
//! Validates the payload, then asks the beat metrics endpoint to analyse the
//! uploaded audio. Delivery is at-least-once: a redelivered event triggers a
//! second calculation, which the endpoint treats as a recalculation.

use super::trigger::{BeatMetricsRequest, BeatMetricsTrigger};
use analytics_core::environment::{Sleeper, TokioSleeper};
use analytics_core::event::BeatCreated;
use analytics_runtime::handlers::HandlerError;
use analytics_runtime::retry::{RetryPolicy, retry_with_delay};
use std::sync::Arc;

/// Turns `BEAT_CREATED` events into beat metrics calculations.
#[derive(Clone)]
pub struct BeatCreatedDispatcher {
    trigger: Arc<dyn BeatMetricsTrigger>,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for BeatCreatedDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BeatCreatedDispatcher")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl BeatCreatedDispatcher {
    /// Dispatch through `trigger`, retrying per `policy`.
    #[must_use]
    pub fn new(trigger: Arc<dyn BeatMetricsTrigger>, policy: RetryPolicy) -> Self {
        Self::with_sleeper(trigger, policy, Arc::new(TokioSleeper))
    }

    /// Same as [`new`](Self::new) with an injected sleeper.
    #[must_use]
    pub fn with_sleeper(
        trigger: Arc<dyn BeatMetricsTrigger>,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            trigger,
            policy,
            sleeper,
        }
    }

    /// Validate and dispatch one event.
    ///
    /// # Errors
    ///
    /// - [`HandlerError::Validation`] naming every missing field; no call is
    ///   made.
    /// - [`HandlerError::Processing`] with the last attempt's error once the
    ///   retry policy is exhausted.
    pub async fn dispatch(&self, event: &BeatCreated) -> Result<(), HandlerError> {
        let request = validate(event)?;

        tracing::info!(beat_id = %request.beat_id, "Processing BEAT_CREATED event");

        retry_with_delay(&self.policy, self.sleeper.as_ref(), || {
            self.trigger.trigger(&request)
        })
        .await
        .map_err(|e| {
            tracing::error!(beat_id = %request.beat_id, error = %e, "Beat metrics dispatch failed");
            HandlerError::Processing(e.to_string())
        })?;

        tracing::info!(beat_id = %request.beat_id, "Beat metrics calculation triggered");
        Ok(())
    }
}

fn validate(event: &BeatCreated) -> Result<BeatMetricsRequest, HandlerError> {
    let beat_id = event.beat_id.as_deref().filter(|s| !s.is_empty());
    let audio_url = event.audio_url.as_deref().filter(|s| !s.is_empty());

    match (beat_id, audio_url) {
        (Some(beat_id), Some(audio_url)) => Ok(BeatMetricsRequest {
            beat_id: beat_id.to_string(),
            audio_url: audio_url.to_string(),
            user_id: event.user_id.clone(),
        }),
        _ => {
            let missing: Vec<&str> = [("beatId", beat_id), ("audioUrl", audio_url)]
                .into_iter()
                .filter(|(_, value)| value.is_none())
                .map(|(field, _)| field)
                .collect();
            Err(HandlerError::Validation(format!(
                "Invalid BEAT_CREATED payload: missing {}",
                missing.join(", ")
            )))
        }
    }
}

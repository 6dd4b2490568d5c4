//! Routes decoded events to their processors.

use super::dispatcher::BeatCreatedDispatcher;
use analytics_core::event::{AnalyticsEvent, EventEnvelope};
use analytics_runtime::handlers::{EventHandler, HandlerError};
use async_trait::async_trait;

/// [`EventHandler`] for the analytics input topic.
///
/// `BEAT_CREATED` goes to the [`BeatCreatedDispatcher`]; every other type is
/// logged and acknowledged.
#[derive(Debug, Clone)]
pub struct AnalyticsEventHandler {
    beat_created: BeatCreatedDispatcher,
}

impl AnalyticsEventHandler {
    /// Create a handler dispatching beat events through `beat_created`.
    #[must_use]
    pub const fn new(beat_created: BeatCreatedDispatcher) -> Self {
        Self { beat_created }
    }
}

#[async_trait]
impl EventHandler for AnalyticsEventHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
        match AnalyticsEvent::from_envelope(envelope) {
            AnalyticsEvent::BeatCreated(beat) => self.beat_created.dispatch(&beat).await,
            AnalyticsEvent::Unknown { event_type } => {
                tracing::info!(event_type = %event_type, "No handler for event type, skipping");
                Ok(())
            }
        }
    }
}

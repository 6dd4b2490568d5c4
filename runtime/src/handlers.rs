//! Event handler trait.
//!
//! The [`EventConsumer`](crate::consumer::EventConsumer) decodes each message
//! into an [`EventEnvelope`] and hands it to an [`EventHandler`]. A handler
//! error is not retried by the consumer: the message is dead-lettered and the
//! read loop moves on. Handlers that want retries (the dispatcher's outbound
//! call) do them internally.
//!
//! # Example
//!
//! ```rust
//! use analytics_core::event::EventEnvelope;
//! use analytics_runtime::handlers::{EventHandler, HandlerError};
//! use async_trait::async_trait;
//!
//! struct RequireBeatId;
//!
//! #[async_trait]
//! impl EventHandler for RequireBeatId {
//!     async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError> {
//!         envelope
//!             .payload_str("beatId")
//!             .map(|_| ())
//!             .ok_or_else(|| HandlerError::Validation("missing beatId".into()))
//!     }
//! }
//! ```

use analytics_core::event::EventEnvelope;
use async_trait::async_trait;
use thiserror::Error;

/// Why a handler could not process an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The event is malformed; retrying cannot help.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Processing failed after the handler's own retries.
    #[error("Processing failed: {0}")]
    Processing(String),
}

/// Processes decoded events for the consumer.
///
/// # Thread Safety
///
/// Handlers are shared as `Arc<dyn EventHandler>` with the read loop task.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle one event.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError`] if the event cannot be processed. The consumer
    /// dead-letters the message with the error text as the reason.
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), HandlerError>;
}

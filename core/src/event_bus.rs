//! Event bus abstraction for the broker the consumer reads from.
//!
//! The [`EventBus`] trait covers the two things the service needs from the
//! broker: publishing raw bytes to a topic (dead letters, generic sends) and
//! subscribing to the input topic as a stream of [`InboundEvent`]s.
//!
//! Connections are created through a [`BrokerConnector`], which is what the
//! consumer's connect loop retries. A connector either hands back a live bus
//! or fails with [`EventBusError::ConnectionFailed`].
//!
//! # Implementations
//!
//! - `RedpandaConnector` / `RedpandaEventBus` in `analytics-redpanda` (production)
//! - `ScriptedConnector` / `InMemoryEventBus` in `analytics-testing` (tests)
//!
//! # Delivery
//!
//! Delivery is at-least-once. The consumer calls
//! [`EventBus::acknowledge`] only after a message was handled or
//! dead-lettered; anything received but not yet acknowledged when a session
//! ends is delivered again. Handlers must tolerate duplicates.

use crate::event::InboundEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventBusError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish a message to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// Network or transport error. Ends the read loop.
    #[error("Transport error: {0}")]
    TransportError(String),

    /// The broker did not accept an acknowledgement
    #[error("Commit failed: {0}")]
    CommitFailed(String),
}

/// Stream of raw messages from a subscription.
///
/// An `Err` item is a stream-level failure: the consumer treats it as the end
/// of the session and marks the connection disconnected.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<InboundEvent, EventBusError>> + Send>>;

/// Trait for event bus implementations.
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// to enable trait object usage (`Arc<dyn EventBus>`).
pub trait EventBus: Send + Sync {
    /// Publish raw bytes to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the broker rejects the
    /// message or does not acknowledge it in time.
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;

    /// Subscribe to one or more topics and receive a stream of messages.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>>;

    /// Mark `event` as handled so the group does not deliver it again.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::CommitFailed`] if the broker rejects the
    /// commit. The message may then be redelivered.
    fn acknowledge(
        &self,
        event: &InboundEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>>;
}

/// Opens broker sessions.
///
/// Each call to [`connect`](Self::connect) is one connection attempt. The
/// consumer decides how often to call it and how long to wait in between.
pub trait BrokerConnector: Send + Sync {
    /// Attempt to open a session with the broker.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the broker is unreachable.
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn EventBus>, EventBusError>> + Send + '_>>;
}

//! In-memory broker doubles.
//!
//! [`InMemoryEventBus`] stands in for a live broker session: tests push
//! inbound messages (or a transport failure) through an [`InboundSender`] and
//! inspect what was published and which offsets were acknowledged. [`ScriptedConnector`] hands that bus out after
//! a configurable number of failed connection attempts.

use analytics_core::event::InboundEvent;
use analytics_core::event_bus::{BrokerConnector, EventBus, EventBusError, MessageStream};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc;

type Inbound = Result<InboundEvent, EventBusError>;

/// Broker session held entirely in memory.
#[derive(Debug)]
pub struct InMemoryEventBus {
    sender: mpsc::UnboundedSender<Inbound>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Inbound>>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    acknowledged: Mutex<Vec<i64>>,
    fail_publish: AtomicBool,
    subscriptions: AtomicUsize,
    next_offset: Arc<AtomicI64>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryEventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            published: Mutex::new(Vec::new()),
            acknowledged: Mutex::new(Vec::new()),
            fail_publish: AtomicBool::new(false),
            subscriptions: AtomicUsize::new(0),
            next_offset: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Handle for feeding inbound messages to subscribers.
    #[must_use]
    pub fn sender(&self, topic: impl Into<String>) -> InboundSender {
        InboundSender {
            topic: topic.into(),
            sender: self.sender.clone(),
            next_offset: Arc::clone(&self.next_offset),
        }
    }

    /// Messages published to `topic`, in order.
    #[must_use]
    pub fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    /// Number of messages published to any topic.
    #[must_use]
    pub fn published_count(&self) -> usize {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Offsets acknowledged by the consumer, in order.
    #[must_use]
    pub fn acknowledged(&self) -> Vec<i64> {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Make every subsequent publish fail (or succeed again).
    pub fn set_publish_failure(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Number of times `subscribe` was called.
    #[must_use]
    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl EventBus for InMemoryEventBus {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = payload.to_vec();

        Box::pin(async move {
            if self.fail_publish.load(Ordering::SeqCst) {
                return Err(EventBusError::PublishFailed {
                    topic,
                    reason: "publish failure injected".to_string(),
                });
            }
            self.published
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((topic, payload));
            Ok(())
        })
    }

    fn subscribe(
        &self,
        _topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let receiver = Arc::clone(&self.receiver);

        Box::pin(async move {
            let stream = async_stream::stream! {
                loop {
                    let item = receiver.lock().await.recv().await;
                    match item {
                        Some(item) => yield item,
                        None => break,
                    }
                }
            };
            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn acknowledge(
        &self,
        event: &InboundEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        self.acknowledged
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.offset);
        Box::pin(async { Ok(()) })
    }
}

/// Feeds inbound messages into an [`InMemoryEventBus`].
#[derive(Debug, Clone)]
pub struct InboundSender {
    topic: String,
    sender: mpsc::UnboundedSender<Inbound>,
    next_offset: Arc<AtomicI64>,
}

impl InboundSender {
    /// Deliver a message body on partition 0 with the next offset.
    pub fn push(&self, payload: impl Into<Vec<u8>>) {
        let offset = self.next_offset.fetch_add(1, Ordering::SeqCst);
        let _ = self.sender.send(Ok(InboundEvent::new(
            self.topic.clone(),
            0,
            offset,
            payload.into(),
        )));
    }

    /// Deliver a stream-level transport failure.
    pub fn fail(&self, reason: impl Into<String>) {
        let _ = self
            .sender
            .send(Err(EventBusError::TransportError(reason.into())));
    }
}

/// Connector that fails a scripted number of times before succeeding.
#[derive(Debug)]
pub struct ScriptedConnector {
    bus: Arc<InMemoryEventBus>,
    failures_remaining: AtomicUsize,
    always_fail: bool,
    attempts: AtomicUsize,
}

impl ScriptedConnector {
    /// Fail the first `failures` attempts, then hand out `bus`.
    #[must_use]
    pub const fn failing_times(failures: usize, bus: Arc<InMemoryEventBus>) -> Self {
        Self {
            bus,
            failures_remaining: AtomicUsize::new(failures),
            always_fail: false,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Connect on the first attempt.
    #[must_use]
    pub const fn connected(bus: Arc<InMemoryEventBus>) -> Self {
        Self::failing_times(0, bus)
    }

    /// Never connect.
    #[must_use]
    pub fn unreachable() -> Self {
        Self {
            bus: Arc::new(InMemoryEventBus::new()),
            failures_remaining: AtomicUsize::new(0),
            always_fail: true,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Number of connection attempts made.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl BrokerConnector for ScriptedConnector {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn EventBus>, EventBusError>> + Send + '_>> {
        Box::pin(async move {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;

            if self.always_fail {
                return Err(EventBusError::ConnectionFailed(format!(
                    "broker unreachable (attempt {attempt})"
                )));
            }

            let should_fail = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if should_fail {
                return Err(EventBusError::ConnectionFailed(format!(
                    "broker unreachable (attempt {attempt})"
                )));
            }

            Ok(Arc::clone(&self.bus) as Arc<dyn EventBus>)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn pushed_messages_reach_subscriber_in_order() {
        let bus = InMemoryEventBus::new();
        let sender = bus.sender("beats-events");
        sender.push("first");
        sender.push("second");

        let mut stream = bus.subscribe(&["beats-events"]).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        let second = stream.next().await.unwrap().unwrap();

        assert_eq!(first.payload, b"first");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(bus.subscriptions(), 1);

        bus.acknowledge(&second).await.unwrap();
        assert_eq!(bus.acknowledged(), vec![1]);
    }

    #[tokio::test]
    async fn publish_records_and_can_fail() {
        let bus = InMemoryEventBus::new();
        bus.publish("analytics-dlq", b"x").await.unwrap();
        assert_eq!(bus.published("analytics-dlq"), vec![b"x".to_vec()]);

        bus.set_publish_failure(true);
        assert!(bus.publish("analytics-dlq", b"y").await.is_err());
        assert_eq!(bus.published_count(), 1);
    }

    #[tokio::test]
    async fn scripted_connector_fails_then_connects() {
        let connector = ScriptedConnector::failing_times(2, Arc::new(InMemoryEventBus::new()));

        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_err());
        assert!(connector.connect().await.is_ok());
        assert_eq!(connector.attempts(), 3);
    }
}

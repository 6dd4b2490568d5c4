//! Redpanda broker connector for the analytics event consumer.
//!
//! This crate implements the [`BrokerConnector`] and [`EventBus`] traits from
//! `analytics-core` on top of rdkafka, so it works with Redpanda or any other
//! Kafka-compatible broker.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐  connect()   ┌──────────────────┐
//! │ RedpandaConnector  │─────────────►│ RedpandaEventBus │
//! └────────────────────┘  + ping()    └────────┬─────────┘
//!                                              │
//!                              ┌───────────────┼────────────────┐
//!                              ▼                                ▼
//!                     publish (FutureProducer)        subscribe (StreamConsumer)
//!                     dead-letter records             input topic → InboundEvent
//! ```
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery**: auto-commit is off and an offset is committed
//! only when the consumer acknowledges the message, after its handler
//! returned or it was dead-lettered. Messages still buffered in the
//! subscription channel when a session ends were never committed and are
//! delivered again, so handlers must tolerate duplicates.
//!
//! # Errors on the stream
//!
//! Only fatal consumption errors are yielded as stream items; the event
//! consumer treats them as a lost session. Transient client errors are logged
//! and librdkafka keeps retrying underneath.
//!
//! # Example
//!
//! ```no_run
//! use analytics_core::event_bus::BrokerConnector;
//! use analytics_redpanda::RedpandaConnector;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = RedpandaConnector::builder()
//!     .brokers("localhost:9092")
//!     .consumer_group("analytics-service-group")
//!     .build();
//!
//! let bus = connector.connect().await?;
//! bus.publish("analytics-dlq", br#"{"originalEvent":"..."}"#).await?;
//! # Ok(())
//! # }
//! ```

use analytics_core::event::InboundEvent;
use analytics_core::event_bus::{BrokerConnector, EventBus, EventBusError, MessageStream};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Connection settings shared by the producer and the consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedpandaSettings {
    /// Comma-separated bootstrap servers
    pub brokers: String,
    /// Consumer group for subscriptions
    pub consumer_group: String,
    /// Client id reported to the broker
    pub client_id: String,
    /// Consumer session timeout
    pub session_timeout_ms: u32,
    /// Consumer heartbeat interval
    pub heartbeat_interval_ms: u32,
    /// Maximum time between polls before the group rebalances
    pub max_poll_interval_ms: u32,
    /// Producer send and metadata timeout
    pub timeout: Duration,
    /// Messages buffered between the Kafka consumer and the subscriber.
    /// Buffered messages are not committed yet and are redelivered when
    /// a session ends before they are acknowledged.
    pub buffer_size: usize,
    /// Where a new consumer group starts reading
    pub auto_offset_reset: String,
}

impl Default for RedpandaSettings {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "analytics-service-group".to_string(),
            client_id: "analytics-and-dashboards".to_string(),
            session_timeout_ms: 30_000,
            heartbeat_interval_ms: 10_000,
            max_poll_interval_ms: 300_000,
            timeout: Duration::from_secs(5),
            buffer_size: 100,
            auto_offset_reset: "earliest".to_string(),
        }
    }
}

/// Opens broker sessions for the event consumer.
///
/// Every [`connect`](BrokerConnector::connect) builds a fresh producer and
/// probes the cluster with a metadata request, so a dead broker fails the
/// attempt instead of surfacing later on the first publish.
#[derive(Debug, Clone)]
pub struct RedpandaConnector {
    settings: Arc<RedpandaSettings>,
}

impl RedpandaConnector {
    /// Create a connector with default settings for `brokers`.
    #[must_use]
    pub fn new(brokers: &str) -> Self {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the connector.
    #[must_use]
    pub fn builder() -> RedpandaConnectorBuilder {
        RedpandaConnectorBuilder::default()
    }

    /// The connector's settings.
    #[must_use]
    pub fn settings(&self) -> &RedpandaSettings {
        &self.settings
    }
}

impl BrokerConnector for RedpandaConnector {
    fn connect(
        &self,
    ) -> Pin<Box<dyn Future<Output = Result<Arc<dyn EventBus>, EventBusError>> + Send + '_>> {
        let settings = Arc::clone(&self.settings);

        Box::pin(async move {
            let bus = RedpandaEventBus::from_settings(settings)?;
            let brokers = bus.ping().await?;

            tracing::info!(
                brokers = %bus.settings.brokers,
                reachable_brokers = brokers,
                client_id = %bus.settings.client_id,
                "Connected to Redpanda"
            );

            Ok(Arc::new(bus) as Arc<dyn EventBus>)
        })
    }
}

/// Builder for configuring a [`RedpandaConnector`].
#[derive(Debug, Default)]
pub struct RedpandaConnectorBuilder {
    settings: RedpandaSettings,
}

impl RedpandaConnectorBuilder {
    /// Set the broker addresses (default: `localhost:9092`).
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.settings.brokers = brokers.into();
        self
    }

    /// Set the consumer group (default: `analytics-service-group`).
    #[must_use]
    pub fn consumer_group(mut self, group: impl Into<String>) -> Self {
        self.settings.consumer_group = group.into();
        self
    }

    /// Set the client id (default: `analytics-and-dashboards`).
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.settings.client_id = client_id.into();
        self
    }

    /// Set the consumer session timeout (default: 30000ms).
    #[must_use]
    pub const fn session_timeout_ms(mut self, ms: u32) -> Self {
        self.settings.session_timeout_ms = ms;
        self
    }

    /// Set the consumer heartbeat interval (default: 10000ms).
    #[must_use]
    pub const fn heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.settings.heartbeat_interval_ms = ms;
        self
    }

    /// Set the maximum poll interval (default: 300000ms).
    #[must_use]
    pub const fn max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.settings.max_poll_interval_ms = ms;
        self
    }

    /// Set the producer send and metadata timeout (default: 5s).
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    /// Set the subscriber buffer size (default: 1000, minimum 1).
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.settings.buffer_size = buffer_size.max(1);
        self
    }

    /// Set the offset reset policy for new consumer groups (default: `earliest`).
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.settings.auto_offset_reset = policy.into();
        self
    }

    /// Build the [`RedpandaConnector`].
    #[must_use]
    pub fn build(self) -> RedpandaConnector {
        RedpandaConnector {
            settings: Arc::new(self.settings),
        }
    }
}

/// A live broker session.
///
/// Publishes through one [`FutureProducer`]; every subscription gets its own
/// [`StreamConsumer`] in the configured consumer group. Acknowledgements
/// commit through the most recent subscription.
pub struct RedpandaEventBus {
    producer: FutureProducer,
    subscription: Mutex<Option<Arc<StreamConsumer>>>,
    settings: Arc<RedpandaSettings>,
}

impl std::fmt::Debug for RedpandaEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedpandaEventBus")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl RedpandaEventBus {
    /// Create a session for `settings` without probing the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created (invalid configuration).
    pub fn from_settings(settings: Arc<RedpandaSettings>) -> Result<Self, EventBusError> {
        let timeout_ms = settings.timeout.as_millis().to_string();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &settings.brokers)
            .set("client.id", &settings.client_id)
            .set("message.timeout.ms", &timeout_ms)
            .set("acks", "1")
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        Ok(Self {
            producer,
            subscription: Mutex::new(None),
            settings,
        })
    }

    /// The session's settings.
    #[must_use]
    pub fn settings(&self) -> &RedpandaSettings {
        &self.settings
    }

    /// Fetch cluster metadata to confirm the brokers answer.
    ///
    /// Returns the number of brokers in the cluster.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if no broker answers within
    /// the configured timeout.
    pub async fn ping(&self) -> Result<usize, EventBusError> {
        let producer = self.producer.clone();
        let timeout = self.settings.timeout;

        // fetch_metadata blocks the calling thread
        let result = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, Timeout::After(timeout))
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| EventBusError::ConnectionFailed(format!("Metadata task failed: {e}")))?;

        result.map_err(|e| {
            EventBusError::ConnectionFailed(format!(
                "Broker {} unreachable: {e}",
                self.settings.brokers
            ))
        })
    }

    fn consumer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.consumer_group)
            .set("client.id", &self.settings.client_id)
            .set(
                "session.timeout.ms",
                self.settings.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.settings.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.settings.max_poll_interval_ms.to_string(),
            )
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &self.settings.auto_offset_reset)
            .set("enable.partition.eof", "false");
        config
    }
}

/// Whether a consumer error means the session is gone.
const fn is_fatal(error: &KafkaError) -> bool {
    matches!(error, KafkaError::MessageConsumptionFatal(_))
}

impl EventBus for RedpandaEventBus {
    fn publish(
        &self,
        topic: &str,
        payload: &[u8],
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let topic = topic.to_string();
        let payload = payload.to_vec();
        let timeout = self.settings.timeout;

        Box::pin(async move {
            let record = FutureRecord::<(), [u8]>::to(&topic).payload(payload.as_slice());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        bytes = payload.len(),
                        "Message published"
                    );
                    Ok(())
                }
                Err((kafka_error, _)) => {
                    tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish message");
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                }
            }
        })
    }

    fn subscribe(
        &self,
        topics: &[&str],
    ) -> Pin<Box<dyn Future<Output = Result<MessageStream, EventBusError>> + Send + '_>> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let config = self.consumer_config();
        let buffer_size = self.settings.buffer_size;
        let group = self.settings.consumer_group.clone();

        Box::pin(async move {
            let consumer: Arc<StreamConsumer> =
                config
                    .create()
                    .map_err(|e| EventBusError::SubscriptionFailed {
                        topics: topics.clone(),
                        reason: format!("Failed to create consumer: {e}"),
                    })
                    .map(Arc::new)?;

            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(topics = ?topics, consumer_group = %group, "Subscribed to topics");

            *self
                .subscription
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&consumer));

            let (tx, mut rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task owns the consumer; dropping the stream closes the
            // channel and ends the task, which leaves the group.
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(next) = stream.next().await {
                    match next {
                        Ok(message) => {
                            let event = InboundEvent::new(
                                message.topic(),
                                message.partition(),
                                message.offset(),
                                message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
                            );

                            if tx.send(Ok(event)).await.is_err() {
                                tracing::debug!("Subscriber dropped, exiting consumer task");
                                break;
                            }
                        }
                        Err(e) if is_fatal(&e) => {
                            tracing::error!(error = %e, "Fatal consumer error");
                            let _ = tx
                                .send(Err(EventBusError::TransportError(format!(
                                    "Fatal consumer error: {e}"
                                ))))
                                .await;
                            break;
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Consumer error, librdkafka will retry");
                        }
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                while let Some(item) = rx.recv().await {
                    yield item;
                }
            };

            Ok(Box::pin(stream) as MessageStream)
        })
    }

    fn acknowledge(
        &self,
        event: &InboundEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), EventBusError>> + Send + '_>> {
        let result = self
            .subscription
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .ok_or_else(|| EventBusError::CommitFailed("No active subscription".to_string()))
            .and_then(|consumer| commit_next_offset(consumer, event));

        Box::pin(async move { result })
    }
}

/// Commit the offset after `event`, the position the group resumes from.
fn commit_next_offset(
    consumer: &StreamConsumer,
    event: &InboundEvent,
) -> Result<(), EventBusError> {
    let mut offsets = TopicPartitionList::new();
    offsets
        .add_partition_offset(&event.topic, event.partition, Offset::Offset(event.offset + 1))
        .and_then(|()| consumer.commit(&offsets, CommitMode::Async))
        .map_err(|e| {
            EventBusError::CommitFailed(format!(
                "{}[{}]@{}: {e}",
                event.topic, event.partition, event.offset
            ))
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn redpanda_event_bus_is_send_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<RedpandaEventBus>();
        assert_sync::<RedpandaEventBus>();
        assert_send::<RedpandaConnector>();
        assert_sync::<RedpandaConnector>();
    }

    #[test]
    fn builder_defaults_match_service_settings() {
        let connector = RedpandaConnector::builder().build();
        let settings = connector.settings();

        assert_eq!(settings.brokers, "localhost:9092");
        assert_eq!(settings.consumer_group, "analytics-service-group");
        assert_eq!(settings.client_id, "analytics-and-dashboards");
        assert_eq!(settings.session_timeout_ms, 30_000);
        assert_eq!(settings.heartbeat_interval_ms, 10_000);
        assert_eq!(settings.max_poll_interval_ms, 300_000);
        assert_eq!(settings.auto_offset_reset, "earliest");
        assert_eq!(settings.buffer_size, 100);
    }

    #[tokio::test]
    async fn acknowledge_without_subscription_is_a_commit_failure() {
        let connector = RedpandaConnector::builder().build();
        let bus = RedpandaEventBus::from_settings(Arc::clone(&connector.settings)).unwrap();
        let event = InboundEvent::new("analytics-events", 0, 41, b"{}".to_vec());

        let result = bus.acknowledge(&event).await;

        assert!(matches!(result, Err(EventBusError::CommitFailed(_))));
    }

    #[test]
    fn builder_overrides() {
        let connector = RedpandaConnector::builder()
            .brokers("redpanda:29092")
            .consumer_group("group-a")
            .client_id("client-a")
            .session_timeout_ms(6000)
            .heartbeat_interval_ms(2000)
            .max_poll_interval_ms(60_000)
            .timeout(Duration::from_millis(750))
            .buffer_size(0)
            .auto_offset_reset("latest")
            .build();
        let settings = connector.settings();

        assert_eq!(settings.brokers, "redpanda:29092");
        assert_eq!(settings.consumer_group, "group-a");
        assert_eq!(settings.client_id, "client-a");
        assert_eq!(settings.session_timeout_ms, 6000);
        assert_eq!(settings.timeout, Duration::from_millis(750));
        assert_eq!(settings.buffer_size, 1);
        assert_eq!(settings.auto_offset_reset, "latest");
    }

    #[test]
    fn consumer_config_carries_group_settings() {
        let connector = RedpandaConnector::builder()
            .consumer_group("group-b")
            .session_timeout_ms(12_000)
            .build();
        let bus = RedpandaEventBus::from_settings(Arc::clone(&connector.settings)).unwrap();
        let config = bus.consumer_config();

        assert_eq!(config.get("group.id"), Some("group-b"));
        assert_eq!(config.get("session.timeout.ms"), Some("12000"));
        assert_eq!(config.get("enable.auto.commit"), Some("false"));
        assert_eq!(config.get("auto.offset.reset"), Some("earliest"));
    }

    #[test]
    fn only_consumption_fatal_errors_end_the_stream() {
        use rdkafka::types::RDKafkaErrorCode;

        assert!(is_fatal(&KafkaError::MessageConsumptionFatal(
            RDKafkaErrorCode::Fatal
        )));
        assert!(!is_fatal(&KafkaError::MessageConsumption(
            RDKafkaErrorCode::BrokerTransportFailure
        )));
    }

    #[tokio::test]
    async fn connect_fails_when_no_broker_answers() {
        let connector = RedpandaConnector::builder()
            .brokers("127.0.0.1:1")
            .timeout(Duration::from_millis(500))
            .build();

        let result = connector.connect().await;
        assert!(matches!(result, Err(EventBusError::ConnectionFailed(_))));
    }
}

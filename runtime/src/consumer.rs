//! Event consumer with bounded connection retry, cooldown and a dead-letter
//! topic.
//!
//! The consumer owns the broker session for the input topic. Its lifecycle:
//!
//! ```text
//! Disconnected ──► Connecting ──► Connected
//!       ▲                             │
//!       └──── transport error ────────┘
//! ```
//!
//! # Connect loop
//!
//! Attempts start at 1. A successful connect resets the attempt to 1, spawns
//! the read loop as its own task and leaves the connect loop. A failed attempt
//! waits `retry_delay` and tries again, except when `attempt` has reached
//! `max_retries`: then it waits `cooldown` and starts over at attempt 1. The
//! loop never gives up.
//!
//! # Read loop
//!
//! Each message is decoded and passed to the [`EventHandler`]. A decode or
//! handler failure dead-letters that message and the loop continues. A
//! stream-level error ends the loop and marks the connection disconnected.
//! What happens next is decided by the [`ReconnectPolicy`].
//!
//! # Shutdown
//!
//! [`ConsumerHandle::stop`] signals the tasks through a broadcast channel,
//! awaits the read loop at the next message boundary and then drops the
//! broker session.
//!
//! # Example
//!
//! ```rust,ignore
//! let consumer = EventConsumer::builder()
//!     .config(ConsumerConfig::builder().input_topic("beats-events").build())
//!     .connector(connector)
//!     .handler(handler)
//!     .build()?;
//!
//! let handle = consumer.spawn();
//! // ...
//! handle.stop().await;
//! ```

use crate::handlers::EventHandler;
use crate::metrics::ConsumerMetrics;
use analytics_core::environment::{Clock, Sleeper, SystemClock, TokioSleeper};
use analytics_core::event::{DeadLetterRecord, EventEnvelope, InboundEvent};
use analytics_core::event_bus::{BrokerConnector, EventBus, EventBusError, MessageStream};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{RwLock, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Broker connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No session
    Disconnected,
    /// Connect loop running
    Connecting,
    /// Session held, read loop running
    Connected,
}

/// What the consumer does after the read loop ends on a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Re-enter the connect loop at attempt 1.
    #[default]
    Reconnect,
    /// Stay disconnected until the process is restarted.
    Never,
}

/// Consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// Consumer name (for logging)
    pub name: String,
    /// Topic to read events from
    pub input_topic: String,
    /// Topic that receives dead-letter records
    pub dead_letter_topic: String,
    /// Failed attempts before a cooldown
    pub max_retries: u32,
    /// Pause between failed attempts
    pub retry_delay: Duration,
    /// Pause after `max_retries` failed attempts
    pub cooldown: Duration,
    /// Behaviour after a transport error
    pub reconnect: ReconnectPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ConsumerConfig {
    /// Create a configuration builder.
    #[must_use]
    pub fn builder() -> ConsumerConfigBuilder {
        ConsumerConfigBuilder::default()
    }
}

/// Builder for [`ConsumerConfig`].
#[derive(Debug, Clone, Default)]
pub struct ConsumerConfigBuilder {
    name: Option<String>,
    input_topic: Option<String>,
    dead_letter_topic: Option<String>,
    max_retries: Option<u32>,
    retry_delay: Option<Duration>,
    cooldown: Option<Duration>,
    reconnect: Option<ReconnectPolicy>,
}

impl ConsumerConfigBuilder {
    /// Set consumer name (default: `analytics-consumer`).
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set input topic (default: `beats-events`).
    #[must_use]
    pub fn input_topic(mut self, topic: impl Into<String>) -> Self {
        self.input_topic = Some(topic.into());
        self
    }

    /// Set dead-letter topic (default: `analytics-dlq`).
    #[must_use]
    pub fn dead_letter_topic(mut self, topic: impl Into<String>) -> Self {
        self.dead_letter_topic = Some(topic.into());
        self
    }

    /// Set failed attempts before a cooldown (default: 10, minimum 1).
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set pause between failed attempts (default: 3s).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Set cooldown after `max_retries` failures (default: 30s).
    #[must_use]
    pub const fn cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = Some(cooldown);
        self
    }

    /// Set reconnect policy (default: [`ReconnectPolicy::Reconnect`]).
    #[must_use]
    pub const fn reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = Some(policy);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> ConsumerConfig {
        ConsumerConfig {
            name: self.name.unwrap_or_else(|| "analytics-consumer".to_string()),
            input_topic: self.input_topic.unwrap_or_else(|| "beats-events".to_string()),
            dead_letter_topic: self
                .dead_letter_topic
                .unwrap_or_else(|| "analytics-dlq".to_string()),
            max_retries: self.max_retries.unwrap_or(10).max(1),
            retry_delay: self.retry_delay.unwrap_or(Duration::from_secs(3)),
            cooldown: self.cooldown.unwrap_or(Duration::from_secs(30)),
            reconnect: self.reconnect.unwrap_or_default(),
        }
    }
}

/// Errors from building a consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConsumerBuildError {
    /// A required builder field was not set.
    #[error("EventConsumer builder is missing `{0}`")]
    Missing(&'static str),
}

/// Point-in-time consumer status for health output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerStatus {
    /// Connection state
    pub state: ConnectionState,
    /// Current connection attempt (1 when connected)
    pub attempt: u32,
    /// Input topic
    pub topic: String,
    /// Dead-letter topic
    pub dead_letter_topic: String,
    /// Messages handled successfully
    pub messages_processed: u64,
    /// Messages that failed decoding or handling
    pub messages_failed: u64,
    /// Dead-letter records published
    pub dead_letters_published: u64,
    /// Dead-letter records dropped because no producer was available
    pub dead_letters_dropped: u64,
    /// When the current session was established
    pub connected_since: Option<DateTime<Utc>>,
}

/// Why a read loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadLoopExit {
    Shutdown,
    Transport(String),
    StreamEnded,
    Aborted,
}

struct Session {
    bus: Arc<dyn EventBus>,
    since: DateTime<Utc>,
}

/// Mutable state shared by the consumer's tasks.
struct Shared {
    state: RwLock<ConnectionState>,
    session: RwLock<Option<Session>>,
    attempt: AtomicU32,
    messages_processed: AtomicU64,
    messages_failed: AtomicU64,
    dead_letters_published: AtomicU64,
    dead_letters_dropped: AtomicU64,
}

/// Event consumer for the input topic.
///
/// Cheap to clone; clones share connection state and counters.
#[derive(Clone)]
pub struct EventConsumer {
    config: Arc<ConsumerConfig>,
    connector: Arc<dyn BrokerConnector>,
    handler: Arc<dyn EventHandler>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
    shared: Arc<Shared>,
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// The consumer's configuration.
    #[must_use]
    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Current connection state.
    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Whether a broker session is held.
    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Current connection attempt.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.shared.attempt.load(Ordering::SeqCst)
    }

    /// Snapshot for health output.
    pub async fn status(&self) -> ConsumerStatus {
        let state = self.state().await;
        let connected_since = self.shared.session.read().await.as_ref().map(|s| s.since);
        ConsumerStatus {
            state,
            attempt: self.attempt(),
            topic: self.config.input_topic.clone(),
            dead_letter_topic: self.config.dead_letter_topic.clone(),
            messages_processed: self.shared.messages_processed.load(Ordering::Relaxed),
            messages_failed: self.shared.messages_failed.load(Ordering::Relaxed),
            dead_letters_published: self.shared.dead_letters_published.load(Ordering::Relaxed),
            dead_letters_dropped: self.shared.dead_letters_dropped.load(Ordering::Relaxed),
            connected_since,
        }
    }

    /// Spawn the connect loop and read loop as background tasks.
    ///
    /// The returned handle stops them.
    #[must_use]
    pub fn spawn(&self) -> ConsumerHandle {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let consumer = self.clone();
        let sender = shutdown_tx.clone();
        let task = tokio::spawn(async move { consumer.supervise(sender, shutdown_rx).await });

        ConsumerHandle {
            consumer: self.clone(),
            shutdown: shutdown_tx,
            task,
        }
    }

    /// Publish raw bytes to `topic` over the current session.
    ///
    /// Returns `false` when not connected or when the publish fails.
    pub async fn send_message(&self, topic: &str, payload: &[u8]) -> bool {
        let Some(bus) = self.current_bus().await else {
            warn!(
                consumer = %self.config.name,
                topic,
                "Producer not connected, message not sent"
            );
            return false;
        };

        match bus.publish(topic, payload).await {
            Ok(()) => true,
            Err(e) => {
                error!(consumer = %self.config.name, topic, error = %e, "Failed to send message");
                false
            }
        }
    }

    /// Publish a dead-letter record for a message that could not be processed.
    ///
    /// Without a live producer the record is logged and dropped. Returns
    /// whether the record was published.
    pub async fn send_to_dead_letter(&self, original_event: &str, reason: &str) -> bool {
        let record = DeadLetterRecord::new(original_event, reason, self.clock.now());
        let payload = match record.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!(consumer = %self.config.name, error = %e, "Failed to serialize dead-letter record");
                self.record_dead_letter_dropped();
                return false;
            }
        };

        let Some(bus) = self.current_bus().await else {
            error!(
                consumer = %self.config.name,
                topic = %self.config.dead_letter_topic,
                reason,
                original_event,
                "Producer not connected, dead-letter record dropped"
            );
            self.record_dead_letter_dropped();
            return false;
        };

        match bus.publish(&self.config.dead_letter_topic, &payload).await {
            Ok(()) => {
                self.shared
                    .dead_letters_published
                    .fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_dead_letter_published();
                info!(
                    consumer = %self.config.name,
                    topic = %self.config.dead_letter_topic,
                    reason,
                    "Message sent to dead-letter topic"
                );
                true
            }
            Err(e) => {
                error!(
                    consumer = %self.config.name,
                    topic = %self.config.dead_letter_topic,
                    error = %e,
                    reason,
                    original_event,
                    "Failed to publish dead-letter record, dropped"
                );
                self.record_dead_letter_dropped();
                false
            }
        }
    }

    fn record_dead_letter_dropped(&self) {
        self.shared
            .dead_letters_dropped
            .fetch_add(1, Ordering::Relaxed);
        ConsumerMetrics::record_dead_letter_dropped();
    }

    async fn current_bus(&self) -> Option<Arc<dyn EventBus>> {
        if self.state().await != ConnectionState::Connected {
            return None;
        }
        self.shared
            .session
            .read()
            .await
            .as_ref()
            .map(|session| Arc::clone(&session.bus))
    }

    async fn set_state(&self, state: ConnectionState) {
        *self.shared.state.write().await = state;
        ConsumerMetrics::record_connected(state == ConnectionState::Connected);
    }

    /// Connect, run the read loop, and decide what to do when it ends.
    async fn supervise(
        self,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!(consumer = %self.config.name, topic = %self.config.input_topic, "Event consumer started");

        loop {
            // Subscribed before connecting so a stop sent at any later point
            // reaches the read loop.
            let read_shutdown = shutdown_tx.subscribe();

            let Some((bus, stream)) = self.connect_loop(&mut shutdown).await else {
                break;
            };

            *self.shared.session.write().await = Some(Session {
                bus: Arc::clone(&bus),
                since: self.clock.now(),
            });
            self.set_state(ConnectionState::Connected).await;

            let reader = self.clone();
            let read_task = tokio::spawn(async move {
                reader
                    .read_loop(bus.as_ref(), stream, read_shutdown)
                    .await
            });
            let exit = read_task.await.unwrap_or_else(|e| {
                error!(consumer = %self.config.name, error = %e, "Read loop task failed");
                ReadLoopExit::Aborted
            });

            self.set_state(ConnectionState::Disconnected).await;
            self.shared.session.write().await.take();

            let reason = match exit {
                ReadLoopExit::Shutdown => break,
                ReadLoopExit::Transport(reason) => reason,
                ReadLoopExit::StreamEnded => "stream ended".to_string(),
                ReadLoopExit::Aborted => "read loop aborted".to_string(),
            };

            if self.config.reconnect == ReconnectPolicy::Never {
                error!(
                    consumer = %self.config.name,
                    reason = %reason,
                    "Broker session lost and reconnect is disabled, consumer stays disconnected until restart"
                );
                let _ = shutdown.recv().await;
                break;
            }
            warn!(consumer = %self.config.name, reason = %reason, "Broker session lost, reconnecting");
        }

        self.set_state(ConnectionState::Disconnected).await;
        info!(consumer = %self.config.name, "Event consumer stopped");
    }

    /// Retry until connected and subscribed, or until shutdown.
    async fn connect_loop(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<(Arc<dyn EventBus>, MessageStream)> {
        let mut attempt: u32 = 1;

        loop {
            self.shared.attempt.store(attempt, Ordering::SeqCst);
            self.set_state(ConnectionState::Connecting).await;
            ConsumerMetrics::record_connection_attempt();
            info!(
                consumer = %self.config.name,
                attempt,
                max_retries = self.config.max_retries,
                "Connecting to broker"
            );

            let result = tokio::select! {
                _ = shutdown.recv() => return None,
                result = self.try_connect() => result,
            };

            match result {
                Ok(connected) => {
                    self.shared.attempt.store(1, Ordering::SeqCst);
                    info!(consumer = %self.config.name, attempt, topic = %self.config.input_topic, "Connected and subscribed");
                    return Some(connected);
                }
                Err(e) => {
                    self.set_state(ConnectionState::Disconnected).await;

                    let pause = if attempt >= self.config.max_retries {
                        ConsumerMetrics::record_cooldown();
                        warn!(
                            consumer = %self.config.name,
                            attempt,
                            error = %e,
                            cooldown_ms = duration_ms(self.config.cooldown),
                            "Connection retries exhausted, cooling down"
                        );
                        attempt = 1;
                        self.config.cooldown
                    } else {
                        warn!(
                            consumer = %self.config.name,
                            attempt,
                            error = %e,
                            retry_delay_ms = duration_ms(self.config.retry_delay),
                            "Connection attempt failed, retrying"
                        );
                        attempt += 1;
                        self.config.retry_delay
                    };
                    self.shared.attempt.store(attempt, Ordering::SeqCst);

                    tokio::select! {
                        _ = shutdown.recv() => return None,
                        () = self.sleeper.sleep(pause) => {}
                    }
                }
            }
        }
    }

    async fn try_connect(&self) -> Result<(Arc<dyn EventBus>, MessageStream), EventBusError> {
        let bus = self.connector.connect().await?;
        let stream = bus.subscribe(&[self.config.input_topic.as_str()]).await?;
        Ok((bus, stream))
    }

    /// Process messages until shutdown or a stream-level failure.
    ///
    /// A message is acknowledged once handled or dead-lettered, never before.
    async fn read_loop(
        &self,
        bus: &dyn EventBus,
        mut stream: MessageStream,
        mut shutdown: broadcast::Receiver<()>,
    ) -> ReadLoopExit {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => {
                    info!(consumer = %self.config.name, "Read loop received shutdown signal");
                    return ReadLoopExit::Shutdown;
                }
                next = stream.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    self.process_message(&message).await;
                    self.acknowledge(bus, &message).await;
                }
                Some(Err(e)) => {
                    error!(consumer = %self.config.name, error = %e, "Broker stream failed");
                    return ReadLoopExit::Transport(e.to_string());
                }
                None => {
                    warn!(consumer = %self.config.name, "Broker stream ended");
                    return ReadLoopExit::StreamEnded;
                }
            }
        }
    }

    async fn process_message(&self, message: &InboundEvent) {
        let started = Instant::now();
        debug!(
            consumer = %self.config.name,
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "Message received"
        );

        let outcome = match EventEnvelope::decode(&message.payload) {
            Ok(envelope) => self
                .handler
                .handle(&envelope)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        match outcome {
            Ok(()) => {
                self.shared
                    .messages_processed
                    .fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_message(started.elapsed());
            }
            Err(reason) => {
                self.shared.messages_failed.fetch_add(1, Ordering::Relaxed);
                ConsumerMetrics::record_message_failed();
                error!(
                    consumer = %self.config.name,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %reason,
                    "Failed to process message"
                );
                self.send_to_dead_letter(&message.payload_text(), &reason)
                    .await;
            }
        }
    }

    async fn acknowledge(&self, bus: &dyn EventBus, message: &InboundEvent) {
        if let Err(e) = bus.acknowledge(message).await {
            warn!(
                consumer = %self.config.name,
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                error = %e,
                "Failed to acknowledge message, it may be redelivered"
            );
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Handle to a running consumer.
#[derive(Debug)]
pub struct ConsumerHandle {
    consumer: EventConsumer,
    shutdown: broadcast::Sender<()>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// The running consumer.
    #[must_use]
    pub const fn consumer(&self) -> &EventConsumer {
        &self.consumer
    }

    /// Stop the consumer.
    ///
    /// Signals shutdown, waits for the read loop to finish its current
    /// message and for the session to be dropped.
    pub async fn stop(self) {
        info!(consumer = %self.consumer.config.name, "Stopping event consumer");
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            error!(consumer = %self.consumer.config.name, error = %e, "Consumer task failed during shutdown");
        }
    }
}

/// Builder for configuring an [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    config: Option<ConsumerConfig>,
    connector: Option<Arc<dyn BrokerConnector>>,
    handler: Option<Arc<dyn EventHandler>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl EventConsumerBuilder {
    /// Set the configuration (default: [`ConsumerConfig::default`]).
    #[must_use]
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the broker connector.
    #[must_use]
    pub fn connector(mut self, connector: Arc<dyn BrokerConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Set the event handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the clock used for dead-letter timestamps (default: system clock).
    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the sleeper used for retry delays and cooldowns (default: tokio).
    #[must_use]
    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = Some(sleeper);
        self
    }

    /// Build the [`EventConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`ConsumerBuildError::Missing`] if the connector or handler is
    /// not set.
    pub fn build(self) -> Result<EventConsumer, ConsumerBuildError> {
        Ok(EventConsumer {
            config: Arc::new(self.config.unwrap_or_default()),
            connector: self
                .connector
                .ok_or(ConsumerBuildError::Missing("connector"))?,
            handler: self.handler.ok_or(ConsumerBuildError::Missing("handler"))?,
            clock: self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            sleeper: self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper)),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Disconnected),
                session: RwLock::new(None),
                attempt: AtomicU32::new(1),
                messages_processed: AtomicU64::new(0),
                messages_failed: AtomicU64::new(0),
                dead_letters_published: AtomicU64::new(0),
                dead_letters_dropped: AtomicU64::new(0),
            }),
        })
    }
}

//! End-to-end event flow: broker double → consumer → handler → dispatcher.
//!
//! Uses the in-memory broker and a recording trigger; no network.

#![allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect

use analytics_core::environment::Clock;
use analytics_core::event::DeadLetterRecord;
use analytics_runtime::consumer::{ConsumerConfig, ConsumerHandle, EventConsumer};
use analytics_runtime::retry::RetryPolicy;
use analytics_service::events::{
    AnalyticsEventHandler, BeatCreatedDispatcher, BeatMetricsRequest, BeatMetricsTrigger,
    DispatchError,
};
use analytics_testing::helpers::{init_tracing, wait_until, wait_until_async};
use analytics_testing::{InMemoryEventBus, RecordingSleeper, ScriptedConnector, test_clock};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct RecordingTrigger {
    calls: Mutex<Vec<BeatMetricsRequest>>,
    unavailable: AtomicBool,
}

impl RecordingTrigger {
    fn calls(&self) -> Vec<BeatMetricsRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl BeatMetricsTrigger for RecordingTrigger {
    async fn trigger(&self, request: &BeatMetricsRequest) -> Result<(), DispatchError> {
        self.calls.lock().unwrap().push(request.clone());
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DispatchError::Status {
                status: 503,
                body: "calculation service unavailable".to_string(),
            });
        }
        Ok(())
    }
}

struct Harness {
    bus: Arc<InMemoryEventBus>,
    trigger: Arc<RecordingTrigger>,
    sleeper: RecordingSleeper,
    consumer: EventConsumer,
    handle: ConsumerHandle,
}

impl Harness {
    fn start() -> Self {
        init_tracing();
        let bus = Arc::new(InMemoryEventBus::new());
        let trigger = Arc::new(RecordingTrigger::default());
        let sleeper = RecordingSleeper::new();

        let dispatcher = BeatCreatedDispatcher::with_sleeper(
            trigger.clone(),
            RetryPolicy::default(),
            Arc::new(sleeper.clone()),
        );
        let consumer = EventConsumer::builder()
            .config(ConsumerConfig::default())
            .connector(Arc::new(ScriptedConnector::connected(Arc::clone(&bus))))
            .handler(Arc::new(AnalyticsEventHandler::new(dispatcher)))
            .clock(Arc::new(test_clock()))
            .sleeper(Arc::new(sleeper.clone()))
            .build()
            .unwrap();
        let handle = consumer.spawn();

        Self {
            bus,
            trigger,
            sleeper,
            consumer,
            handle,
        }
    }

    fn push(&self, payload: &str) {
        self.bus.sender("beats-events").push(payload);
    }

    fn dead_letters(&self) -> Vec<DeadLetterRecord> {
        self.bus
            .published("analytics-dlq")
            .iter()
            .map(|bytes| serde_json::from_slice(bytes).unwrap())
            .collect()
    }

    async fn wait_processed(&self, count: u64) {
        let probe = self.consumer.clone();
        assert!(
            wait_until_async(WAIT, || {
                let probe = probe.clone();
                async move { probe.status().await.messages_processed >= count }
            })
            .await
        );
    }
}

#[tokio::test]
async fn beat_created_without_audio_url_is_dead_lettered_without_outbound_call() {
    let harness = Harness::start();
    let raw = r#"{"type":"BEAT_CREATED","payload":{"beatId":"b1"}}"#;

    harness.push(raw);

    assert!(wait_until(WAIT, || harness.bus.published("analytics-dlq").len() == 1).await);
    let records = harness.dead_letters();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_event, raw);
    assert!(records[0].error.contains("audioUrl"));
    assert!(!records[0].error.contains("beatId"));
    assert_eq!(records[0].timestamp, test_clock().now());

    assert!(harness.trigger.calls().is_empty());
    harness.handle.stop().await;
}

#[tokio::test]
async fn valid_beat_created_triggers_calculation_once() {
    let harness = Harness::start();

    harness.push(
        r#"{"type":"BEAT_CREATED","payload":{"beatId":"b7","audioUrl":"https://cdn.example.com/b7.wav","userId":"u3"}}"#,
    );
    harness.wait_processed(1).await;

    let calls = harness.trigger.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].beat_id, "b7");
    assert_eq!(calls[0].audio_url, "https://cdn.example.com/b7.wav");
    assert_eq!(calls[0].user_id.as_deref(), Some("u3"));
    assert!(harness.dead_letters().is_empty());

    harness.handle.stop().await;
}

#[tokio::test]
async fn exhausted_dispatch_is_dead_lettered_with_last_error() {
    let harness = Harness::start();
    harness.trigger.unavailable.store(true, Ordering::SeqCst);

    harness.push(r#"{"type":"BEAT_CREATED","payload":{"beatId":"b1","audioUrl":"s3://b1.wav"}}"#);

    assert!(wait_until(WAIT, || harness.bus.published("analytics-dlq").len() == 1).await);
    let records = harness.dead_letters();
    assert_eq!(
        records[0].error,
        "Processing failed: Beat metrics endpoint returned 503: calculation service unavailable"
    );
    assert_eq!(harness.trigger.calls().len(), 3);
    assert_eq!(harness.sleeper.sleeps(), vec![Duration::from_secs(2); 2]);

    harness.handle.stop().await;
}

#[tokio::test]
async fn unknown_event_types_are_acknowledged() {
    let harness = Harness::start();

    harness.push(r#"{"type":"BEAT_DELETED","payload":{"beatId":"b1"}}"#);
    harness.push("not json at all");
    harness.wait_processed(1).await;
    assert!(wait_until(WAIT, || harness.bus.published("analytics-dlq").len() == 1).await);

    let records = harness.dead_letters();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].original_event, "not json at all");
    assert!(harness.trigger.calls().is_empty());

    harness.handle.stop().await;
}

//! Inbound broker messages, the decoded envelope and the domain event enum.
//!
//! Messages on the input topic are JSON envelopes of the form
//! `{"type": "<EVENT_TYPE>", "payload": {...}}`. Decoding happens in two
//! steps:
//!
//! 1. [`EventEnvelope::decode`] turns raw bytes into an envelope, failing with
//!    [`EventError`] when the bytes are not a JSON object. A missing `type`
//!    becomes `"UNKNOWN"`; a missing `payload` becomes an empty map.
//! 2. [`AnalyticsEvent::from_envelope`] maps the envelope onto the closed set
//!    of event types this service understands, with an explicit
//!    [`AnalyticsEvent::Unknown`] branch for everything else.
//!
//! Messages that cannot be processed are wrapped in a [`DeadLetterRecord`] and
//! published to the dead-letter topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Event type used when an envelope carries no `type` field.
pub const UNKNOWN_EVENT_TYPE: &str = "UNKNOWN";

/// Event type announcing a newly uploaded beat.
pub const BEAT_CREATED: &str = "BEAT_CREATED";

/// Errors raised while decoding an inbound message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The message body is not valid JSON.
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    /// The message body is JSON but not an object.
    #[error("Envelope must be a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// The `payload` field is present but not an object.
    #[error("Envelope payload must be a JSON object, got {0}")]
    InvalidPayload(&'static str),

    /// The message carried no bytes at all.
    #[error("Empty message")]
    Empty,
}

/// A raw message as delivered by the broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InboundEvent {
    /// Topic the message was read from.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Raw message body.
    pub payload: Vec<u8>,
}

impl InboundEvent {
    /// Create an inbound event.
    #[must_use]
    pub fn new(topic: impl Into<String>, partition: i32, offset: i64, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            payload,
        }
    }

    /// Message body as text, replacing invalid UTF-8 sequences.
    #[must_use]
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Decoded `{type, payload}` envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Event type discriminator, `"UNKNOWN"` when absent.
    #[serde(rename = "type")]
    pub event_type: String,
    /// Event payload.
    pub payload: Map<String, Value>,
}

impl EventEnvelope {
    /// Build an envelope from a type and a payload map.
    #[must_use]
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Decode an envelope from raw message bytes.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the bytes are empty, not JSON, not a JSON
    /// object, or carry a non-object `payload`.
    pub fn decode(bytes: &[u8]) -> Result<Self, EventError> {
        if bytes.is_empty() {
            return Err(EventError::Empty);
        }

        let value: Value =
            serde_json::from_slice(bytes).map_err(|e| EventError::InvalidJson(e.to_string()))?;

        let Value::Object(mut object) = value else {
            return Err(EventError::NotAnObject(json_kind(&value)));
        };

        let event_type = match object.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => UNKNOWN_EVENT_TYPE.to_string(),
        };

        let payload = match object.remove("payload") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map,
            Some(other) => return Err(EventError::InvalidPayload(json_kind(&other))),
        };

        Ok(Self {
            event_type,
            payload,
        })
    }

    /// Serialize the envelope back to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Non-empty string field from the payload.
    #[must_use]
    pub fn payload_str(&self, field: &str) -> Option<&str> {
        self.payload
            .get(field)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// `BEAT_CREATED` payload.
///
/// Fields are optional here; presence is checked by the dispatcher so that a
/// missing field becomes a dead-letter reason instead of a decode error.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BeatCreated {
    /// Beat identifier.
    pub beat_id: Option<String>,
    /// Location of the uploaded audio.
    pub audio_url: Option<String>,
    /// Uploading user, if known.
    pub user_id: Option<String>,
}

/// Domain events consumed from the input topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AnalyticsEvent {
    /// A beat was uploaded and needs its audio metrics computed.
    BeatCreated(BeatCreated),
    /// Any event type without a handler. Acknowledged as a no-op.
    Unknown {
        /// The unrecognised type discriminator.
        event_type: String,
    },
}

impl AnalyticsEvent {
    /// Classify a decoded envelope.
    #[must_use]
    pub fn from_envelope(envelope: &EventEnvelope) -> Self {
        match envelope.event_type.as_str() {
            BEAT_CREATED => Self::BeatCreated(BeatCreated {
                beat_id: envelope.payload_str("beatId").map(str::to_string),
                audio_url: envelope.payload_str("audioUrl").map(str::to_string),
                user_id: envelope.payload_str("userId").map(str::to_string),
            }),
            other => Self::Unknown {
                event_type: other.to_string(),
            },
        }
    }

    /// Type discriminator of this event.
    #[must_use]
    pub fn event_type(&self) -> &str {
        match self {
            Self::BeatCreated(_) => BEAT_CREATED,
            Self::Unknown { event_type } => event_type,
        }
    }
}

/// Record published to the dead-letter topic for a message that could not be
/// processed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    /// The raw message text as received.
    pub original_event: String,
    /// Why processing failed.
    pub error: String,
    /// When the record was created.
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Create a dead-letter record.
    #[must_use]
    pub fn new(
        original_event: impl Into<String>,
        error: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            original_event: original_event.into(),
            error: error.into(),
            timestamp,
        }
    }

    /// Serialize the record to JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns a `serde_json` error if serialization fails.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn decode_beat_created() {
        let raw = br#"{"type":"BEAT_CREATED","payload":{"beatId":"b1","audioUrl":"s3://a.wav","userId":"u1"}}"#;
        let envelope = EventEnvelope::decode(raw).unwrap();

        assert_eq!(envelope.event_type, BEAT_CREATED);
        assert_eq!(
            AnalyticsEvent::from_envelope(&envelope),
            AnalyticsEvent::BeatCreated(BeatCreated {
                beat_id: Some("b1".into()),
                audio_url: Some("s3://a.wav".into()),
                user_id: Some("u1".into()),
            })
        );
    }

    #[test]
    fn missing_type_becomes_unknown() {
        let envelope = EventEnvelope::decode(br#"{"payload":{"x":1}}"#).unwrap();
        assert_eq!(envelope.event_type, UNKNOWN_EVENT_TYPE);
        assert_eq!(
            AnalyticsEvent::from_envelope(&envelope).event_type(),
            UNKNOWN_EVENT_TYPE
        );
    }

    #[test]
    fn missing_payload_is_empty_map() {
        let envelope = EventEnvelope::decode(br#"{"type":"BEAT_DELETED"}"#).unwrap();
        assert!(envelope.payload.is_empty());
        assert_eq!(
            AnalyticsEvent::from_envelope(&envelope),
            AnalyticsEvent::Unknown {
                event_type: "BEAT_DELETED".into()
            }
        );
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert_eq!(EventEnvelope::decode(b""), Err(EventError::Empty));
        assert!(matches!(
            EventEnvelope::decode(b"{not json"),
            Err(EventError::InvalidJson(_))
        ));
        assert_eq!(
            EventEnvelope::decode(b"[1,2]"),
            Err(EventError::NotAnObject("array"))
        );
        assert_eq!(
            EventEnvelope::decode(br#"{"type":"X","payload":"text"}"#),
            Err(EventError::InvalidPayload("string"))
        );
    }

    #[test]
    fn empty_strings_count_as_missing() {
        let envelope =
            EventEnvelope::decode(br#"{"type":"BEAT_CREATED","payload":{"beatId":"","audioUrl":"a"}}"#)
                .unwrap();
        let AnalyticsEvent::BeatCreated(beat) = AnalyticsEvent::from_envelope(&envelope) else {
            unreachable!("BEAT_CREATED maps to BeatCreated");
        };
        assert_eq!(beat.beat_id, None);
        assert_eq!(beat.audio_url.as_deref(), Some("a"));
    }

    #[test]
    fn dead_letter_record_uses_camel_case() {
        let timestamp = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let record = DeadLetterRecord::new("{bad", "Invalid JSON", timestamp);
        let json: Value = serde_json::from_slice(&record.to_bytes().unwrap()).unwrap();

        assert_eq!(json["originalEvent"], "{bad");
        assert_eq!(json["error"], "Invalid JSON");
        assert_eq!(json["timestamp"], "2025-01-01T00:00:00Z");
    }

    #[test]
    fn payload_text_is_lossy() {
        let event = InboundEvent::new("beats-events", 0, 7, vec![b'o', b'k', 0xff]);
        assert_eq!(event.payload_text(), "ok\u{fffd}");
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn decode_never_panics(bytes in proptest::collection::vec(any::<u8>(), 0..256)) {
                let _ = EventEnvelope::decode(&bytes);
            }

            #[test]
            fn string_fields_survive_decoding(
                event_type in "[A-Z_]{1,20}",
                beat_id in "[a-z0-9-]{0,12}",
            ) {
                let raw = serde_json::json!({
                    "type": event_type,
                    "payload": { "beatId": beat_id },
                });
                let envelope = EventEnvelope::decode(raw.to_string().as_bytes()).unwrap();
                prop_assert_eq!(&envelope.event_type, &event_type);
                prop_assert_eq!(envelope.payload_str("beatId"), Some(beat_id.as_str()).filter(|s| !s.is_empty()));
            }
        }
    }
}

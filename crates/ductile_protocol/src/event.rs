//! Plugin-emitted events and their core-stamped form.

use chrono::{DateTime, Utc};
use ductile_ids::EventId;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// An event exactly as a plugin emits it in a response.
///
/// The plugin owns `type` and `payload`. It may pin the event's identity
/// with `event_id` or `dedupe_key`; otherwise the orchestrator mints one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmittedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedupe_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
}

/// An event after the orchestrator has stamped identity and provenance.
///
/// `event_id` is stable across parent retries whenever the plugin supplied
/// any identity at all, which is what keeps child enqueue idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: Map<String, Value>,
    pub source: String,
    pub timestamp: DateTime<Utc>,
    pub event_id: EventId,
}

impl StampedEvent {
    /// Stamp a raw plugin event with identity and provenance.
    ///
    /// Identity resolution order: explicit `event_id`, then `dedupe_key`,
    /// then a string `event_id` inside the payload, then a fresh UUID.
    pub fn stamp(event: EmittedEvent, source: &str, timestamp: DateTime<Utc>) -> Self {
        let event_id = event
            .event_id
            .clone()
            .or_else(|| event.dedupe_key.clone())
            .or_else(|| {
                event
                    .payload
                    .get("event_id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .map(EventId::from_string)
            .unwrap_or_default();

        Self {
            event_type: event.event_type,
            payload: event.payload,
            source: source.to_string(),
            timestamp,
            event_id,
        }
    }
}

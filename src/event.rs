use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Semi-structured event payload. Shape depends on the event type.
pub type Payload = Map<String, Value>;

/// EventType identifies the kind of telemetry event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Vital,
    Error,
    Navigation,
    /// Anything the ingestion boundary did not recognise.
    Unknown,
}

impl EventType {
    /// Returns the canonical storage label.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Vital => "vital",
            Self::Error => "error",
            Self::Navigation => "navigation",
            Self::Unknown => "unknown",
        }
    }

    /// Convert from the canonical label. Unrecognised labels map to `Unknown`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "vital" => Self::Vital,
            "error" => Self::Error,
            "navigation" => Self::Navigation,
            _ => Self::Unknown,
        }
    }

    /// Return all known event types.
    pub fn all() -> &'static [Self] {
        &[Self::Vital, Self::Error, Self::Navigation, Self::Unknown]
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fully formed, persisted telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: String,
    pub app_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub payload: Payload,
}

impl Event {
    /// Returns a string field from the payload, if present.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Returns a numeric field from the payload, if present.
    pub fn payload_f64(&self, key: &str) -> Option<f64> {
        self.payload.get(key).and_then(Value::as_f64)
    }
}

/// Event as captured by the collector, before ingestion assigns an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Payload,
    /// Client-observed epoch milliseconds.
    pub timestamp: i64,
}

/// Metadata shared by every event in one delivered batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// Wire body posted by the collector to the ingestion boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestBatch {
    pub app_id: String,
    pub events: Vec<ClientEvent>,
    pub common_metadata: CommonMetadata,
}

/// Returns a nested string field, e.g. `device.browser`.
pub fn nested_str<'a>(payload: &'a Payload, outer: &str, inner: &str) -> Option<&'a str> {
    payload
        .get(outer)
        .and_then(Value::as_object)
        .and_then(|o| o.get(inner))
        .and_then(Value::as_str)
}

//! Event records accepted by the client.
//!
//! Validity of an event (`is_valid`) is advisory: the buffer and dispatcher never reject an
//! invalid event, they forward whatever the producer submitted.
use derive_more::From;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Result;

/// Kind of a buffered event. Each kind is drained and dispatched separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// [`CaptureEvent`]s.
    Capture,
    /// [`IdentifyEvent`]s.
    Identify,
}

/// A single analytics occurrence.
///
/// # Examples
/// ```
/// # use posthog_batch::CaptureEvent;
/// let event = CaptureEvent::new("signed_up", "user-42").property("plan", "pro");
/// assert!(event.is_valid());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureEvent {
    /// Event name.
    pub event: String,
    /// Identifier of the user (or other entity) the event belongs to.
    pub distinct_id: String,
    /// Arbitrary event properties.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Unix timestamp in seconds.
    pub timestamp: Option<i64>,
    /// Project token overriding the client API key for this event.
    pub token: Option<String>,
    /// Additional context forwarded as-is.
    pub context: Option<Map<String, Value>>,
    /// Extra top-level fields, serialized alongside the known ones.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CaptureEvent {
    /// Create an event with the given name and distinct id.
    pub fn new(event: impl Into<String>, distinct_id: impl Into<String>) -> Self {
        CaptureEvent {
            event: event.into(),
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Set a single property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Set the timestamp (Unix seconds).
    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Stamp the event with the current time.
    pub fn with_current_timestamp(self) -> Self {
        self.timestamp(chrono::Utc::now().timestamp())
    }

    /// An event is valid when both `event` and `distinct_id` are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.event.is_empty() && !self.distinct_id.is_empty()
    }

    /// Serialize the event into the JSON object sent over the wire.
    ///
    /// With `exclude_empty`, absent optional fields are dropped instead of being sent as `null`.
    /// With `batched`, `distinct_id` and `timestamp` are moved under `properties`, which is the
    /// shape expected inside a `/batch` request.
    pub fn prepare_request(&self, batched: bool, exclude_empty: bool) -> Result<Map<String, Value>> {
        prepare(self, batched, exclude_empty)
    }
}

/// Associates properties with a user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentifyEvent {
    /// Identifier of the user.
    pub distinct_id: String,
    /// Properties to set on the user.
    #[serde(default)]
    pub properties: Map<String, Value>,
    /// Project token overriding the client API key for this event.
    pub token: Option<String>,
    /// Additional context forwarded as-is.
    pub context: Option<Map<String, Value>>,
}

impl IdentifyEvent {
    /// Create an identify event for `distinct_id`.
    pub fn new(distinct_id: impl Into<String>) -> Self {
        IdentifyEvent {
            distinct_id: distinct_id.into(),
            ..Default::default()
        }
    }

    /// Set a single property.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// An identify event is valid when `distinct_id` is non-empty.
    pub fn is_valid(&self) -> bool {
        !self.distinct_id.is_empty()
    }

    /// Serialize the event into the JSON object sent over the wire. See
    /// [`CaptureEvent::prepare_request`].
    pub fn prepare_request(&self, batched: bool, exclude_empty: bool) -> Result<Map<String, Value>> {
        prepare(self, batched, exclude_empty)
    }
}

/// Any event the client can buffer.
#[derive(Debug, Clone, PartialEq, From)]
pub enum Event {
    /// See [`CaptureEvent`].
    Capture(CaptureEvent),
    /// See [`IdentifyEvent`].
    Identify(IdentifyEvent),
}

impl Event {
    /// Kind of the wrapped event.
    pub fn kind(&self) -> EventKind {
        match self {
            Event::Capture(_) => EventKind::Capture,
            Event::Identify(_) => EventKind::Identify,
        }
    }

    /// See [`CaptureEvent::is_valid`] and [`IdentifyEvent::is_valid`].
    pub fn is_valid(&self) -> bool {
        match self {
            Event::Capture(event) => event.is_valid(),
            Event::Identify(event) => event.is_valid(),
        }
    }
}

fn prepare<T: Serialize>(event: &T, batched: bool, exclude_empty: bool) -> Result<Map<String, Value>> {
    let mut data: Map<String, Value> = serde_json::from_value(serde_json::to_value(event)?)?;
    if exclude_empty {
        data.retain(|_, value| !value.is_null());
    }
    if batched {
        let distinct_id = data.remove("distinct_id");
        let timestamp = data.remove("timestamp").filter(|value| !value.is_null());

        let properties = data
            .entry("properties")
            .or_insert_with(|| Value::Object(Map::new()));
        if !properties.is_object() {
            *properties = Value::Object(Map::new());
        }
        if let Value::Object(properties) = properties {
            if let Some(distinct_id) = distinct_id {
                properties.insert("distinct_id".to_owned(), distinct_id);
            }
            if let Some(timestamp) = timestamp {
                properties.insert("timestamp".to_owned(), timestamp);
            }
        }
    }
    Ok(data)
}

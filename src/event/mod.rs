//! Domain event envelope.
//!
//! A `DomainEvent` bundles an event-type tag, immutable metadata and a typed
//! payload. On the wire it is a JSON object:
//!
//! ```text
//! {
//!   "event_type": "auth.user.registered",
//!   "metadata": {
//!     "event_id": "…", "timestamp": "2024-12-02T10:00:00.123456Z",
//!     "version": "1.0", "correlation_id": null, "causation_id": null,
//!     "source": "auth-service"
//!   },
//!   "payload": { … }
//! }
//! ```
//!
//! Publishers and subscribers move `DomainEvent<serde_json::Value>` (the
//! default type parameter). Producers build typed events and convert with
//! [`DomainEvent::to_untyped`]; handlers go the other way with
//! [`DomainEvent::decode`] or [`DomainEvent::payload_as`].

pub mod payloads;
pub mod types;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use types::{AuthEventType, SystemEventType};

/// Default schema version stamped on new events.
pub const DEFAULT_EVENT_VERSION: &str = "1.0";

/// Source used when the producer does not identify itself.
pub const UNKNOWN_SOURCE: &str = "unknown";

/// Result type for envelope encoding/decoding.
pub type Result<T> = std::result::Result<T, EventError>;

/// Errors raised while encoding or decoding an event envelope.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("Failed to decode event: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Event has no event_type")]
    MissingEventType,
}

fn new_event_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn default_version() -> String {
    DEFAULT_EVENT_VERSION.to_string()
}

fn default_source() -> String {
    UNKNOWN_SOURCE.to_string()
}

/// Metadata carried by every domain event.
///
/// Never mutated after construction; the `with_*` methods return a copy
/// with a single field replaced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    #[serde(default = "new_event_id")]
    event_id: String,
    #[serde(default = "Utc::now")]
    timestamp: DateTime<Utc>,
    #[serde(default = "default_version")]
    version: String,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    causation_id: Option<String>,
    #[serde(default = "default_source")]
    source: String,
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self {
            event_id: new_event_id(),
            timestamp: Utc::now(),
            version: default_version(),
            correlation_id: None,
            causation_id: None,
            source: default_source(),
        }
    }
}

impl EventMetadata {
    /// Fresh metadata (new id, current time) for the given producer.
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Copy with the correlation id replaced.
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            ..self.clone()
        }
    }

    /// Copy with the causation id replaced.
    pub fn with_causation_id(&self, causation_id: impl Into<String>) -> Self {
        Self {
            causation_id: Some(causation_id.into()),
            ..self.clone()
        }
    }

    /// Copy with the schema version replaced.
    pub fn with_version(&self, version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            ..self.clone()
        }
    }
}

/// An immutable record of something that happened in a domain.
///
/// `event_type` is namespaced as `<domain>.<entity>.<action>`, for example
/// `auth.user.registered`. The payload type defaults to
/// `serde_json::Value`, which is what travels through the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainEvent<P = Value> {
    event_type: String,
    #[serde(default)]
    metadata: EventMetadata,
    payload: P,
}

impl<P> DomainEvent<P> {
    /// Create an event with default metadata.
    pub fn new(event_type: impl Into<String>, payload: P) -> Self {
        Self::with_metadata(event_type, EventMetadata::default(), payload)
    }

    /// Create an event with explicit metadata.
    pub fn with_metadata(event_type: impl Into<String>, metadata: EventMetadata, payload: P) -> Self {
        Self {
            event_type: event_type.into(),
            metadata,
            payload,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Shorthand for `metadata().event_id()`.
    pub fn event_id(&self) -> &str {
        self.metadata.event_id()
    }

    /// Split into parts, consuming the event.
    pub fn into_parts(self) -> (String, EventMetadata, P) {
        (self.event_type, self.metadata, self.payload)
    }
}

impl<P: Clone> DomainEvent<P> {
    /// Copy of this event with a correlation id set; everything else,
    /// including `event_id` and `timestamp`, is unchanged.
    pub fn with_correlation_id(&self, correlation_id: impl Into<String>) -> Self {
        Self {
            metadata: self.metadata.with_correlation_id(correlation_id),
            ..self.clone()
        }
    }

    /// Copy of this event with a causation id set.
    pub fn with_causation_id(&self, causation_id: impl Into<String>) -> Self {
        Self {
            metadata: self.metadata.with_causation_id(causation_id),
            ..self.clone()
        }
    }

    /// Copy of this event marked as caused by `cause`.
    ///
    /// The causation id becomes `cause`'s event id. The correlation id is
    /// inherited from `cause` unless this event already carries one.
    pub fn caused_by<Q>(&self, cause: &DomainEvent<Q>) -> Self {
        let mut metadata = self.metadata.with_causation_id(cause.event_id());
        if metadata.correlation_id.is_none() {
            if let Some(correlation_id) = cause.metadata.correlation_id() {
                metadata = metadata.with_correlation_id(correlation_id);
            }
        }
        Self {
            metadata,
            ..self.clone()
        }
    }
}

impl<P: Serialize> DomainEvent<P> {
    /// Serialize to the JSON wire form.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(EventError::Encode)
    }

    /// Serialize to a transport-neutral JSON value.
    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(EventError::Encode)
    }

    /// Convert into the untyped form carried by the bus.
    pub fn to_untyped(&self) -> Result<DomainEvent> {
        let payload = serde_json::to_value(&self.payload).map_err(EventError::Encode)?;
        Ok(DomainEvent {
            event_type: self.event_type.clone(),
            metadata: self.metadata.clone(),
            payload,
        })
    }
}

impl<P: DeserializeOwned> DomainEvent<P> {
    /// Parse the JSON wire form.
    ///
    /// Fails on malformed JSON, a missing or empty `event_type`, or a
    /// payload that does not match `P`.
    pub fn from_json(json: &str) -> Result<Self> {
        let event: Self = serde_json::from_str(json).map_err(EventError::Decode)?;
        event.validated()
    }

    /// Parse from a JSON value.
    pub fn from_value(value: Value) -> Result<Self> {
        let event: Self = serde_json::from_value(value).map_err(EventError::Decode)?;
        event.validated()
    }

    fn validated(self) -> Result<Self> {
        if self.event_type.trim().is_empty() {
            return Err(EventError::MissingEventType);
        }
        Ok(self)
    }
}

impl DomainEvent {
    /// Decode the payload into a typed event, keeping type and metadata.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<DomainEvent<P>> {
        Ok(DomainEvent {
            event_type: self.event_type.clone(),
            metadata: self.metadata.clone(),
            payload: self.payload_as()?,
        })
    }

    /// Decode only the payload.
    pub fn payload_as<P: DeserializeOwned>(&self) -> Result<P> {
        P::deserialize(&self.payload).map_err(EventError::Decode)
    }
}

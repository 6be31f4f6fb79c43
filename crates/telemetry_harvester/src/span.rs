use crate::attributes::{vet_attributes, Attributes, VettedAttributes};
use crate::error::AttributeError;
use crate::timestamp::{duration_millis_f64, epoch_millis};
use serde::ser::{Serialize, SerializeMap, Serializer};
use std::time::{Duration, SystemTime};

/// Keys the span encoder writes itself; user attributes may not shadow them.
const RESERVED_KEYS: [&str; 4] = ["name", "parent.id", "duration.ms", "service.name"];

/// A single timed operation, as handed to
/// [`Harvester::record_span`](crate::Harvester::record_span).
#[derive(Debug, Clone, Default)]
pub struct Span {
    /// Unique span identifier
    pub id: String,
    /// Identifier of the trace this span belongs to
    pub trace_id: String,
    /// Operation name
    pub name: String,
    /// Parent span identifier (empty for a root span)
    pub parent_id: String,
    /// Start time; `None` is replaced with "now" when recorded
    pub timestamp: Option<SystemTime>,
    /// How long the operation took
    pub duration: Duration,
    /// Name of the service that produced the span
    pub service_name: String,
    /// Arbitrary attributes, vetted when recorded
    pub attributes: Attributes,
}

impl Span {
    /// Creates a span with the given identifiers and name.
    pub fn new(
        id: impl Into<String>,
        trace_id: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            trace_id: trace_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = parent_id.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn with_service_name(mut self, service_name: impl Into<String>) -> Self {
        self.service_name = service_name.into();
        self
    }

    /// Adds an attribute to the span
    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// A span that has passed validation and sits in the pending buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedSpan {
    pub id: String,
    pub trace_id: String,
    pub name: String,
    pub parent_id: String,
    pub timestamp: SystemTime,
    pub duration: Duration,
    pub service_name: String,
    pub attributes: VettedAttributes,
}

impl RecordedSpan {
    /// Vets `span` and stamps a missing timestamp with `now`.
    pub fn from_span(span: Span, now: SystemTime) -> (Self, Vec<AttributeError>) {
        let (mut attributes, errors) = vet_attributes(&span.attributes);
        attributes.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));

        let recorded = Self {
            id: span.id,
            trace_id: span.trace_id,
            name: span.name,
            parent_id: span.parent_id,
            timestamp: span.timestamp.unwrap_or(now),
            duration: span.duration,
            service_name: span.service_name,
            attributes,
        };
        (recorded, errors)
    }
}

struct SpanAttributes<'a>(&'a RecordedSpan);

impl Serialize for SpanAttributes<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let span = self.0;
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("name", &span.name)?;
        if !span.parent_id.is_empty() {
            map.serialize_entry("parent.id", &span.parent_id)?;
        }
        map.serialize_entry("duration.ms", &duration_millis_f64(span.duration))?;
        if !span.service_name.is_empty() {
            map.serialize_entry("service.name", &span.service_name)?;
        }
        for (k, v) in &span.attributes {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl Serialize for RecordedSpan {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("id", &self.id)?;
        map.serialize_entry("trace.id", &self.trace_id)?;
        map.serialize_entry("timestamp", &epoch_millis(self.timestamp))?;
        map.serialize_entry("attributes", &SpanAttributes(self))?;
        map.end()
    }
}

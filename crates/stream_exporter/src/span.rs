//! Inbound span model.
//!
//! These are the already-built, span-like records handed to the exporter by the
//! collection framework. The exporter never creates or mutates them; it only
//! reads them through the [`converter`](crate::converter).

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;

/// Attribute mapping carried by spans and resources.
pub type Attributes = HashMap<String, AttributeValue>;

/// Represents a single distributed tracing span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds)
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span attributes
    pub attributes: Attributes,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
}

/// Attribute value types for span metadata.
///
/// Serialized untagged so that values render as plain JSON scalars, arrays and
/// objects on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Array(Vec<AttributeValue>),
    Map(BTreeMap<String, AttributeValue>),
}

impl AttributeValue {
    /// Returns the string payload, if this is a string value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

/// Span execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error,
    /// Span status unknown
    Unset,
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Spans recorded under one resource, together with the resource attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceSpans {
    /// Resource-level attributes (e.g. `service.name`)
    pub resource: Attributes,
    /// Spans emitted by this resource
    pub spans: Vec<Span>,
}

fn unix_nanos_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or_default()
}

impl Span {
    /// Creates a new span with the given parameters
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        let now = unix_nanos_now();

        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now,
            end_time: now,
            name: name.into(),
            attributes: HashMap::new(),
            status: SpanStatus::Unset,
            kind,
        }
    }

    /// Marks the span as completed with the given status
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time = unix_nanos_now();
        self.status = status;
    }

    /// Adds an attribute to the span
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Builder-style variant of [`Span::set_attribute`].
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        self.set_attribute(key, value);
        self
    }

    /// Duration of the span in nanoseconds
    pub fn duration_nanos(&self) -> u64 {
        self.end_time.saturating_sub(self.start_time)
    }

    /// Trace id as 32 lowercase hex digits.
    pub fn trace_id_hex(&self) -> String {
        format!("{:032x}", self.trace_id)
    }

    /// Span id as 16 lowercase hex digits.
    pub fn span_id_hex(&self) -> String {
        format!("{:016x}", self.span_id)
    }

    /// Parent span id as hex, or `None` for root spans.
    pub fn parent_span_id_hex(&self) -> Option<String> {
        (self.parent_span_id != 0).then(|| format!("{:016x}", self.parent_span_id))
    }
}

impl ResourceSpans {
    /// Creates an empty group for the given resource attributes.
    pub fn new(resource: Attributes) -> Self {
        Self {
            resource,
            spans: Vec::new(),
        }
    }

    /// Adds a span to the group
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the group
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the group holds no spans
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_ids_are_fixed_width() {
        let span = Span::new(1, 2, 0, "op", SpanKind::Internal);
        assert_eq!(span.trace_id_hex(), "00000000000000000000000000000001");
        assert_eq!(span.span_id_hex(), "0000000000000002");
        assert_eq!(span.parent_span_id_hex(), None);

        let child = Span::new(1, 3, 0xabc, "child", SpanKind::Client);
        assert_eq!(child.parent_span_id_hex().as_deref(), Some("0000000000000abc"));
    }

    #[test]
    fn test_duration_saturates() {
        let mut span = Span::new(1, 1, 0, "op", SpanKind::Internal);
        span.start_time = 200;
        span.end_time = 100;
        assert_eq!(span.duration_nanos(), 0);

        span.end_time = 350;
        assert_eq!(span.duration_nanos(), 150);
    }

    #[test]
    fn test_attribute_value_serializes_untagged() {
        let mut map = BTreeMap::new();
        map.insert("role".to_string(), AttributeValue::from("user"));
        let value = AttributeValue::Array(vec![
            AttributeValue::Int(1),
            AttributeValue::Bool(true),
            AttributeValue::Map(map),
        ]);

        let json = serde_json::to_string(&value).unwrap();
        assert_eq!(json, r#"[1,true,{"role":"user"}]"#);
    }
}

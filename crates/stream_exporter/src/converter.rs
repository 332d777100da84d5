//! Span to event conversion.
//!
//! Conversion is total: every span yields exactly one [`Event`]. Missing or
//! mistyped attributes fall back to defaults instead of failing the batch.

use crate::event::{
    is_allowed_attribute, Event, EventStatus, ATTR_CONVERSATION_ID, ATTR_OPERATION_NAME,
    UNKNOWN_OPERATION,
};
use crate::span::{AttributeValue, Attributes, ResourceSpans, Span, SpanStatus};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

/// Converts spans into normalized events. Stateless.
#[derive(Debug, Default, Clone, Copy)]
pub struct EventConverter;

impl EventConverter {
    pub fn new() -> Self {
        Self
    }

    /// Converts every span of every resource group, preserving input order.
    pub fn convert_batch(&self, batch: &[ResourceSpans]) -> Vec<Event> {
        let total = batch.iter().map(ResourceSpans::len).sum();
        let mut events = Vec::with_capacity(total);
        for group in batch {
            for span in &group.spans {
                events.push(self.convert_span(span, &group.resource));
            }
        }
        events
    }

    /// Converts one span using `resource` as the fallback attribute context.
    pub fn convert_span(&self, span: &Span, resource: &Attributes) -> Event {
        let conversation_id = match lookup_str(span, resource, ATTR_CONVERSATION_ID) {
            Some(id) => id.to_owned(),
            None => span.trace_id_hex(),
        };

        let operation_type = lookup_str(span, resource, ATTR_OPERATION_NAME)
            .unwrap_or(UNKNOWN_OPERATION)
            .to_owned();

        let status = match span.status {
            SpanStatus::Error => EventStatus::Error,
            SpanStatus::Ok | SpanStatus::Unset => EventStatus::Ok,
        };

        Event {
            timestamp: Utc.timestamp_nanos(span.start_time as i64),
            trace_id: span.trace_id_hex(),
            span_id: span.span_id_hex(),
            parent_span_id: span.parent_span_id_hex(),
            conversation_id,
            operation_type,
            span_name: span.name.clone(),
            duration_ns: span.duration_nanos(),
            status,
            attributes: filter_attributes(&span.attributes, resource),
        }
    }
}

/// Span attributes shadow resource attributes with the same key.
fn lookup<'a>(span: &'a Span, resource: &'a Attributes, key: &str) -> Option<&'a AttributeValue> {
    span.attributes.get(key).or_else(|| resource.get(key))
}

/// A non-empty string attribute. Non-string values count as absent.
fn lookup_str<'a>(span: &'a Span, resource: &'a Attributes, key: &str) -> Option<&'a str> {
    lookup(span, resource, key)
        .and_then(AttributeValue::as_str)
        .filter(|s| !s.is_empty())
}

fn filter_attributes(span: &Attributes, resource: &Attributes) -> BTreeMap<String, AttributeValue> {
    let mut filtered = BTreeMap::new();
    for (key, value) in resource.iter().chain(span.iter()) {
        if is_allowed_attribute(key) {
            // span entries come last and overwrite resource entries
            filtered.insert(key.clone(), value.clone());
        }
    }
    filtered
}

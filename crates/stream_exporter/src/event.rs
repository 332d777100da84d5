//! Normalized agent event and its wire form.
//!
//! One [`Event`] is produced per inbound span. On the wire each event is a JSON
//! object carried as the body of a single stream record.

use crate::span::AttributeValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const ATTR_CONVERSATION_ID: &str = "gen_ai.conversation.id";
pub const ATTR_AGENT_ID: &str = "gen_ai.agent.id";
pub const ATTR_AGENT_NAME: &str = "gen_ai.agent.name";
pub const ATTR_OPERATION_NAME: &str = "gen_ai.operation.name";
pub const ATTR_TOOL_NAME: &str = "gen_ai.tool.name";
pub const ATTR_TOOL_CALL_ID: &str = "gen_ai.tool.call.id";
pub const ATTR_TOOL_CALL_ARGUMENTS: &str = "gen_ai.tool.call.arguments";
pub const ATTR_TOOL_CALL_RESULT: &str = "gen_ai.tool.call.result";
pub const ATTR_INPUT_MESSAGES: &str = "gen_ai.input.messages";
pub const ATTR_OUTPUT_MESSAGES: &str = "gen_ai.output.messages";
pub const ATTR_SYSTEM_INSTRUCTIONS: &str = "gen_ai.system_instructions";
pub const ATTR_PROVIDER_NAME: &str = "gen_ai.provider.name";
pub const ATTR_REQUEST_MODEL: &str = "gen_ai.request.model";
pub const ATTR_RESPONSE_MODEL: &str = "gen_ai.response.model";
pub const ATTR_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
pub const ATTR_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";

/// Attribute keys retained on an [`Event`]. Everything else is dropped during
/// conversion to bound record size.
pub const ALLOWED_ATTRIBUTES: [&str; 16] = [
    ATTR_CONVERSATION_ID,
    ATTR_AGENT_ID,
    ATTR_AGENT_NAME,
    ATTR_OPERATION_NAME,
    ATTR_TOOL_NAME,
    ATTR_TOOL_CALL_ID,
    ATTR_TOOL_CALL_ARGUMENTS,
    ATTR_TOOL_CALL_RESULT,
    ATTR_INPUT_MESSAGES,
    ATTR_OUTPUT_MESSAGES,
    ATTR_SYSTEM_INSTRUCTIONS,
    ATTR_PROVIDER_NAME,
    ATTR_REQUEST_MODEL,
    ATTR_RESPONSE_MODEL,
    ATTR_INPUT_TOKENS,
    ATTR_OUTPUT_TOKENS,
];

/// Operation kind recorded when a span carries no `gen_ai.operation.name`.
pub const UNKNOWN_OPERATION: &str = "unknown";

/// Outcome of the operation an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Ok,
    Error,
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => f.write_str("ok"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// A normalized agent event, one per span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Span start time
    pub timestamp: DateTime<Utc>,
    /// Trace id (32 hex digits)
    pub trace_id: String,
    /// Span id (16 hex digits)
    pub span_id: String,
    /// Parent span id, absent for root spans
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    /// Conversation the event belongs to; never empty after conversion
    pub conversation_id: String,
    /// e.g. `invoke_agent`, `execute_tool`, `chat`, `unknown`
    pub operation_type: String,
    /// Span display name
    pub span_name: String,
    /// Span duration in nanoseconds
    pub duration_ns: u64,
    pub status: EventStatus,
    /// Allow-listed attributes, sorted by key
    pub attributes: BTreeMap<String, AttributeValue>,
}

impl Event {
    /// Serializes the event to the JSON body of one stream record.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses an event from a record body.
    pub fn from_json(body: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(body)
    }
}

/// Returns `true` if `key` survives attribute filtering.
pub fn is_allowed_attribute(key: &str) -> bool {
    ALLOWED_ATTRIBUTES.contains(&key)
}

//! Stream naming.
//!
//! Every conversation maps to exactly one stream. The mapping is a pure
//! function of the configured prefix and the conversation id.

/// Conversation id used when an event carries none.
pub const DEFAULT_PARTITION: &str = "default";

/// Derives stream names from conversation ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamNamer {
    prefix: String,
}

impl StreamNamer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns `<prefix><conversation_id>`, substituting [`DEFAULT_PARTITION`]
    /// for an empty id.
    pub fn stream_name(&self, conversation_id: &str) -> String {
        let id = if conversation_id.is_empty() {
            DEFAULT_PARTITION
        } else {
            conversation_id
        };
        let mut name = String::with_capacity(self.prefix.len() + id.len());
        name.push_str(&self.prefix);
        name.push_str(id);
        name
    }
}

//! Stream events.
//!
//! Every frame a sandbox emits is decoded into a [`StreamEvent`]. The `type`
//! field is free-form; the container decides its vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event types Kiln itself emits or interprets.
pub mod kinds {
    /// Synthetic: the sandbox is ready and the stream is about to start.
    pub const CONNECTED: &str = "connected";
    /// Synthetic or remote: the task failed. Always the last event of a stream.
    pub const ERROR: &str = "error";
    /// Synthetic: the caller stopped consuming the stream.
    pub const INTERRUPTED: &str = "interrupted";
    /// Synthetic: a Version changed status.
    pub const STATUS: &str = "status";
    /// Fallback type for payloads that were not JSON and had no `event:` line.
    pub const RAW: &str = "raw";
    /// Executor: incremental text output.
    pub const TEXT: &str = "text";
    /// Executor: final result of the task.
    pub const RESULT: &str = "result";
}

/// One event of a sandbox stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEvent {
    #[serde(rename = "type", default)]
    pub event_type: String,

    #[serde(default)]
    pub content: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl StreamEvent {
    pub fn new(event_type: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            event_type: event_type.into(),
            content: content.into(),
            tool_name: None,
            tool_input: None,
            metadata: None,
        }
    }

    /// Terminal error event with a human-readable message.
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(kinds::ERROR, message.into())
    }

    /// Emitted once when the consumer abandons the stream.
    pub fn interrupted() -> Self {
        Self::new(kinds::INTERRUPTED, "stream interrupted by caller")
    }

    pub fn connected(metadata: Value) -> Self {
        Self::new(kinds::CONNECTED, Value::Null).with_metadata(metadata)
    }

    /// Version status change, `status` is the new state.
    pub fn status(version_id: &str, status: &str, message: Option<&str>) -> Self {
        let mut meta = Map::new();
        meta.insert("version_id".into(), Value::String(version_id.to_string()));
        meta.insert("status".into(), Value::String(status.to_string()));
        let content = message.map(|m| Value::String(m.to_string())).unwrap_or(Value::Null);
        Self::new(kinds::STATUS, content).with_metadata(Value::Object(meta))
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn is(&self, event_type: &str) -> bool {
        self.event_type == event_type
    }

    pub fn is_error(&self) -> bool {
        self.is(kinds::ERROR)
    }

    pub fn is_interrupted(&self) -> bool {
        self.is(kinds::INTERRUPTED)
    }

    /// `content` as text when it is a JSON string.
    pub fn content_text(&self) -> Option<&str> {
        self.content.as_str()
    }

    /// Decode a JSON payload from an SSE frame.
    ///
    /// Objects map onto the event fields; a missing `type` is taken from the
    /// frame's `event:` line. Anything that is not a JSON object degrades to
    /// `{type: event_type or "raw", content}` instead of failing.
    pub fn from_frame(event_type: Option<&str>, data: &str) -> Self {
        let fallback_type = event_type.filter(|t| !t.is_empty()).unwrap_or(kinds::RAW);

        match serde_json::from_str::<Value>(data) {
            Ok(Value::Object(map)) => {
                let mut event: StreamEvent = match serde_json::from_value(Value::Object(map)) {
                    Ok(event) => event,
                    Err(_) => return Self::new(fallback_type, data.to_string()),
                };
                if event.event_type.is_empty() {
                    event.event_type = fallback_type.to_string();
                }
                event
            }
            Ok(other) => Self::new(fallback_type, other),
            Err(_) => Self::new(fallback_type, data.to_string()),
        }
    }
}

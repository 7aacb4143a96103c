//! Core data model for the agent loop
//!
//! Content blocks come out of the tagged-content parser, history entries are
//! what the orchestrator appends for the session. Everything serializes with a
//! `type` tag so transcripts can be persisted as JSON.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Tool parameters as parsed from the `<arguments>` payload
pub type ToolParams = Map<String, Value>;

/// A parsed piece of an assistant response, in document order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text outside any tool block
    Text {
        content: String,
        /// True when the block was cut off by the end of input
        partial: bool,
    },

    /// A (possibly incomplete) tool invocation
    ToolUse {
        name: String,
        params: ToolParams,
        partial: bool,
        /// Assigned by the orchestrator once the block is selected for execution
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },
}

impl ContentBlock {
    pub fn text(content: impl Into<String>, partial: bool) -> Self {
        ContentBlock::Text {
            content: content.into(),
            partial,
        }
    }

    pub fn is_partial(&self) -> bool {
        match self {
            ContentBlock::Text { partial, .. } | ContentBlock::ToolUse { partial, .. } => *partial,
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse { .. })
    }

    /// Text content, if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            ContentBlock::Text { content, .. } => Some(content),
            ContentBlock::ToolUse { .. } => None,
        }
    }
}

/// A tool invocation selected for execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUse {
    pub name: String,
    pub params: ToolParams,
    /// Unique per invocation; joins the call with its result
    pub call_id: String,
}

impl ToolUse {
    /// Create a tool use with a freshly generated call id
    pub fn new(name: impl Into<String>, params: ToolParams) -> Self {
        Self {
            name: name.into(),
            params,
            call_id: new_call_id(),
        }
    }

    /// Parameters as a JSON value
    pub fn params_value(&self) -> Value {
        Value::Object(self.params.clone())
    }

    /// Parser-level error recorded in the params, if any
    pub fn parse_error(&self) -> Option<&str> {
        self.params.get("_error").and_then(|v| v.as_str())
    }

    /// History block recording this call
    pub fn to_block(&self) -> ContentBlock {
        ContentBlock::ToolUse {
            name: self.name.clone(),
            params: self.params.clone(),
            partial: false,
            call_id: Some(self.call_id.clone()),
        }
    }
}

/// Outcome of an executed or denied tool call
///
/// Created once per call and never modified afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseResult {
    pub tool_use: ToolUse,
    pub result: Value,
    pub approved: bool,
    pub is_error: bool,
}

impl ToolUseResult {
    /// Text fed back to the model for this result
    pub fn content(&self) -> String {
        result_to_text(&self.result)
    }

    /// History entry for this result
    pub fn to_history_entry(&self) -> HistoryEntry {
        HistoryEntry::ToolResult {
            call_id: self.tool_use.call_id.clone(),
            content: self.content(),
            is_error: self.is_error,
        }
    }
}

/// One entry of the session transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEntry {
    User {
        content: String,
    },
    Assistant {
        content: Vec<ContentBlock>,
    },
    ToolResult {
        call_id: String,
        content: String,
        is_error: bool,
    },
}

impl HistoryEntry {
    pub fn user(content: impl Into<String>) -> Self {
        HistoryEntry::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        HistoryEntry::Assistant {
            content: vec![ContentBlock::text(content, false)],
        }
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, HistoryEntry::ToolResult { .. })
    }
}

/// Token counters reported by the transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl TokenUsage {
    pub fn new(input_tokens: usize, output_tokens: usize) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> usize {
        self.input_tokens + self.output_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Generate a unique call id (call-<uuid>)
pub fn new_call_id() -> String {
    format!("call-{}", uuid::Uuid::new_v4())
}

/// Render a tool result value as the text the model sees
///
/// Strings pass through, `{content: "..."}` shaped results use the content,
/// anything else is compact JSON.
pub fn result_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("content").and_then(|v| v.as_str()) {
            Some(content) => content.to_string(),
            None => value.to_string(),
        },
        other => other.to_string(),
    }
}

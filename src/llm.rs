//! Model transport contract
//!
//! Provider wiring lives outside this crate. A transport takes a
//! [`ModelRequest`] and returns a channel of [`StreamEvent`]s; the orchestrator
//! consumes it chunk by chunk.

use crate::error::TransportError;
use crate::types::{HistoryEntry, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Tool definition advertised to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value, // JSON Schema
}

/// One model request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub system_prompt: String,
    pub history: Vec<HistoryEntry>,
    pub tools: Vec<ToolDefinition>,
}

/// Streaming events from a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum StreamEvent {
    /// Visible response text
    TextDelta { delta: String },
    /// Thinking output; never parsed for tool syntax
    Reasoning { delta: String },
    /// End of the response with this turn's usage
    Finish { usage: TokenUsage },
    /// Provider failure mid-stream
    Error { error: TransportError },
}

impl StreamEvent {
    pub fn text(delta: impl Into<String>) -> Self {
        StreamEvent::TextDelta {
            delta: delta.into(),
        }
    }

    pub fn reasoning(delta: impl Into<String>) -> Self {
        StreamEvent::Reasoning {
            delta: delta.into(),
        }
    }
}

/// Chat-completion transport
#[async_trait]
pub trait ModelTransport: Send + Sync {
    /// Start streaming a response
    ///
    /// Failing to open the stream is reported the same way as a mid-stream
    /// [`StreamEvent::Error`].
    async fn stream(
        &self,
        request: &ModelRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, TransportError>;
}

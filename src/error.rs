//! Error types for a3s-agent-loop

use crate::types::{HistoryEntry, TokenUsage};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by the model transport
///
/// Carries whatever the provider told us. The loop never retries on its own;
/// retry policy belongs to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
#[serde(rename_all = "camelCase")]
pub struct TransportError {
    /// Human-readable failure description
    pub message: String,
    /// HTTP status code, when the provider returned one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Provider-specific error code (e.g. "overloaded_error")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// Terminal conditions of an agent run
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AgentError {
    /// The user or the approval policy refused a tool call
    #[error("Tool '{tool_name}' was denied (call {call_id})")]
    ToolDenied { call_id: String, tool_name: String },

    /// The runaway-loop guard fired
    #[error("Max turns ({max_turns}) exceeded")]
    MaxTurnsExceeded { max_turns: usize },

    /// The model transport failed while streaming
    #[error("API error: {0}")]
    Api(TransportError),

    /// The caller aborted the run
    #[error("Agent run canceled")]
    Canceled,
}

impl AgentError {
    /// Stable machine-readable code for this error
    pub fn code(&self) -> &'static str {
        match self {
            AgentError::ToolDenied { .. } => "tool_denied",
            AgentError::MaxTurnsExceeded { .. } => "max_turns_exceeded",
            AgentError::Api(_) => "api_error",
            AgentError::Canceled => "canceled",
        }
    }
}

/// A terminated agent run together with everything accumulated so far
///
/// Callers can resume or audit from `history` and `usage`.
#[derive(Debug, Clone, Error)]
#[error("{error}")]
pub struct AgentFailure {
    #[source]
    pub error: AgentError,
    /// Snapshot of the session history at termination
    pub history: Vec<HistoryEntry>,
    /// Token usage accumulated across all completed turns
    pub usage: TokenUsage,
    /// Number of turns attempted, including the failing one
    pub turns: usize,
}

impl AgentFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }
}

/// Errors raised by the approval gate
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApprovalError {
    /// Too many approvals are already waiting
    #[error("Pending approval queue is full ({capacity} entries)")]
    QueueFull { capacity: usize },

    /// A pending approval with this call id already exists
    #[error("Approval already pending for call '{0}'")]
    Duplicate(String),

    /// The gate went away before answering
    #[error("Approval channel closed for call '{0}'")]
    ChannelClosed(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Result type alias for agent runs
pub type Result<T> = std::result::Result<T, AgentFailure>;

//! Telemetry
//!
//! Span names, attribute keys and small helpers built on `tracing` alone.
//! Exporters are the embedding application's business; [`init_tracing`] is a
//! convenience for binaries and tests.
//!
//! ## Span Hierarchy
//!
//! ```text
//! a3s.agent.execute
//!   +-- a3s.agent.turn (repeated)
//!   |   +-- a3s.llm.completion
//!   |   +-- a3s.approval.request
//!   |   +-- a3s.tool.execute
//! ```

use crate::types::TokenUsage;
use std::time::Duration;

// ============================================================================
// Constants
// ============================================================================

pub const SPAN_AGENT_EXECUTE: &str = "a3s.agent.execute";
pub const SPAN_AGENT_TURN: &str = "a3s.agent.turn";
pub const SPAN_LLM_COMPLETION: &str = "a3s.llm.completion";
pub const SPAN_TOOL_EXECUTE: &str = "a3s.tool.execute";
pub const SPAN_APPROVAL_REQUEST: &str = "a3s.approval.request";

pub const ATTR_TOOL_CALLS_COUNT: &str = "a3s.agent.tool_calls_count";

pub const ATTR_LLM_PROMPT_TOKENS: &str = "a3s.llm.prompt_tokens";
pub const ATTR_LLM_COMPLETION_TOKENS: &str = "a3s.llm.completion_tokens";
pub const ATTR_LLM_TOTAL_TOKENS: &str = "a3s.llm.total_tokens";

pub const ATTR_TOOL_SUCCESS: &str = "a3s.tool.success";
pub const ATTR_TOOL_DURATION_MS: &str = "a3s.tool.duration_ms";

// ============================================================================
// Span Helpers
// ============================================================================

/// Record LLM token usage on the current span
pub fn record_llm_usage(usage: &TokenUsage) {
    let span = tracing::Span::current();
    span.record(ATTR_LLM_PROMPT_TOKENS, usage.input_tokens as i64);
    span.record(ATTR_LLM_COMPLETION_TOKENS, usage.output_tokens as i64);
    span.record(ATTR_LLM_TOTAL_TOKENS, usage.total() as i64);
}

/// Record tool execution result on the current span
pub fn record_tool_result(success: bool, duration: Duration) {
    let span = tracing::Span::current();
    span.record(ATTR_TOOL_SUCCESS, success);
    span.record(ATTR_TOOL_DURATION_MS, duration.as_millis() as i64);
}

// ============================================================================
// Subscriber
// ============================================================================

/// Install a global fmt subscriber
///
/// `RUST_LOG` wins over `default_level`. Returns an error if a global
/// subscriber is already set.
pub fn init_tracing(
    default_level: &str,
    json: bool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    if json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    }
}

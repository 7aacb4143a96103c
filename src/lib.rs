//! # a3s-agent-loop
//!
//! Turn loop, tagged tool-use protocol, and approval gate for A3S coding agents.
//!
//! ## Overview
//!
//! The model streams plain text. Tool calls are embedded in that text with a
//! small tag protocol:
//!
//! ```text
//! <use_tool>
//!   <tool_name>read</tool_name>
//!   <arguments>{"path": "src/main.rs"}</arguments>
//! </use_tool>
//! ```
//!
//! [`AgentLoop`] streams each response through the [`parser`], keeps at most
//! one tool call per turn, asks the [`ApprovalGate`] whether the call may run,
//! invokes it through a [`ToolExecutor`] and feeds the result back until the
//! model answers without a tool call.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_agent_loop::{AgentLoop, History, ModelTransport, ToolRegistry};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example(transport: Arc<dyn ModelTransport>) -> anyhow::Result<()> {
//! let agent = AgentLoop::builder()
//!     .transport(transport)
//!     .tools(Arc::new(ToolRegistry::new()))
//!     .build()?;
//!
//! let mut history = History::new();
//! let result = agent
//!     .execute(&mut history, "Summarize README.md", None, &CancellationToken::new())
//!     .await?;
//! println!("{}", result.text);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **parser**: re-derivable parse of a growing response into text/tool blocks
//! - **approval**: mode rules, approval memory, pending escalations
//! - **tools**: tool contracts and the bundled registry
//! - **llm**: model transport contract
//! - **agent**: the turn orchestrator

pub mod agent;
pub mod approval;
pub mod config;
pub mod error;
pub mod history;
pub mod llm;
pub mod parser;
pub mod prompts;
pub mod telemetry;
pub mod tools;
pub mod types;

// Re-export core types
pub use agent::{AgentEvent, AgentLoop, AgentLoopBuilder, AgentResult};
pub use approval::{
    ApprovalEvent, ApprovalGate, ApprovalMemory, ApprovalMode, Authorization, Remember, RiskLevel,
    ToolCategory,
};
pub use config::{AgentConfig, ApprovalConfig};
pub use error::{AgentError, AgentFailure, ApprovalError, ConfigError, Result, TransportError};
pub use history::{Compactor, History};
pub use llm::{ModelRequest, ModelTransport, StreamEvent, ToolDefinition};
pub use tools::{Tool, ToolContext, ToolDescriptor, ToolExecutor, ToolOutput, ToolRegistry};
pub use types::{ContentBlock, HistoryEntry, TokenUsage, ToolParams, ToolUse, ToolUseResult};

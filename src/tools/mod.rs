//! Tool contracts
//!
//! The orchestrator only sees [`ToolExecutor`]: a name-keyed catalog that can
//! describe its tools and invoke them with a JSON argument string. The
//! bundled [`ToolRegistry`] implements it over boxed [`Tool`] objects.

mod registry;

pub use registry::{validate_args, ToolRegistry};

use crate::approval::{ApprovalMode, RiskLevel, ToolCategory};
use crate::llm::ToolDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Tool execution context
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Workspace root directory
    pub workspace: PathBuf,
    pub session_id: Option<String>,
}

impl ToolContext {
    pub fn new(workspace: PathBuf) -> Self {
        // Canonicalize so symlinked workspaces compare equal
        let canonical_workspace = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.clone());
        Self {
            workspace: canonical_workspace,
            session_id: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }
}

/// Tool execution output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolOutput {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: message.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// JSON shape handed back to the orchestrator
    pub fn to_value(&self) -> Value {
        let mut value = serde_json::json!({
            "success": self.success,
            "content": self.content,
        });
        if let Some(metadata) = &self.metadata {
            value["metadata"] = metadata.clone();
        }
        value
    }
}

/// Everything the approval gate and the prompt need to know about a tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object
    pub parameters: Value,
    pub category: ToolCategory,
    pub risk_level: RiskLevel,
}

impl ToolDescriptor {
    pub fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// A single executable tool
///
/// Implement this trait and register the tool with a [`ToolRegistry`].
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (must be unique within registry)
    fn name(&self) -> &str;

    /// Human-readable description for the model
    fn description(&self) -> &str;

    /// JSON Schema for tool parameters
    fn parameters(&self) -> Value;

    fn category(&self) -> ToolCategory;

    fn risk_level(&self) -> RiskLevel {
        match self.category() {
            ToolCategory::Read => RiskLevel::Low,
            ToolCategory::Write | ToolCategory::Network => RiskLevel::Medium,
            ToolCategory::Command => RiskLevel::High,
        }
    }

    /// Custom approval rule; `None` defers to the mode/category default
    fn needs_approval(&self, _params: &Value, _mode: ApprovalMode) -> Option<bool> {
        None
    }

    async fn execute(&self, args: &Value, ctx: &ToolContext) -> Result<ToolOutput>;
}

/// Name-keyed tool catalog consumed by the orchestrator
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Metadata for a tool, or `None` if no such tool exists
    fn descriptor(&self, name: &str) -> Option<ToolDescriptor>;

    /// All tools, in a stable order
    fn descriptors(&self) -> Vec<ToolDescriptor>;

    /// Catalog for the model request
    fn definitions(&self) -> Vec<ToolDefinition> {
        self.descriptors()
            .iter()
            .map(ToolDescriptor::to_definition)
            .collect()
    }

    /// Tool-specific approval override
    fn needs_approval(&self, _name: &str, _params: &Value, _mode: ApprovalMode) -> Option<bool> {
        None
    }

    /// Run a tool
    ///
    /// Any JSON value is a valid result. `Err` and `{"success": false}`
    /// results are both recorded as tool errors.
    async fn invoke(&self, name: &str, args_json: &str, ctx: &ToolContext) -> Result<Value>;
}

/// Whether an invocation result should be recorded as an error
pub fn is_error_result(result: &Value) -> bool {
    result.get("success").and_then(Value::as_bool) == Some(false)
}

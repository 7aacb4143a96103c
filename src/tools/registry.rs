//! Tool Registry
//!
//! Thread-safe name -> tool map implementing [`ToolExecutor`]. Arguments are
//! checked against the tool's declared schema before the tool runs.

use super::{Tool, ToolContext, ToolDescriptor, ToolExecutor, ToolOutput};
use crate::approval::ApprovalMode;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Instant;
use tracing::Instrument;

/// Tool registry for managing all available tools
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<dyn Tool>>> {
        self.tools.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registering tool: {}", name);
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, tool);
    }

    /// Builder-style registration
    pub fn with_tool(self, tool: Arc<dyn Tool>) -> Self {
        self.register(tool);
        self
    }

    /// Returns true if the tool was found and removed
    pub fn unregister(&self, name: &str) -> bool {
        tracing::debug!("Unregistering tool: {}", name);
        self.tools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Registered tool names, sorted
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn run(&self, tool: Arc<dyn Tool>, args: Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let span = tracing::info_span!(
            "a3s.tool.execute",
            "a3s.tool.name" = tool.name(),
            "a3s.tool.success" = tracing::field::Empty,
            "a3s.tool.duration_ms" = tracing::field::Empty,
        );
        async move {
            let start = Instant::now();
            let output = tool.execute(&args, ctx).await;
            let success = matches!(&output, Ok(out) if out.success);
            crate::telemetry::record_tool_result(success, start.elapsed());
            output
        }
        .instrument(span)
        .await
    }
}

fn describe(tool: &dyn Tool) -> ToolDescriptor {
    ToolDescriptor {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters(),
        category: tool.category(),
        risk_level: tool.risk_level(),
    }
}

#[async_trait]
impl ToolExecutor for ToolRegistry {
    fn descriptor(&self, name: &str) -> Option<ToolDescriptor> {
        self.get(name).map(|tool| describe(tool.as_ref()))
    }

    fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut all: Vec<ToolDescriptor> =
            self.read().values().map(|tool| describe(tool.as_ref())).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    fn needs_approval(&self, name: &str, params: &Value, mode: ApprovalMode) -> Option<bool> {
        self.get(name)?.needs_approval(params, mode)
    }

    async fn invoke(&self, name: &str, args_json: &str, ctx: &ToolContext) -> Result<Value> {
        let Some(tool) = self.get(name) else {
            return Ok(ToolOutput::error(format!("Unknown tool: {}", name)).to_value());
        };

        let args: Value = if args_json.trim().is_empty() {
            Value::Object(Default::default())
        } else {
            match serde_json::from_str(args_json) {
                Ok(v) => v,
                Err(e) => {
                    return Ok(
                        ToolOutput::error(format!("Invalid arguments JSON: {}", e)).to_value()
                    )
                }
            }
        };

        if let Err(problem) = validate_args(&tool.parameters(), &args) {
            tracing::debug!(tool_name = name, problem = problem.as_str(), "Argument validation failed");
            return Ok(
                ToolOutput::error(format!("Invalid arguments for {}: {}", name, problem))
                    .to_value(),
            );
        }

        let output = self.run(tool, args, ctx).await?;
        Ok(output.to_value())
    }
}

/// Shallow JSON-schema check: object shape, required keys, top-level types
pub fn validate_args(schema: &Value, args: &Value) -> std::result::Result<(), String> {
    let Some(obj) = args.as_object() else {
        return Err("arguments must be a JSON object".to_string());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for key in required.iter().filter_map(Value::as_str) {
            if !obj.contains_key(key) {
                return Err(format!("missing required parameter '{}'", key));
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (key, value) in obj {
        let Some(expected) = properties.get(key).and_then(|p| p.get("type")) else {
            continue;
        };
        let matches = match expected {
            Value::String(ty) => type_matches(ty, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|ty| type_matches(ty, value)),
            _ => true,
        };
        if !matches {
            return Err(format!(
                "parameter '{}' should be of type {}",
                key,
                expected_label(expected)
            ));
        }
    }
    Ok(())
}

fn type_matches(ty: &str, value: &Value) -> bool {
    match ty {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

fn expected_label(expected: &Value) -> String {
    match expected {
        Value::String(s) => s.clone(),
        Value::Array(types) => types
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" | "),
        other => other.to_string(),
    }
}

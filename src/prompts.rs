// Prompt Registry
//
// Every model-facing prompt is a compile-time `include_str!` so the full
// instruction set is visible in one place.
//
// Directory layout:
//   prompts/
//   ├── default_system_prompt.md : Base agent instructions
//   └── tool_use_protocol.md     : Tag protocol + tool catalog. Placeholder: `{tools}`

use crate::llm::ToolDefinition;

/// Base agent instructions
pub const DEFAULT_SYSTEM_PROMPT: &str = include_str!("../prompts/default_system_prompt.md");

/// Wire protocol instructions. Placeholder: `{tools}`
pub const TOOL_USE_PROTOCOL: &str = include_str!("../prompts/tool_use_protocol.md");

/// Simple `{key}` substitution
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{}}}", key), value);
    }
    result
}

/// Render the tool catalog as markdown sections with the JSON schema inline
pub fn render_tool_catalog(tools: &[ToolDefinition]) -> String {
    if tools.is_empty() {
        return "(no tools available)".to_string();
    }
    tools
        .iter()
        .map(|tool| {
            let schema = serde_json::to_string_pretty(&tool.parameters)
                .unwrap_or_else(|_| tool.parameters.to_string());
            format!(
                "## {}\n{}\nParameters:\n```json\n{}\n```",
                tool.name, tool.description, schema
            )
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Base prompt (or `base` override) followed by the protocol and catalog
pub fn build_system_prompt(base: Option<&str>, tools: &[ToolDefinition]) -> String {
    let base = base.unwrap_or(DEFAULT_SYSTEM_PROMPT).trim_end();
    let catalog = render_tool_catalog(tools);
    let protocol = render(TOOL_USE_PROTOCOL, &[("tools", catalog.as_str())]);
    format!("{}\n\n{}", base, protocol.trim_end())
}

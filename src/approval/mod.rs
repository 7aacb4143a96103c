//! Approval policy for tool execution
//!
//! Decides, per tool invocation, whether the call may run without asking.
//! Resolution order (first match wins):
//! 1. Approval memory (`proceed_always_tool`, `proceed_always`, `proceed_once`)
//! 2. The tool's own `needs_approval` predicate
//! 3. The session mode applied to the tool category
//! 4. Escalation to an external confirmation channel (see [`ApprovalGate`])

mod gate;

pub use gate::{
    ApprovalDecision, ApprovalEvent, ApprovalGate, ApprovalOutcome, ApprovalSource, Authorization,
    PendingApproval, PendingSummary,
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Default capacity of each remembered-decision set
pub const DEFAULT_MEMORY_CAPACITY: usize = 256;

/// What a tool touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    /// Reads files or state (read, glob, grep)
    Read,
    /// Modifies the workspace (write, edit)
    Write,
    /// Runs arbitrary commands (bash)
    Command,
    /// Reaches the network (fetch)
    Network,
}

/// Declared risk of a tool, surfaced to whoever confirms
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

/// Session-wide approval policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApprovalMode {
    /// Ask for everything except reads
    #[default]
    Default,
    /// Edits are fine, commands still need confirmation
    AutoEdit,
    /// Never ask
    Yolo,
}

impl ApprovalMode {
    /// Mode-based default rule for a category
    pub fn requires_approval(&self, category: ToolCategory) -> bool {
        match self {
            ApprovalMode::Yolo => false,
            ApprovalMode::AutoEdit => category == ToolCategory::Command,
            ApprovalMode::Default => category != ToolCategory::Read,
        }
    }
}

/// How long a granted approval is remembered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Remember {
    /// Only this call
    #[default]
    Once,
    /// This tool with exactly these parameters, for the session
    Always,
    /// This tool with any parameters, for the session
    AlwaysTool,
}

/// Which memory set produced an approval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryHit {
    AlwaysTool,
    Always,
    Once,
}

/// Canonical memory key: `tool_name:<sorted-key JSON>`
pub fn approval_key(tool_name: &str, params: &Value) -> String {
    format!("{}:{}", tool_name, canonical_json(params))
}

/// Compact JSON with object keys sorted at every level
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(&map[key], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// Insertion-ordered string set with FIFO eviction
#[derive(Debug, Clone)]
struct BoundedSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedSet {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            members: HashSet::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert(&mut self, key: String) {
        if self.members.contains(&key) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.members.remove(&evicted);
            }
        }
        self.members.insert(key.clone());
        self.order.push_back(key);
    }

    fn contains(&self, key: &str) -> bool {
        self.members.contains(key)
    }

    fn remove(&mut self, key: &str) -> bool {
        if self.members.remove(key) {
            self.order.retain(|k| k != key);
            true
        } else {
            false
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

/// Session-scoped record of granted confirmations
///
/// `proceed_once` entries are consumed on first match; the other two sets
/// persist until the session ends or [`ApprovalMemory::clear`] is called.
#[derive(Debug, Clone)]
pub struct ApprovalMemory {
    proceed_once: BoundedSet,
    proceed_always: BoundedSet,
    proceed_always_tool: BoundedSet,
}

impl Default for ApprovalMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}

impl ApprovalMemory {
    pub fn new(capacity: usize) -> Self {
        Self {
            proceed_once: BoundedSet::new(capacity),
            proceed_always: BoundedSet::new(capacity),
            proceed_always_tool: BoundedSet::new(capacity),
        }
    }

    /// Record a decision for a tool call
    pub fn remember(&mut self, tool_name: &str, params: &Value, remember: Remember) {
        match remember {
            Remember::Once => self.proceed_once.insert(approval_key(tool_name, params)),
            Remember::Always => self.proceed_always.insert(approval_key(tool_name, params)),
            Remember::AlwaysTool => self.proceed_always_tool.insert(tool_name.to_string()),
        }
    }

    /// Look up (and consume, for one-shot entries) a remembered approval
    pub fn check(&mut self, tool_name: &str, params: &Value) -> Option<MemoryHit> {
        if self.proceed_always_tool.contains(tool_name) {
            return Some(MemoryHit::AlwaysTool);
        }
        let key = approval_key(tool_name, params);
        if self.proceed_always.contains(&key) {
            return Some(MemoryHit::Always);
        }
        if self.proceed_once.remove(&key) {
            return Some(MemoryHit::Once);
        }
        None
    }

    /// Number of remembered entries across all sets
    pub fn len(&self) -> usize {
        self.proceed_once.len() + self.proceed_always.len() + self.proceed_always_tool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.proceed_once.clear();
        self.proceed_always.clear();
        self.proceed_always_tool.clear();
    }
}

//! Configuration for the agent loop
//!
//! Built programmatically via `Default` + struct update, or loaded from a
//! camelCase JSON file with [`AgentConfig::from_file`]. Every field has a
//! default, so a config file only needs the keys it changes.

use crate::approval::{ApprovalMode, DEFAULT_MEMORY_CAPACITY};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default turn budget
pub const DEFAULT_MAX_TURNS: usize = 50;

/// Default capacity of the pending-approval table
pub const DEFAULT_MAX_PENDING: usize = 100;

/// Pending approvals older than this are auto-denied (30 minutes)
pub const DEFAULT_PENDING_TIMEOUT_SECS: u64 = 30 * 60;

/// Stale-approval sweep cadence (5 minutes)
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 5 * 60;

/// Default capacity of the agent event channel
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

fn default_max_turns() -> usize {
    DEFAULT_MAX_TURNS
}

fn default_memory_capacity() -> usize {
    DEFAULT_MEMORY_CAPACITY
}

fn default_max_pending() -> usize {
    DEFAULT_MAX_PENDING
}

fn default_pending_timeout_secs() -> u64 {
    DEFAULT_PENDING_TIMEOUT_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_event_buffer_size() -> usize {
    DEFAULT_EVENT_BUFFER_SIZE
}

/// Approval gate settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalConfig {
    #[serde(default)]
    pub mode: ApprovalMode,
    /// Capacity of each remembered-decision set
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    #[serde(default = "default_pending_timeout_secs")]
    pub pending_timeout_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            mode: ApprovalMode::default(),
            memory_capacity: DEFAULT_MEMORY_CAPACITY,
            max_pending: DEFAULT_MAX_PENDING,
            pending_timeout_secs: DEFAULT_PENDING_TIMEOUT_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

/// Agent loop settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// Turns allowed before the run fails with `max_turns_exceeded`
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Replaces the built-in base system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,

    /// Input-token count that triggers compaction before the next turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compaction_threshold: Option<usize>,

    #[serde(default = "default_event_buffer_size")]
    pub event_buffer_size: usize,

    #[serde(default)]
    pub approval: ApprovalConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: DEFAULT_MAX_TURNS,
            system_prompt: None,
            compaction_threshold: None,
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            approval: ApprovalConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;

        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values the loop cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_turns == 0 {
            return Err(ConfigError::Invalid("maxTurns must be at least 1".to_string()));
        }
        if self.event_buffer_size == 0 {
            return Err(ConfigError::Invalid(
                "eventBufferSize must be at least 1".to_string(),
            ));
        }
        if self.approval.max_pending == 0 {
            return Err(ConfigError::Invalid(
                "approval.maxPending must be at least 1".to_string(),
            ));
        }
        if self.approval.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "approval.sweepIntervalSecs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.max_turns, 50);
        assert_eq!(config.compaction_threshold, None);
        assert_eq!(config.event_buffer_size, 100);
        assert_eq!(config.approval.mode, ApprovalMode::Default);
        assert_eq!(config.approval.memory_capacity, 256);
        assert_eq!(config.approval.max_pending, 100);
        assert_eq!(config.approval.pending_timeout_secs, 1800);
        assert_eq!(config.approval.sweep_interval_secs, 300);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: AgentConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AgentConfig::default());
    }

    #[test]
    fn test_from_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join("agent.json");
        std::fs::write(
            &config_path,
            r#"{
                "maxTurns": 8,
                "compactionThreshold": 120000,
                "approval": {"mode": "autoEdit", "maxPending": 4}
            }"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&config_path).unwrap();
        assert_eq!(config.max_turns, 8);
        assert_eq!(config.compaction_threshold, Some(120000));
        assert_eq!(config.approval.mode, ApprovalMode::AutoEdit);
        assert_eq!(config.approval.max_pending, 4);
        assert_eq!(config.approval.pending_timeout_secs, 1800);
    }

    #[test]
    fn test_from_file_errors() {
        let temp_dir = tempfile::tempdir().unwrap();

        let missing = AgentConfig::from_file(&temp_dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));

        let bad = temp_dir.path().join("bad.json");
        std::fs::write(&bad, "{ not json").unwrap();
        assert!(matches!(
            AgentConfig::from_file(&bad).unwrap_err(),
            ConfigError::Parse { .. }
        ));

        let zero = temp_dir.path().join("zero.json");
        std::fs::write(&zero, r#"{"maxTurns": 0}"#).unwrap();
        let err = AgentConfig::from_file(&zero).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: maxTurns must be at least 1"
        );
    }
}

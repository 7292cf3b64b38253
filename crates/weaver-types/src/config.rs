//! Engine configuration types for Weaver.
//!
//! `EngineConfig` represents the `config.toml` in the data directory that
//! controls default timeouts, loop caps and the storage backend.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine.
///
/// Loaded from `~/.weaver/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Run-level timeout when a workflow does not declare one.
    #[serde(default = "default_workflow_timeout_ms")]
    pub workflow_timeout_ms: u64,

    /// Per-attempt step timeout when a step does not declare one.
    #[serde(default = "default_step_timeout_ms")]
    pub step_timeout_ms: u64,

    /// Iteration cap for loops without `max_iterations`.
    #[serde(default = "default_max_loop_iterations")]
    pub max_loop_iterations: u32,

    /// Maximum nesting of sub-workflow steps.
    #[serde(default = "default_max_sub_workflow_depth")]
    pub max_sub_workflow_depth: u32,

    /// Broadcast channel capacity for lifecycle events.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    #[serde(default)]
    pub storage: StorageConfig,
}

fn default_workflow_timeout_ms() -> u64 {
    30 * 60 * 1000
}

fn default_step_timeout_ms() -> u64 {
    5 * 60 * 1000
}

fn default_max_loop_iterations() -> u32 {
    100
}

fn default_max_sub_workflow_depth() -> u32 {
    5
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workflow_timeout_ms: default_workflow_timeout_ms(),
            step_timeout_ms: default_step_timeout_ms(),
            max_loop_iterations: default_max_loop_iterations(),
            max_sub_workflow_depth: default_max_sub_workflow_depth(),
            event_capacity: default_event_capacity(),
            storage: StorageConfig::default(),
        }
    }
}

/// Where suspension records and run history live.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    /// Database file or directory, relative to the data dir when not absolute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Sqlite,
    File,
    /// Non-durable; state is lost on exit.
    Memory,
}

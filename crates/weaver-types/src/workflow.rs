//! Workflow domain types for Weaver.
//!
//! `WorkflowDefinition` is the static shape of a workflow (steps, edges,
//! output mapping). The remaining types track execution: per-step results,
//! run records, suspension records and the terminal `WorkflowResult`.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::condition::Condition;
use crate::variable::VariableRef;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// The declared shape of a workflow.
///
/// Parsed from YAML or JSON and registered with the engine. Read-only once
/// registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Workflow identifier (the registry key when loaded from a file).
    pub id: String,
    /// Human-readable name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Run-level timeout in milliseconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Output mapping: result key -> context path.
    ///
    /// When empty, the result carries the outputs of successful sink steps.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub output: BTreeMap<String, VariableRef>,
    /// Step declarations. Order is only used as a tie-breaker for dispatch.
    pub steps: Vec<StepDefinition>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl WorkflowDefinition {
    /// Look up a step by ID.
    pub fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single declared unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Unique within the workflow.
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Explicit predecessors (DAG edges).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub after: Vec<String>,
    /// Inputs materialized from the context before execution.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, VariableRef>,
    /// Dispatch gate; a false condition marks the step skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub error_handling: ErrorHandlingMode,
    /// Per-attempt timeout in milliseconds (overrides the engine default).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// What the step does.
    pub kind: StepKind,
}

impl StepDefinition {
    /// Display name, falling back to the ID.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// The closed set of step kinds.
///
/// Internally tagged by `type`:
/// ```yaml
/// kind:
///   type: function
///   handler: summarize
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    /// Invoke a named agent with rendered instructions.
    Agent {
        agent: String,
        #[serde(default)]
        instructions: String,
    },
    /// Invoke a named function handler.
    Function {
        handler: String,
        #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
        config: serde_json::Value,
    },
    /// Activate exactly one of two branches.
    Conditional {
        condition: Condition,
        #[serde(default)]
        on_true: Vec<String>,
        #[serde(default)]
        on_false: Vec<String>,
    },
    /// Re-run `body` while `condition` holds, up to an iteration cap.
    Loop {
        condition: Condition,
        body: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_iterations: Option<u32>,
        /// Loop variables recomputed from each iteration's results.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        carry: BTreeMap<String, VariableRef>,
        /// Loop variable values before the first iteration.
        #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
        initial: serde_json::Map<String, serde_json::Value>,
    },
    /// Run another registered workflow inline.
    SubWorkflow {
        workflow: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        input: BTreeMap<String, VariableRef>,
    },
    /// Suspend until a human responds, or fall back after `timeout_ms`.
    Human {
        prompt: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_timeout: Vec<String>,
    },
    /// Suspend until one of the named events fires.
    WaitForEvent {
        events: Vec<String>,
        /// Event name -> steps that run only when that event fires.
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        branches: BTreeMap<String, Vec<String>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        on_timeout: Vec<String>,
    },
}

impl StepKind {
    /// Short kind name used in logs and tables.
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Agent { .. } => "agent",
            StepKind::Function { .. } => "function",
            StepKind::Conditional { .. } => "conditional",
            StepKind::Loop { .. } => "loop",
            StepKind::SubWorkflow { .. } => "sub_workflow",
            StepKind::Human { .. } => "human",
            StepKind::WaitForEvent { .. } => "wait_for_event",
        }
    }

    /// Steps that receive an implicit edge from the owning step.
    pub fn branch_targets(&self) -> Vec<&str> {
        match self {
            StepKind::Conditional {
                on_true, on_false, ..
            } => on_true.iter().chain(on_false).map(String::as_str).collect(),
            StepKind::Human { on_timeout, .. } => on_timeout.iter().map(String::as_str).collect(),
            StepKind::WaitForEvent {
                branches,
                on_timeout,
                ..
            } => branches
                .values()
                .flatten()
                .chain(on_timeout)
                .map(String::as_str)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether this kind always suspends when executed.
    pub fn always_suspends(&self) -> bool {
        matches!(self, StepKind::Human { .. } | StepKind::WaitForEvent { .. })
    }
}

/// What happens when a step fails after exhausting retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandlingMode {
    /// Abort the whole run with this step's error.
    #[default]
    FailWorkflow,
    /// Mark the step `error`, keep going, report it in `WorkflowResult::errors`.
    ContinueOnError,
    /// Mark the step `error`, keep going, log only.
    IgnoreError,
}

// ---------------------------------------------------------------------------
// Retry Policy
// ---------------------------------------------------------------------------

/// Per-step retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    /// Retryable failure classes. `None` = everything except
    /// `missing_variable` and `permanent`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_on: Option<Vec<FailureKind>>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::default(),
            retry_on: None,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Constant { delay_ms: 0 },
            retry_on: None,
        }
    }
}

/// Delay schedule between attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Constant {
        delay_ms: u64,
    },
    Linear {
        delay_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_delay_ms: Option<u64>,
    },
    Exponential {
        delay_ms: u64,
        #[serde(default = "default_multiplier")]
        multiplier: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_delay_ms: Option<u64>,
    },
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Constant { delay_ms: 1000 }
    }
}

/// Classification of a step failure, consulted by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Generic handler failure.
    Execution,
    /// A single attempt exceeded its timeout.
    Timeout,
    /// A required variable could not be resolved.
    MissingVariable,
    /// Explicitly marked as worth retrying.
    Transient,
    /// Explicitly marked as never worth retrying.
    Permanent,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Execution => "execution",
            FailureKind::Timeout => "timeout",
            FailureKind::MissingVariable => "missing_variable",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Step Results
// ---------------------------------------------------------------------------

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Error,
    Suspended,
    Skipped,
}

impl StepStatus {
    /// Success, error and skipped never change again within a run.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            StepStatus::Success | StepStatus::Error | StepStatus::Skipped
        )
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Error => "error",
            StepStatus::Suspended => "suspended",
            StepStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

/// The recorded outcome of one step in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Execution attempts made (0 for skipped steps).
    #[serde(default)]
    pub attempts: u32,
    /// Present only while `status == suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    fn with_status(status: StepStatus) -> Self {
        Self {
            status,
            output: None,
            error: None,
            failure_kind: None,
            attempts: 0,
            suspension: None,
            started_at: None,
            completed_at: None,
        }
    }

    pub fn pending() -> Self {
        Self::with_status(StepStatus::Pending)
    }

    pub fn running() -> Self {
        Self {
            started_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Running)
        }
    }

    pub fn skipped() -> Self {
        Self {
            completed_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Skipped)
        }
    }

    pub fn success(output: serde_json::Value, attempts: u32) -> Self {
        Self {
            output: Some(output),
            attempts,
            completed_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Success)
        }
    }

    pub fn error(message: impl Into<String>, kind: FailureKind, attempts: u32) -> Self {
        Self {
            error: Some(message.into()),
            failure_kind: Some(kind),
            attempts,
            completed_at: Some(Utc::now()),
            ..Self::with_status(StepStatus::Error)
        }
    }

    /// A suspended result: `partial` is the pre-suspension output.
    pub fn suspended(partial: serde_json::Value, metadata: serde_json::Value, attempts: u32) -> Self {
        Self {
            output: Some(partial),
            suspension: Some(metadata),
            attempts,
            ..Self::with_status(StepStatus::Suspended)
        }
    }

    /// Keep the original start time when a result replaces a running one.
    pub fn started(mut self, started_at: Option<DateTime<Utc>>) -> Self {
        if self.started_at.is_none() {
            self.started_at = started_at;
        }
        self
    }
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStatus {
    Running,
    Completed,
    Failed,
    Suspended,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Completed => "completed",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Suspended => "suspended",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowRunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(WorkflowRunStatus::Running),
            "completed" => Ok(WorkflowRunStatus::Completed),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "suspended" => Ok(WorkflowRunStatus::Suspended),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Persisted history entry for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRunRecord {
    pub workflow_id: String,
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    pub status: WorkflowRunStatus,
    /// Serialized `WorkflowContext` at the last save.
    pub context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Active suspension while `status == suspended`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// A failure surfaced by a `continue_on_error` step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepErrorSummary {
    pub step_id: String,
    pub error: String,
}

/// Terminal (or suspended) outcome of an execute/resume call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub status: WorkflowRunStatus,
    pub success: bool,
    /// Values extracted by the output mapping.
    pub output: serde_json::Map<String, serde_json::Value>,
    /// Always present when `success == false`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failures from `continue_on_error` steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<StepErrorSummary>,
    /// Every step's result, for diagnostics.
    pub steps: BTreeMap<String, StepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspension_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_step: Option<String>,
}

impl WorkflowResult {
    /// Status of a step, if it exists in this run.
    pub fn step_status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).map(|r| r.status)
    }
}

// ---------------------------------------------------------------------------
// Suspension Records
// ---------------------------------------------------------------------------

/// Why a step suspended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionKind {
    /// A handler asked to suspend (missing resource, approval, ...).
    Handler,
    Human,
    Event,
    /// A nested workflow suspended; see `SuspensionRecord::child`.
    SubWorkflow,
}

impl std::fmt::Display for SuspensionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SuspensionKind::Handler => "handler",
            SuspensionKind::Human => "human",
            SuspensionKind::Event => "event",
            SuspensionKind::SubWorkflow => "sub_workflow",
        };
        f.write_str(s)
    }
}

/// Lifecycle of a suspension record in the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspensionStatus {
    /// Waiting for a resume call or a timeout.
    Active,
    /// A resume is in progress; further resumes are rejected.
    Claimed,
    /// The run was aborted; resumes are rejected as unknown.
    Abandoned,
}

impl SuspensionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuspensionStatus::Active => "active",
            SuspensionStatus::Claimed => "claimed",
            SuspensionStatus::Abandoned => "abandoned",
        }
    }
}

impl std::str::FromStr for SuspensionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SuspensionStatus::Active),
            "claimed" => Ok(SuspensionStatus::Claimed),
            "abandoned" => Ok(SuspensionStatus::Abandoned),
            other => Err(format!("invalid suspension status: '{other}'")),
        }
    }
}

/// Durable snapshot of a suspended run.
///
/// `context` plus `step_id` form the cursor: every other step's status is
/// inside the serialized context, so rehydration needs nothing else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspensionRecord {
    /// Globally unique (UUIDv7).
    pub suspension_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    /// The paused step.
    pub step_id: String,
    pub kind: SuspensionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Serialized `WorkflowContext`.
    pub context: serde_json::Value,
    /// Suspended state of a nested workflow (sub-workflow steps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<Box<SuspensionRecord>>,
    pub status: SuspensionStatus,
    /// Bumped on every state change (optimistic concurrency).
    pub version: u32,
    /// When the timeout fallback fires, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Introspection view of a suspension (no context payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspensionSummary {
    pub suspension_id: Uuid,
    pub workflow_id: String,
    pub run_id: Uuid,
    pub step_id: String,
    pub kind: SuspensionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<&SuspensionRecord> for SuspensionSummary {
    fn from(record: &SuspensionRecord) -> Self {
        Self {
            suspension_id: record.suspension_id,
            workflow_id: record.workflow_id.clone(),
            run_id: record.run_id,
            step_id: record.step_id.clone(),
            kind: record.kind,
            reason: record.reason.clone(),
            timeout_at: record.timeout_at,
            created_at: record.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

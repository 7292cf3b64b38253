//! Workflow lifecycle events.
//!
//! Published on the engine's broadcast bus and, for streaming execution, on a
//! per-call channel. Each event names the workflow and run it belongs to.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single lifecycle event of a workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    Started {
        workflow_id: String,
        run_id: Uuid,
    },
    StepStarted {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        attempt: u32,
    },
    StepCompleted {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        output: serde_json::Value,
    },
    StepFailed {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        error: String,
        /// True when the retry policy will re-run the step.
        will_retry: bool,
    },
    StepSkipped {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
    },
    Suspended {
        workflow_id: String,
        run_id: Uuid,
        step_id: String,
        suspension_id: Uuid,
    },
    Resumed {
        workflow_id: String,
        run_id: Uuid,
        suspension_id: Uuid,
    },
    Completed {
        workflow_id: String,
        run_id: Uuid,
        output: serde_json::Map<String, serde_json::Value>,
    },
    Failed {
        workflow_id: String,
        run_id: Uuid,
        error: String,
    },
}

impl WorkflowEvent {
    /// The run this event belongs to.
    pub fn run_id(&self) -> Uuid {
        match self {
            WorkflowEvent::Started { run_id, .. }
            | WorkflowEvent::StepStarted { run_id, .. }
            | WorkflowEvent::StepCompleted { run_id, .. }
            | WorkflowEvent::StepFailed { run_id, .. }
            | WorkflowEvent::StepSkipped { run_id, .. }
            | WorkflowEvent::Suspended { run_id, .. }
            | WorkflowEvent::Resumed { run_id, .. }
            | WorkflowEvent::Completed { run_id, .. }
            | WorkflowEvent::Failed { run_id, .. } => *run_id,
        }
    }

    /// Whether the run stops emitting after this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowEvent::Suspended { .. }
                | WorkflowEvent::Completed { .. }
                | WorkflowEvent::Failed { .. }
        )
    }

    /// Snake-case event name, as serialized in the `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            WorkflowEvent::Started { .. } => "started",
            WorkflowEvent::StepStarted { .. } => "step_started",
            WorkflowEvent::StepCompleted { .. } => "step_completed",
            WorkflowEvent::StepFailed { .. } => "step_failed",
            WorkflowEvent::StepSkipped { .. } => "step_skipped",
            WorkflowEvent::Suspended { .. } => "suspended",
            WorkflowEvent::Resumed { .. } => "resumed",
            WorkflowEvent::Completed { .. } => "completed",
            WorkflowEvent::Failed { .. } => "failed",
        }
    }
}

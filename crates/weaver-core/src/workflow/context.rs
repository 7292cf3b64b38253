//! Run-scoped workflow context.
//!
//! `WorkflowContext` is owned by exactly one in-flight run. Only the
//! scheduler writes to it, one finished step at a time; step workers receive
//! an immutable `scope()` snapshot to resolve their inputs from.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use weaver_types::workflow::{StepResult, StepStatus};

use super::definition::WorkflowError;

// ---------------------------------------------------------------------------
// WorkflowContext
// ---------------------------------------------------------------------------

/// Mutable state of one run: input, step results, variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowContext {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub input: Map<String, Value>,
    /// Results keyed by step ID. Absent means pending.
    pub steps: BTreeMap<String, StepResult>,
    pub variables: Map<String, Value>,
    pub started_at: DateTime<Utc>,
}

impl WorkflowContext {
    pub fn new(workflow_id: impl Into<String>, run_id: Uuid, input: Map<String, Value>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id,
            input,
            steps: BTreeMap::new(),
            variables: Map::new(),
            started_at: Utc::now(),
        }
    }

    /// Seed a pending result for each step so results list every step.
    pub fn init_steps<'a>(&mut self, step_ids: impl IntoIterator<Item = &'a str>) {
        for id in step_ids {
            self.steps
                .entry(id.to_string())
                .or_insert_with(StepResult::pending);
        }
    }

    /// Record a step result, replacing any earlier one.
    pub fn record(&mut self, step_id: &str, result: StepResult) {
        self.steps.insert(step_id.to_string(), result);
    }

    pub fn result(&self, step_id: &str) -> Option<&StepResult> {
        self.steps.get(step_id)
    }

    /// Status of a step; steps without a result are pending.
    pub fn status(&self, step_id: &str) -> StepStatus {
        self.steps
            .get(step_id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    pub fn output(&self, step_id: &str) -> Option<&Value> {
        self.steps.get(step_id).and_then(|r| r.output.as_ref())
    }

    /// Put a step back to pending.
    pub fn reset(&mut self, step_id: &str) {
        self.steps.insert(step_id.to_string(), StepResult::pending());
    }

    /// The read-only value that paths are resolved against.
    ///
    /// ```text
    /// { run_id, workflow_id, input, variables,
    ///   steps: { <id>: { status, output?, error } } }
    /// ```
    pub fn scope(&self) -> Value {
        let steps: Map<String, Value> = self
            .steps
            .iter()
            .map(|(id, result)| {
                let mut entry = Map::new();
                entry.insert("status".to_string(), json!(result.status));
                // No `output` key for steps that produced none.
                if let Some(output) = &result.output {
                    entry.insert("output".to_string(), output.clone());
                }
                entry.insert("error".to_string(), json!(result.error));
                (id.clone(), Value::Object(entry))
            })
            .collect();

        json!({
            "run_id": self.run_id.to_string(),
            "workflow_id": self.workflow_id,
            "input": self.input,
            "steps": steps,
            "variables": self.variables,
        })
    }

    /// Serialize for persistence.
    pub fn to_json(&self) -> Result<Value, WorkflowError> {
        serde_json::to_value(self).map_err(|e| WorkflowError::Execution(e.to_string()))
    }

    /// Rehydrate from a persisted snapshot.
    pub fn from_json(value: Value) -> Result<Self, WorkflowError> {
        serde_json::from_value(value)
            .map_err(|e| WorkflowError::Execution(format!("failed to restore context: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weaver_types::workflow::FailureKind;

    fn test_context() -> WorkflowContext {
        let mut input = Map::new();
        input.insert("topic".to_string(), json!("rust"));
        WorkflowContext::new("digest", Uuid::now_v7(), input)
    }

    #[test]
    fn test_new_context_is_empty() {
        let ctx = test_context();
        assert!(ctx.steps.is_empty());
        assert!(ctx.variables.is_empty());
        assert_eq!(ctx.status("anything"), StepStatus::Pending);
    }

    #[test]
    fn test_init_steps_keeps_existing_results() {
        let mut ctx = test_context();
        ctx.record("a", StepResult::success(json!(1), 1));
        ctx.init_steps(["a", "b"]);
        assert_eq!(ctx.status("a"), StepStatus::Success);
        assert_eq!(ctx.status("b"), StepStatus::Pending);
        assert_eq!(ctx.steps.len(), 2);
    }

    #[test]
    fn test_record_and_scope() {
        let mut ctx = test_context();
        ctx.record("fetch", StepResult::success(json!({"n": 3}), 1));
        ctx.record("bad", StepResult::error("boom", FailureKind::Execution, 2));

        let scope = ctx.scope();
        assert_eq!(scope["input"]["topic"], "rust");
        assert_eq!(scope["steps"]["fetch"]["status"], "success");
        assert_eq!(scope["steps"]["fetch"]["output"]["n"], 3);
        assert_eq!(scope["steps"]["bad"]["error"], "boom");
        assert!(scope["steps"]["bad"].get("output").is_none());
        assert_eq!(ctx.output("fetch"), Some(&json!({"n": 3})));
    }

    #[test]
    fn test_reset_returns_to_pending() {
        let mut ctx = test_context();
        ctx.record("a", StepResult::suspended(json!({}), json!({}), 1));
        ctx.reset("a");
        assert_eq!(ctx.status("a"), StepStatus::Pending);
    }

    #[test]
    fn test_large_output_is_kept_intact() {
        let mut ctx = test_context();
        let big = "x".repeat(2 * 1024 * 1024);
        ctx.record("big", StepResult::success(json!(big.clone()), 1));
        assert_eq!(ctx.output("big"), Some(&json!(big)));
    }

    #[test]
    fn test_json_roundtrip_preserves_equality() {
        let mut ctx = test_context();
        ctx.variables.insert("count".to_string(), json!(2));
        ctx.record("a", StepResult::success(json!([1, 2]), 1));

        let restored = WorkflowContext::from_json(ctx.to_json().unwrap()).unwrap();
        assert_eq!(restored, ctx);
    }

    #[test]
    fn test_from_json_rejects_garbage() {
        assert!(WorkflowContext::from_json(json!({"nope": true})).is_err());
    }
}

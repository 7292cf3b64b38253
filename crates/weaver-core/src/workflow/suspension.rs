//! Suspension records and continuation of suspended steps.
//!
//! A suspended run is persisted as a `SuspensionRecord`: the serialized
//! context plus the id of the paused step. Continuing it means producing the
//! paused step's final report (from resume data, an event or a timeout) and
//! then scheduling the rest of the run as if the step had just finished.
//! Sub-workflow suspensions nest: the parent record carries the child's.

use std::future::Future;
use std::pin::Pin;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;
use weaver_types::workflow::{
    FailureKind, StepDefinition, StepKind, StepResult, SuspensionKind, SuspensionRecord,
    SuspensionStatus,
};

use super::context::WorkflowContext;
use super::dag::WorkflowPlan;
use super::definition::WorkflowError;
use super::engine::EngineError;
use super::scheduler::{run_scope, RunEnv, Runtime, StepReport};
use super::step_runner::{resume_handler_step, sub_workflow_report};

/// A step's request to pause the run.
#[derive(Debug, Clone)]
pub(crate) struct SuspendRequest {
    pub step_id: String,
    pub kind: SuspensionKind,
    pub reason: Option<String>,
    pub metadata: Value,
    pub timeout_at: Option<DateTime<Utc>>,
    /// The nested run's record when a sub-workflow step suspended.
    pub child: Option<Box<SuspensionRecord>>,
}

/// What wakes a suspended step.
#[derive(Debug, Clone)]
pub(crate) enum Continuation {
    Resume(Value),
    Event { name: String, payload: Value },
    Timeout,
}

/// Snapshot a suspended run into a fresh, active record.
pub(crate) fn build_record(
    request: SuspendRequest,
    workflow_id: &str,
    run_id: Uuid,
    ctx: &WorkflowContext,
) -> Result<SuspensionRecord, WorkflowError> {
    let now = Utc::now();
    Ok(SuspensionRecord {
        suspension_id: Uuid::now_v7(),
        workflow_id: workflow_id.to_string(),
        run_id,
        step_id: request.step_id,
        kind: request.kind,
        reason: request.reason,
        metadata: request.metadata,
        context: ctx.to_json()?,
        child: request.child,
        status: SuspensionStatus::Active,
        version: 0,
        timeout_at: request.timeout_at,
        created_at: now,
        updated_at: now,
    })
}

/// Reject a continuation the suspended step cannot accept.
///
/// Runs before the record is claimed, so a bad event name leaves the
/// suspension active.
pub(crate) fn validate_continuation(
    runtime: &Runtime,
    plan: &WorkflowPlan,
    record: &SuspensionRecord,
    continuation: &Continuation,
    suspension_id: Uuid,
) -> Result<(), EngineError> {
    let step = suspended_step(plan, record)?;
    match (&step.kind, continuation) {
        (StepKind::WaitForEvent { events, .. }, Continuation::Event { name, .. }) => {
            if events.iter().any(|e| e == name) {
                Ok(())
            } else {
                Err(EngineError::InvalidEvent {
                    suspension_id,
                    event: name.clone(),
                    reason: format!("step '{}' waits for: {}", step.id, events.join(", ")),
                })
            }
        }
        (StepKind::WaitForEvent { .. }, Continuation::Resume(_)) => {
            Err(EngineError::InvalidResume {
                suspension_id,
                reason: format!(
                    "step '{}' waits for an event; resume it with an event name",
                    step.id
                ),
            })
        }
        (StepKind::SubWorkflow { .. }, Continuation::Timeout) => Ok(()),
        (StepKind::SubWorkflow { .. }, _) => {
            let child = child_record(record)?;
            let child_plan = runtime
                .plan(&child.workflow_id)
                .ok_or_else(|| EngineError::WorkflowNotFound(child.workflow_id.clone()))?;
            validate_continuation(runtime, &child_plan, child, continuation, suspension_id)
        }
        (_, Continuation::Event { name, .. }) => Err(EngineError::InvalidEvent {
            suspension_id,
            event: name.clone(),
            reason: format!("step '{}' does not wait for events", step.id),
        }),
        _ => Ok(()),
    }
}

type ContinueFuture<'a> = Pin<Box<dyn Future<Output = Result<StepReport, EngineError>> + Send + 'a>>;

/// Produce the final report of the suspended step.
pub(crate) fn continue_step<'a>(
    env: &'a RunEnv,
    record: &'a SuspensionRecord,
    ctx: &'a WorkflowContext,
    continuation: Continuation,
) -> ContinueFuture<'a> {
    Box::pin(async move {
        let step = suspended_step(&env.plan, record)?;
        let report = match (&step.kind, continuation) {
            (StepKind::Agent { .. } | StepKind::Function { .. }, Continuation::Resume(data)) => {
                resume_handler_step(env, step, ctx, data).await
            }
            (StepKind::Human { on_timeout, .. }, Continuation::Resume(response)) => {
                let output = json!({
                    "prompt": record.metadata.get("prompt").cloned().unwrap_or(Value::Null),
                    "response": response,
                    "timed_out": false,
                });
                StepReport::new(&step.id, StepResult::success(output, 1))
                    .with_skip(on_timeout.clone())
            }
            (StepKind::Human { on_timeout, .. }, Continuation::Timeout) => {
                let output = json!({
                    "prompt": record.metadata.get("prompt").cloned().unwrap_or(Value::Null),
                    "response": Value::Null,
                    "timed_out": true,
                });
                let skip = except(env.plan.direct_dependents(&step.id).iter(), on_timeout);
                StepReport::new(&step.id, StepResult::success(output, 1)).with_skip(skip)
            }
            (
                StepKind::WaitForEvent {
                    branches,
                    on_timeout,
                    ..
                },
                Continuation::Event { name, payload },
            ) => {
                let kept = branches.get(&name).cloned().unwrap_or_default();
                let others = branches
                    .iter()
                    .filter(|(event, _)| **event != name)
                    .flat_map(|(_, steps)| steps.iter())
                    .chain(on_timeout.iter());
                let skip = except(others, &kept);
                let output = json!({ "event": name, "payload": payload, "timed_out": false });
                StepReport::new(&step.id, StepResult::success(output, 1)).with_skip(skip)
            }
            (
                StepKind::WaitForEvent {
                    branches,
                    on_timeout,
                    ..
                },
                Continuation::Timeout,
            ) => {
                let all = branches
                    .values()
                    .flatten()
                    .chain(env.plan.direct_dependents(&step.id).iter());
                let skip = except(all, on_timeout);
                let output = json!({ "event": Value::Null, "payload": Value::Null, "timed_out": true });
                StepReport::new(&step.id, StepResult::success(output, 1)).with_skip(skip)
            }
            (StepKind::SubWorkflow { .. }, continuation) => {
                let child = child_record(record)?;
                let plan = env
                    .runtime
                    .plan(&child.workflow_id)
                    .ok_or_else(|| EngineError::WorkflowNotFound(child.workflow_id.clone()))?;
                let child_ctx = WorkflowContext::from_json(child.context.clone())
                    .map_err(|e| EngineError::Context(e.to_string()))?;
                let child_env = env.child(plan, child.run_id);

                let seed = continue_step(&child_env, child, &child_ctx, continuation).await?;
                let (child_ctx, outcome) =
                    run_scope(child_env.clone(), None, child_ctx.clone(), Some(seed)).await;
                sub_workflow_report(&step.id, &child_env, child_ctx, outcome)
            }
            (_, Continuation::Timeout) => StepReport::failed(
                &step.id,
                "suspension timed out",
                FailureKind::Timeout,
                1,
            ),
            (kind, _) => StepReport::failed(
                &step.id,
                format!("a {} step cannot be continued this way", kind.name()),
                FailureKind::Permanent,
                1,
            ),
        };
        Ok(report)
    })
}

fn suspended_step<'p>(
    plan: &'p WorkflowPlan,
    record: &SuspensionRecord,
) -> Result<&'p StepDefinition, EngineError> {
    plan.step(&record.step_id).ok_or_else(|| {
        EngineError::Context(format!(
            "suspended step '{}' no longer exists in workflow '{}'",
            record.step_id, record.workflow_id
        ))
    })
}

fn child_record(record: &SuspensionRecord) -> Result<&SuspensionRecord, EngineError> {
    record.child.as_deref().ok_or_else(|| {
        EngineError::Context(format!(
            "sub-workflow suspension at step '{}' has no child record",
            record.step_id
        ))
    })
}

/// Ids from `ids` not in `keep`, deduplicated in first-seen order.
fn except<'i>(ids: impl Iterator<Item = &'i String>, keep: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for id in ids {
        if !keep.contains(id) && !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

//! Completion-driven DAG scheduler.
//!
//! One coordinator runs per scope (the top level, or one loop body). Ready
//! steps are spawned onto a `tokio::JoinSet` as soon as their predecessors
//! are terminal; the coordinator awaits `join_next` and merges one finished
//! step at a time, so a fast step unblocks its dependents immediately.
//!
//! Workers never touch the shared `WorkflowContext`: each receives a
//! snapshot and returns a `StepReport` that only the coordinator merges.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::task::{Id, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weaver_types::config::EngineConfig;
use weaver_types::event::WorkflowEvent;
use weaver_types::workflow::{ErrorHandlingMode, FailureKind, StepResult, StepStatus};

use crate::event::EventSink;
use crate::step::HandlerRegistry;

use super::condition::evaluate;
use super::context::WorkflowContext;
use super::dag::{Scope, WorkflowPlan};
use super::resolver::VariableResolver;
use super::step_runner::run_step;
use super::suspension::SuspendRequest;

// ---------------------------------------------------------------------------
// Shared runtime
// ---------------------------------------------------------------------------

/// Engine-wide collaborators shared by every run.
#[derive(Debug)]
pub(crate) struct Runtime {
    pub handlers: HandlerRegistry,
    pub resolver: VariableResolver,
    pub workflows: DashMap<String, Arc<WorkflowPlan>>,
    pub config: EngineConfig,
}

impl Runtime {
    pub fn plan(&self, workflow_id: &str) -> Option<Arc<WorkflowPlan>> {
        self.workflows.get(workflow_id).map(|p| Arc::clone(p.value()))
    }
}

/// Per-run execution environment, cloned into every worker.
#[derive(Debug, Clone)]
pub(crate) struct RunEnv {
    pub runtime: Arc<Runtime>,
    pub plan: Arc<WorkflowPlan>,
    pub run_id: Uuid,
    pub cancel: CancellationToken,
    pub deadline: Instant,
    pub events: EventSink,
    /// Sub-workflow nesting depth (0 for top-level runs).
    pub depth: u32,
}

impl RunEnv {
    pub fn workflow_id(&self) -> String {
        self.plan.id().to_string()
    }

    /// Environment for a sub-workflow run nested one level deeper.
    pub fn child(&self, plan: Arc<WorkflowPlan>, run_id: Uuid) -> RunEnv {
        RunEnv {
            runtime: Arc::clone(&self.runtime),
            plan,
            run_id,
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            events: self.events.clone(),
            depth: self.depth + 1,
        }
    }

    pub fn step_started(&self, step_id: &str, attempt: u32) {
        self.events.emit(WorkflowEvent::StepStarted {
            workflow_id: self.workflow_id(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
            attempt,
        });
    }

    pub fn step_completed(&self, step_id: &str, output: Value) {
        self.events.emit(WorkflowEvent::StepCompleted {
            workflow_id: self.workflow_id(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
            output,
        });
    }

    pub fn step_failed(&self, step_id: &str, error: &str, will_retry: bool) {
        self.events.emit(WorkflowEvent::StepFailed {
            workflow_id: self.workflow_id(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
            error: error.to_string(),
            will_retry,
        });
    }

    pub fn step_skipped(&self, step_id: &str) {
        self.events.emit(WorkflowEvent::StepSkipped {
            workflow_id: self.workflow_id(),
            run_id: self.run_id,
            step_id: step_id.to_string(),
        });
    }
}

// ---------------------------------------------------------------------------
// Reports and outcomes
// ---------------------------------------------------------------------------

/// What a worker hands back to the coordinator.
#[derive(Debug)]
pub(crate) struct StepReport {
    pub step_id: String,
    pub result: StepResult,
    /// Results of nested steps (a loop's body) to record alongside.
    pub nested: Vec<(String, StepResult)>,
    /// Run variables to set (loop carry values).
    pub variables: Map<String, Value>,
    /// Steps of inactive branches to mark skipped.
    pub skip: Vec<String>,
    pub suspension: Option<SuspendRequest>,
}

impl StepReport {
    pub fn new(step_id: impl Into<String>, result: StepResult) -> Self {
        Self {
            step_id: step_id.into(),
            result,
            nested: Vec::new(),
            variables: Map::new(),
            skip: Vec::new(),
            suspension: None,
        }
    }

    pub fn failed(
        step_id: impl Into<String>,
        message: impl Into<String>,
        kind: FailureKind,
        attempts: u32,
    ) -> Self {
        Self::new(step_id, StepResult::error(message, kind, attempts))
    }

    pub fn with_skip(mut self, skip: Vec<String>) -> Self {
        self.skip = skip;
        self
    }
}

/// How a scope run ended.
#[derive(Debug)]
pub(crate) enum ScopeOutcome {
    Completed,
    Failed { step_id: String, error: String },
    Suspended(SuspendRequest),
    Cancelled,
    TimedOut,
}

pub(crate) type ScopeFuture =
    Pin<Box<dyn Future<Output = (WorkflowContext, ScopeOutcome)> + Send + 'static>>;

/// Run every step of a scope to a terminal state (or suspension).
///
/// `scope` is `None` for the top level, otherwise the owning loop's id.
/// `seed` is merged before anything is dispatched; resumption uses it to
/// inject the continued step's result.
pub(crate) fn run_scope(
    env: RunEnv,
    scope: Option<String>,
    ctx: WorkflowContext,
    seed: Option<StepReport>,
) -> ScopeFuture {
    Box::pin(async move {
        let members = match &scope {
            None => Some(env.plan.top_scope().clone()),
            Some(loop_id) => env.plan.loop_scope(loop_id).cloned(),
        };
        let Some(members) = members else {
            let step_id = scope.unwrap_or_default();
            return (
                ctx,
                ScopeOutcome::Failed {
                    error: format!("no body scope for loop '{step_id}'"),
                    step_id,
                },
            );
        };
        Coordinator::new(env, members, ctx).run(seed).await
    })
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator {
    env: RunEnv,
    scope: Scope,
    ctx: WorkflowContext,
    workers: JoinSet<StepReport>,
    in_flight: HashMap<Id, String>,
    suspension: Option<SuspendRequest>,
    fatal: Option<(String, String)>,
}

impl Coordinator {
    fn new(env: RunEnv, scope: Scope, ctx: WorkflowContext) -> Self {
        Self {
            env,
            scope,
            ctx,
            workers: JoinSet::new(),
            in_flight: HashMap::new(),
            suspension: None,
            fatal: None,
        }
    }

    async fn run(mut self, seed: Option<StepReport>) -> (WorkflowContext, ScopeOutcome) {
        if let Some(seed) = seed {
            self.absorb(seed);
        }

        loop {
            if self.fatal.is_none() && self.suspension.is_none() {
                self.dispatch_ready();
            }
            if self.fatal.is_some() {
                self.abort_in_flight("aborted: another step failed the workflow");
                break;
            }
            if self.workers.is_empty() {
                break;
            }

            tokio::select! {
                biased;
                _ = self.env.cancel.cancelled() => {
                    self.abort_in_flight("aborted: run cancelled");
                    return (self.ctx, ScopeOutcome::Cancelled);
                }
                _ = tokio::time::sleep_until(self.env.deadline) => {
                    self.abort_in_flight("aborted: workflow timed out");
                    return (self.ctx, ScopeOutcome::TimedOut);
                }
                joined = self.workers.join_next_with_id() => {
                    let report = match joined {
                        Some(Ok((id, report))) => {
                            self.in_flight.remove(&id);
                            report
                        }
                        Some(Err(err)) => {
                            let step_id = self.in_flight.remove(&err.id()).unwrap_or_default();
                            StepReport::failed(
                                step_id,
                                format!("step worker failed: {err}"),
                                FailureKind::Execution,
                                1,
                            )
                        }
                        None => continue,
                    };
                    self.absorb(report);
                }
            }
        }

        let outcome = if let Some((step_id, error)) = self.fatal.take() {
            ScopeOutcome::Failed { step_id, error }
        } else if let Some(request) = self.suspension.take() {
            ScopeOutcome::Suspended(request)
        } else {
            ScopeOutcome::Completed
        };
        (self.ctx, outcome)
    }

    /// Dispatch every ready step; steps whose condition is false are
    /// skipped, which may make further steps ready.
    fn dispatch_ready(&mut self) {
        loop {
            let ready: Vec<String> = self
                .scope
                .members()
                .iter()
                .filter(|id| self.ctx.status(id) == StepStatus::Pending && self.preds_satisfied(id))
                .cloned()
                .collect();

            let mut progressed = false;
            for step_id in ready {
                let Some(step) = self.env.plan.step(&step_id).cloned() else {
                    continue;
                };
                if let Some(condition) = &step.condition {
                    match evaluate(condition, &self.ctx.scope()) {
                        Ok(true) => {}
                        Ok(false) => {
                            tracing::debug!(step_id = step_id.as_str(), "condition false, skipping step");
                            self.skip(&step_id);
                            progressed = true;
                            continue;
                        }
                        Err(e) => {
                            self.absorb(StepReport::failed(
                                step_id,
                                e.to_string(),
                                FailureKind::Permanent,
                                0,
                            ));
                            if self.fatal.is_some() {
                                return;
                            }
                            progressed = true;
                            continue;
                        }
                    }
                }

                self.record(&step_id, StepResult::running());
                let snapshot = self.ctx.clone();
                let handle = self
                    .workers
                    .spawn(run_step(self.env.clone(), step, snapshot));
                self.in_flight.insert(handle.id(), step_id);
            }

            if !progressed {
                break;
            }
        }
    }

    /// Success and skipped satisfy dependents; so does an error from a step
    /// that does not fail the workflow. Suspended steps never do.
    fn preds_satisfied(&self, step_id: &str) -> bool {
        self.scope
            .predecessors(step_id)
            .iter()
            .all(|pred| match self.ctx.status(pred) {
                StepStatus::Success | StepStatus::Skipped => true,
                StepStatus::Error => self
                    .env
                    .plan
                    .step(pred)
                    .is_some_and(|s| s.error_handling != ErrorHandlingMode::FailWorkflow),
                _ => false,
            })
    }

    fn absorb(&mut self, report: StepReport) {
        let StepReport {
            step_id,
            result,
            nested,
            variables,
            skip,
            suspension,
        } = report;

        for (id, nested_result) in nested {
            self.record(&id, nested_result);
        }
        self.ctx.variables.extend(variables);
        for id in &skip {
            if self.ctx.status(id) == StepStatus::Pending {
                self.skip(id);
            }
        }

        let started_at = self.ctx.result(&step_id).and_then(|r| r.started_at);
        let result = result.started(started_at);

        match result.status {
            StepStatus::Success => {
                self.env
                    .step_completed(&step_id, result.output.clone().unwrap_or(Value::Null));
                tracing::debug!(
                    run_id = %self.env.run_id,
                    step_id = step_id.as_str(),
                    attempts = result.attempts,
                    "step completed"
                );
                self.record(&step_id, result);
            }
            StepStatus::Error => {
                let error = result.error.clone().unwrap_or_default();
                self.env.step_failed(&step_id, &error, false);
                self.record(&step_id, result);
                self.skip_branches(&step_id);

                let mode = self
                    .env
                    .plan
                    .step(&step_id)
                    .map(|s| s.error_handling)
                    .unwrap_or_default();
                match mode {
                    ErrorHandlingMode::FailWorkflow => {
                        tracing::info!(
                            run_id = %self.env.run_id,
                            step_id = step_id.as_str(),
                            error = error.as_str(),
                            "step failed, failing workflow"
                        );
                        if self.fatal.is_none() {
                            self.fatal = Some((step_id, error));
                        }
                    }
                    ErrorHandlingMode::ContinueOnError => {
                        tracing::warn!(
                            run_id = %self.env.run_id,
                            step_id = step_id.as_str(),
                            error = error.as_str(),
                            "step failed, continuing"
                        );
                    }
                    ErrorHandlingMode::IgnoreError => {
                        tracing::warn!(
                            run_id = %self.env.run_id,
                            step_id = step_id.as_str(),
                            error = error.as_str(),
                            "step failed, error ignored"
                        );
                    }
                }
            }
            StepStatus::Suspended => match suspension {
                Some(request) if self.suspension.is_none() && self.fatal.is_none() => {
                    tracing::debug!(
                        run_id = %self.env.run_id,
                        step_id = step_id.as_str(),
                        "step suspended"
                    );
                    self.record(&step_id, result);
                    self.suspension = Some(request);
                }
                Some(_) => {
                    tracing::debug!(
                        step_id = step_id.as_str(),
                        "run already halting, step will re-run after resume"
                    );
                    self.ctx.reset(&step_id);
                }
                None => {
                    self.absorb(StepReport::failed(
                        step_id,
                        "step suspended without a suspension request",
                        FailureKind::Permanent,
                        result.attempts,
                    ));
                }
            },
            StepStatus::Skipped => self.skip(&step_id),
            StepStatus::Pending | StepStatus::Running => self.ctx.reset(&step_id),
        }
    }

    fn skip(&mut self, step_id: &str) {
        self.record(step_id, StepResult::skipped());
        self.env.step_skipped(step_id);
        self.skip_branches(step_id);
    }

    /// A branching step that was skipped or failed activates none of its
    /// branches, including its `on_timeout` targets.
    fn skip_branches(&mut self, step_id: &str) {
        let targets: Vec<String> = self
            .env
            .plan
            .step(step_id)
            .map(|s| s.kind.branch_targets().into_iter().map(str::to_string).collect())
            .unwrap_or_default();
        for target in targets {
            if self.ctx.status(&target) == StepStatus::Pending {
                self.skip(&target);
            }
        }
    }

    fn record(&mut self, step_id: &str, result: StepResult) {
        self.ctx.record(step_id, result);
    }

    fn abort_in_flight(&mut self, reason: &str) {
        self.workers.abort_all();
        let aborted: Vec<String> = self.in_flight.drain().map(|(_, id)| id).collect();
        for step_id in aborted {
            tracing::debug!(step_id = step_id.as_str(), reason, "aborting in-flight step");
            let started_at = self.ctx.result(&step_id).and_then(|r| r.started_at);
            let result = StepResult::error(reason, FailureKind::Execution, 0).started(started_at);
            self.record(&step_id, result);
        }
    }
}

// ---------------------------------------------------------------------------
// Output mapping
// ---------------------------------------------------------------------------

/// Build a run's output from its declared mapping.
///
/// Entries that do not resolve are omitted. Without a mapping, the output
/// holds the outputs of successful top-level sink steps keyed by step id.
pub(crate) fn collect_output(
    plan: &WorkflowPlan,
    ctx: &WorkflowContext,
    resolver: &VariableResolver,
) -> Map<String, Value> {
    let mapping = &plan.definition().output;
    if mapping.is_empty() {
        return plan
            .top_scope()
            .sinks()
            .into_iter()
            .filter(|id| ctx.status(id) == StepStatus::Success)
            .filter_map(|id| ctx.output(id).map(|out| (id.to_string(), out.clone())))
            .collect();
    }

    let scope = ctx.scope();
    mapping
        .iter()
        .filter_map(|(name, var)| match resolver.resolve(var, &scope) {
            Ok(value) => Some((name.clone(), value)),
            Err(e) => {
                tracing::debug!(output = name.as_str(), error = %e, "output entry unresolved, omitting");
                None
            }
        })
        .collect()
}

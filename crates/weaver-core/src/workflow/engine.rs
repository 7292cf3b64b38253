//! Workflow engine facade.
//!
//! `Engine` owns the workflow registry and wires the scheduler to storage and
//! events. It is cheap to clone; clones share registry, store and timers.
//!
//! # Run lifecycle
//!
//! 1. `execute_workflow` persists a `running` run record and emits `started`.
//! 2. The top-level scope is scheduled until it completes, fails or suspends.
//! 3. `finish` persists the suspension record (if any) and the final run
//!    record, then emits the terminal event.
//! 4. `resume_workflow` claims the suspension record, produces the paused
//!    step's final result and schedules the rest of the run. The record is
//!    deleted on success and released if the continuation errors.
//!
//! Suspensions with a timeout get a tokio timer. When it fires the record is
//! claimed like a resume and the step's `on_timeout` steps run instead of
//! its normal continuation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::Stream;
use serde_json::{Map, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use weaver_types::config::EngineConfig;
use weaver_types::error::RepositoryError;
use weaver_types::event::WorkflowEvent;
use weaver_types::variable::VariableRef;
use weaver_types::workflow::{
    ErrorHandlingMode, StepErrorSummary, StepKind, StepStatus, SuspensionRecord,
    SuspensionStatus, SuspensionSummary, WorkflowDefinition, WorkflowResult, WorkflowRunRecord,
    WorkflowRunStatus,
};

use crate::event::{EventBus, EventSink};
use crate::repository::{BoxWorkflowRepository, InMemoryWorkflowRepository, WorkflowRepository};
use crate::step::HandlerRegistry;

use super::context::WorkflowContext;
use super::dag::WorkflowPlan;
use super::definition::WorkflowError;
use super::resolver::VariableResolver;
use super::scheduler::{collect_output, run_scope, RunEnv, Runtime, ScopeOutcome};
use super::suspension::{build_record, continue_step, validate_continuation, Continuation};
use super::transform::TransformRegistry;

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced to callers of the engine.
///
/// Step failures are not errors here: they end up in the `WorkflowResult`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition, validation or context failure (including `CyclicDependency`).
    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("workflow not registered: {0}")]
    WorkflowNotFound(String),

    #[error("unknown suspension: {0}")]
    UnknownSuspension(Uuid),

    #[error("suspension {0} is already being resumed")]
    DuplicateResume(Uuid),

    #[error("invalid event '{event}' for suspension {suspension_id}: {reason}")]
    InvalidEvent {
        suspension_id: Uuid,
        event: String,
        reason: String,
    },

    #[error("invalid resume of suspension {suspension_id}: {reason}")]
    InvalidResume { suspension_id: Uuid, reason: String },

    #[error("suspension {suspension_id} at step '{step_id}' timed out")]
    SuspensionTimeout { suspension_id: Uuid, step_id: String },

    #[error("workflow '{workflow_id}' timed out after {timeout_ms}ms")]
    WorkflowTimeout { workflow_id: String, timeout_ms: u64 },

    #[error("storage error: {0}")]
    Storage(#[from] RepositoryError),

    #[error("run {run_id} of workflow '{workflow_id}' not found")]
    RunNotFound { workflow_id: String, run_id: Uuid },

    #[error("context error: {0}")]
    Context(String),
}

/// Caller-supplied data that wakes a suspended run.
#[derive(Debug, Clone)]
pub enum ResumeInput {
    /// Free-form resume data (generic, human and sub-workflow steps).
    Data(Value),
    /// A named event (wait-for-event steps).
    Event { name: String, payload: Value },
}

impl From<ResumeInput> for Continuation {
    fn from(input: ResumeInput) -> Self {
        match input {
            ResumeInput::Data(data) => Continuation::Resume(data),
            ResumeInput::Event { name, payload } => Continuation::Event { name, payload },
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`Engine`].
///
/// Defaults: in-memory repository, empty handler registry, builtin
/// transforms, a fresh event bus and `EngineConfig::default()`.
#[derive(Default)]
pub struct EngineBuilder {
    repository: Option<BoxWorkflowRepository>,
    handlers: Option<HandlerRegistry>,
    transforms: Option<TransformRegistry>,
    bus: Option<EventBus>,
    config: EngineConfig,
}

impl EngineBuilder {
    pub fn repository<R: WorkflowRepository + 'static>(mut self, repository: R) -> Self {
        self.repository = Some(BoxWorkflowRepository::new(repository));
        self
    }

    pub fn boxed_repository(mut self, repository: BoxWorkflowRepository) -> Self {
        self.repository = Some(repository);
        self
    }

    pub fn handlers(mut self, handlers: HandlerRegistry) -> Self {
        self.handlers = Some(handlers);
        self
    }

    pub fn transforms(mut self, transforms: TransformRegistry) -> Self {
        self.transforms = Some(transforms);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Engine {
        let bus = self
            .bus
            .unwrap_or_else(|| EventBus::new(self.config.event_capacity));
        let runtime = Runtime {
            handlers: self.handlers.unwrap_or_default(),
            resolver: VariableResolver::new(self.transforms.unwrap_or_default()),
            workflows: DashMap::new(),
            config: self.config,
        };
        Engine {
            inner: Arc::new(EngineInner {
                runtime: Arc::new(runtime),
                repository: self
                    .repository
                    .unwrap_or_else(|| BoxWorkflowRepository::new(InMemoryWorkflowRepository::new())),
                bus,
                cancellation_tokens: DashMap::new(),
                timers: DashMap::new(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The workflow engine.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    runtime: Arc<Runtime>,
    repository: BoxWorkflowRepository,
    bus: EventBus,
    /// Cancellation tokens of in-progress runs, keyed by run_id.
    cancellation_tokens: DashMap<Uuid, CancellationToken>,
    /// Armed suspension timeouts, keyed by suspension_id.
    timers: DashMap<Uuid, AbortHandle>,
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        for timer in self.timers.iter() {
            timer.value().abort();
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workflows", &self.workflow_ids())
            .field("active_runs", &self.inner.cancellation_tokens.len())
            .field("armed_timers", &self.inner.timers.len())
            .finish()
    }
}

impl Engine {
    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    /// Handlers available to agent and function steps.
    ///
    /// The registry is shared, so handlers registered after `build` are
    /// visible to subsequent runs.
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.inner.runtime.handlers
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.runtime.config
    }

    /// Subscribe to lifecycle events of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.inner.bus.subscribe()
    }

    // -- registry -----------------------------------------------------------

    /// Validate and register a workflow under `workflow_id`.
    ///
    /// Replaces any workflow registered under the same id. Runs already in
    /// flight keep the plan they started with.
    pub fn register_workflow(
        &self,
        workflow_id: &str,
        mut definition: WorkflowDefinition,
    ) -> Result<(), EngineError> {
        definition.id = workflow_id.to_string();
        let plan = WorkflowPlan::compile(definition)?;
        self.check_transforms(&plan)?;

        tracing::info!(
            workflow_id,
            steps = plan.definition().steps.len(),
            "workflow registered"
        );
        self.inner
            .runtime
            .workflows
            .insert(workflow_id.to_string(), Arc::new(plan));
        Ok(())
    }

    pub fn unregister_workflow(&self, workflow_id: &str) -> bool {
        let removed = self.inner.runtime.workflows.remove(workflow_id).is_some();
        if removed {
            tracing::info!(workflow_id, "workflow unregistered");
        }
        removed
    }

    /// Registered workflow ids, sorted.
    pub fn workflow_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .runtime
            .workflows
            .iter()
            .map(|e| e.key().clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn workflow(&self, workflow_id: &str) -> Option<WorkflowDefinition> {
        self.inner
            .runtime
            .plan(workflow_id)
            .map(|plan| plan.definition().clone())
    }

    fn check_transforms(&self, plan: &WorkflowPlan) -> Result<(), EngineError> {
        let transforms = self.inner.runtime.resolver.transforms();
        let check = |owner: &str, var: &VariableRef| match &var.transform {
            Some(name) if !transforms.contains(name) => Err(WorkflowError::Validation(format!(
                "'{owner}' uses unknown transform '{name}'"
            ))),
            _ => Ok(()),
        };

        for step in plan.all_steps() {
            for var in step.variables.values() {
                check(&step.id, var)?;
            }
            match &step.kind {
                StepKind::Loop { carry, .. } => {
                    for var in carry.values() {
                        check(&step.id, var)?;
                    }
                }
                StepKind::SubWorkflow { input, .. } => {
                    for var in input.values() {
                        check(&step.id, var)?;
                    }
                }
                _ => {}
            }
        }
        for var in plan.definition().output.values() {
            check(plan.id(), var)?;
        }
        Ok(())
    }

    // -- execution ----------------------------------------------------------

    /// Run a registered workflow to completion, failure or suspension.
    pub async fn execute_workflow(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
    ) -> Result<WorkflowResult, EngineError> {
        let sink = EventSink::new(self.inner.bus.clone());
        self.execute_with_sink(workflow_id, input, sink).await
    }

    /// Like `execute_workflow`, but yields the run's events in order.
    ///
    /// The stream ends after the terminal event. Dropping it does not stop
    /// the run. Errors that prevent the run from starting are reported as a
    /// single `failed` event with a nil run id.
    pub fn execute_stream(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
    ) -> impl Stream<Item = WorkflowEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        let workflow_id = workflow_id.to_string();
        tokio::spawn(async move {
            let sink = EventSink::with_stream(engine.inner.bus.clone(), tx.clone());
            if let Err(e) = engine.execute_with_sink(&workflow_id, input, sink).await {
                tracing::warn!(workflow_id = workflow_id.as_str(), error = %e, "streamed run failed");
                let _ = tx.send(WorkflowEvent::Failed {
                    workflow_id,
                    run_id: Uuid::nil(),
                    error: e.to_string(),
                });
            }
        });
        event_stream(rx)
    }

    async fn execute_with_sink(
        &self,
        workflow_id: &str,
        input: Map<String, Value>,
        sink: EventSink,
    ) -> Result<WorkflowResult, EngineError> {
        let plan = self
            .inner
            .runtime
            .plan(workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;

        let run_id = Uuid::now_v7();
        let mut ctx = WorkflowContext::new(workflow_id, run_id, input);
        ctx.init_steps(plan.all_steps().map(|s| s.id.as_str()));

        let now = Utc::now();
        self.inner
            .repository
            .save_run(&WorkflowRunRecord {
                workflow_id: workflow_id.to_string(),
                run_id,
                status: WorkflowRunStatus::Running,
                context: ctx.to_json()?,
                error: None,
                suspension_id: None,
                started_at: ctx.started_at,
                updated_at: now,
                completed_at: None,
            })
            .await?;

        let env = self.run_env(plan, run_id, sink);
        tracing::info!(workflow_id, run_id = %run_id, "workflow started");
        env.events.emit(WorkflowEvent::Started {
            workflow_id: workflow_id.to_string(),
            run_id,
        });

        let (ctx, outcome) = run_scope(env.clone(), None, ctx, None).await;
        self.finish(&env, ctx, outcome).await
    }

    fn run_env(&self, plan: Arc<WorkflowPlan>, run_id: Uuid, events: EventSink) -> RunEnv {
        let timeout = Duration::from_millis(self.run_timeout_ms(&plan));
        let now = Instant::now();
        let deadline = now
            .checked_add(timeout)
            .unwrap_or_else(|| now + Duration::from_secs(86_400 * 365 * 30));

        let cancel = CancellationToken::new();
        self.inner
            .cancellation_tokens
            .insert(run_id, cancel.clone());

        RunEnv {
            runtime: Arc::clone(&self.inner.runtime),
            plan,
            run_id,
            cancel,
            deadline,
            events,
            depth: 0,
        }
    }

    fn run_timeout_ms(&self, plan: &WorkflowPlan) -> u64 {
        plan.definition()
            .timeout_ms
            .unwrap_or(self.inner.runtime.config.workflow_timeout_ms)
    }

    /// Persist the outcome of a scheduling pass and build the caller's result.
    async fn finish(
        &self,
        env: &RunEnv,
        ctx: WorkflowContext,
        outcome: ScopeOutcome,
    ) -> Result<WorkflowResult, EngineError> {
        self.inner.cancellation_tokens.remove(&env.run_id);
        let workflow_id = env.workflow_id();
        let run_id = env.run_id;

        let mut output = Map::new();
        let mut suspension: Option<SuspensionRecord> = None;
        let (status, error) = match outcome {
            ScopeOutcome::Completed => {
                output = collect_output(&env.plan, &ctx, &env.runtime.resolver);
                (WorkflowRunStatus::Completed, None)
            }
            ScopeOutcome::Failed { step_id, error } => (
                WorkflowRunStatus::Failed,
                Some(format!("step '{step_id}' failed: {error}")),
            ),
            ScopeOutcome::Suspended(request) => {
                let record = build_record(request, &workflow_id, run_id, &ctx)?;
                self.inner.repository.put_suspension(&record).await?;
                tracing::debug!(
                    run_id = %run_id,
                    suspension_id = %record.suspension_id,
                    step_id = record.step_id.as_str(),
                    "suspension persisted"
                );
                let error = format!("workflow suspended at step '{}'", record.step_id);
                suspension = Some(record);
                (WorkflowRunStatus::Suspended, Some(error))
            }
            ScopeOutcome::Cancelled => (
                WorkflowRunStatus::Cancelled,
                Some("workflow run cancelled".to_string()),
            ),
            ScopeOutcome::TimedOut => {
                let err = EngineError::WorkflowTimeout {
                    workflow_id: workflow_id.clone(),
                    timeout_ms: self.run_timeout_ms(&env.plan),
                };
                (WorkflowRunStatus::Failed, Some(err.to_string()))
            }
        };

        let now = Utc::now();
        self.inner
            .repository
            .save_run(&WorkflowRunRecord {
                workflow_id: workflow_id.clone(),
                run_id,
                status,
                context: ctx.to_json()?,
                error: error.clone(),
                suspension_id: suspension.as_ref().map(|r| r.suspension_id),
                started_at: ctx.started_at,
                updated_at: now,
                completed_at: (status != WorkflowRunStatus::Suspended).then_some(now),
            })
            .await?;

        if let Some(record) = &suspension
            && let Some(timeout_at) = record.timeout_at
        {
            self.arm_timer(record.suspension_id, timeout_at);
        }

        let event = match (&suspension, status) {
            (Some(record), _) => WorkflowEvent::Suspended {
                workflow_id: workflow_id.clone(),
                run_id,
                step_id: record.step_id.clone(),
                suspension_id: record.suspension_id,
            },
            (None, WorkflowRunStatus::Completed) => WorkflowEvent::Completed {
                workflow_id: workflow_id.clone(),
                run_id,
                output: output.clone(),
            },
            (None, _) => WorkflowEvent::Failed {
                workflow_id: workflow_id.clone(),
                run_id,
                error: error.clone().unwrap_or_default(),
            },
        };
        env.events.emit(event);

        match status {
            WorkflowRunStatus::Completed => {
                tracing::info!(workflow_id = workflow_id.as_str(), run_id = %run_id, "workflow completed");
            }
            WorkflowRunStatus::Suspended => {
                tracing::info!(workflow_id = workflow_id.as_str(), run_id = %run_id, "workflow suspended");
            }
            _ => {
                tracing::info!(
                    workflow_id = workflow_id.as_str(),
                    run_id = %run_id,
                    status = %status,
                    error = error.as_deref().unwrap_or_default(),
                    "workflow ended"
                );
            }
        }

        let errors = ctx
            .steps
            .iter()
            .filter(|(_, r)| r.status == StepStatus::Error)
            .filter(|(id, _)| {
                env.plan
                    .step(id)
                    .is_some_and(|s| s.error_handling == ErrorHandlingMode::ContinueOnError)
            })
            .map(|(id, r)| StepErrorSummary {
                step_id: id.clone(),
                error: r.error.clone().unwrap_or_default(),
            })
            .collect();

        Ok(WorkflowResult {
            workflow_id,
            run_id,
            status,
            success: status == WorkflowRunStatus::Completed,
            output,
            error,
            errors,
            suspension_id: suspension.as_ref().map(|r| r.suspension_id),
            suspended_step: suspension.map(|r| r.step_id),
            steps: ctx.steps,
        })
    }

    // -- resumption ---------------------------------------------------------

    /// Resume a suspended run with free-form data.
    pub async fn resume_workflow(
        &self,
        suspension_id: Uuid,
        resume_data: Value,
    ) -> Result<WorkflowResult, EngineError> {
        let sink = EventSink::new(self.inner.bus.clone());
        self.resume_with(suspension_id, Continuation::Resume(resume_data), sink)
            .await
    }

    /// Resume a run suspended on a wait-for-event step.
    ///
    /// The event must be one the step listed; otherwise the suspension stays
    /// active and `InvalidEvent` is returned.
    pub async fn resume_workflow_with_event(
        &self,
        suspension_id: Uuid,
        event: &str,
        payload: Value,
    ) -> Result<WorkflowResult, EngineError> {
        let sink = EventSink::new(self.inner.bus.clone());
        let continuation = Continuation::Event {
            name: event.to_string(),
            payload,
        };
        self.resume_with(suspension_id, continuation, sink).await
    }

    /// Streaming form of `resume_workflow` / `resume_workflow_with_event`.
    pub fn resume_stream(
        &self,
        suspension_id: Uuid,
        input: ResumeInput,
    ) -> impl Stream<Item = WorkflowEvent> + Send + 'static {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = self.clone();
        tokio::spawn(async move {
            let sink = EventSink::with_stream(engine.inner.bus.clone(), tx.clone());
            if let Err(e) = engine.resume_with(suspension_id, input.into(), sink).await {
                tracing::warn!(suspension_id = %suspension_id, error = %e, "streamed resume failed");
                let _ = tx.send(WorkflowEvent::Failed {
                    workflow_id: String::new(),
                    run_id: Uuid::nil(),
                    error: e.to_string(),
                });
            }
        });
        event_stream(rx)
    }

    async fn resume_with(
        &self,
        suspension_id: Uuid,
        continuation: Continuation,
        sink: EventSink,
    ) -> Result<WorkflowResult, EngineError> {
        let record = self
            .inner
            .repository
            .get_suspension(&suspension_id)
            .await?
            .filter(|r| r.status != SuspensionStatus::Abandoned)
            .ok_or(EngineError::UnknownSuspension(suspension_id))?;
        let plan = self
            .inner
            .runtime
            .plan(&record.workflow_id)
            .ok_or_else(|| EngineError::WorkflowNotFound(record.workflow_id.clone()))?;
        validate_continuation(&self.inner.runtime, &plan, &record, &continuation, suspension_id)?;

        let record = self.claim(suspension_id).await?;
        self.cancel_timer(&suspension_id);

        let result = self.continue_claimed(plan, &record, continuation, sink).await;
        self.settle(suspension_id, result.is_ok()).await;
        result
    }

    async fn claim(&self, suspension_id: Uuid) -> Result<SuspensionRecord, EngineError> {
        self.inner
            .repository
            .claim_suspension(&suspension_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::UnknownSuspension(suspension_id),
                RepositoryError::Conflict(_) => EngineError::DuplicateResume(suspension_id),
                other => EngineError::Storage(other),
            })
    }

    async fn continue_claimed(
        &self,
        plan: Arc<WorkflowPlan>,
        record: &SuspensionRecord,
        continuation: Continuation,
        sink: EventSink,
    ) -> Result<WorkflowResult, EngineError> {
        let ctx = WorkflowContext::from_json(record.context.clone())
            .map_err(|e| EngineError::Context(e.to_string()))?;
        let env = self.run_env(plan, record.run_id, sink);

        tracing::info!(
            workflow_id = record.workflow_id.as_str(),
            run_id = %record.run_id,
            suspension_id = %record.suspension_id,
            step_id = record.step_id.as_str(),
            "workflow resumed"
        );
        env.events.emit(WorkflowEvent::Resumed {
            workflow_id: record.workflow_id.clone(),
            run_id: record.run_id,
            suspension_id: record.suspension_id,
        });

        let seed = match continue_step(&env, record, &ctx, continuation).await {
            Ok(seed) => seed,
            Err(e) => {
                self.inner.cancellation_tokens.remove(&env.run_id);
                return Err(e);
            }
        };
        let (ctx, outcome) = run_scope(env.clone(), None, ctx, Some(seed)).await;
        self.finish(&env, ctx, outcome).await
    }

    /// Delete a consumed suspension, or hand it back after a failed attempt.
    async fn settle(&self, suspension_id: Uuid, consumed: bool) {
        let result = if consumed {
            self.inner
                .repository
                .delete_suspension(&suspension_id)
                .await
                .map(|_| ())
        } else {
            self.inner
                .repository
                .release_suspension(&suspension_id)
                .await
        };
        if let Err(e) = result {
            tracing::warn!(
                suspension_id = %suspension_id,
                consumed,
                error = %e,
                "failed to settle suspension record"
            );
        }
    }

    // -- suspension timeouts ------------------------------------------------

    fn arm_timer(&self, suspension_id: Uuid, timeout_at: DateTime<Utc>) {
        let delay = (timeout_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = engine.upgrade() {
                Engine { inner }.fire_timeout(suspension_id).await;
            }
        });

        tracing::debug!(
            suspension_id = %suspension_id,
            delay_ms = delay.as_millis() as u64,
            "suspension timer armed"
        );
        if let Some(previous) = self
            .inner
            .timers
            .insert(suspension_id, task.abort_handle())
        {
            previous.abort();
        }
    }

    fn cancel_timer(&self, suspension_id: &Uuid) {
        if let Some((_, timer)) = self.inner.timers.remove(suspension_id) {
            timer.abort();
        }
    }

    async fn fire_timeout(&self, suspension_id: Uuid) {
        // Never abort the task we are running on.
        self.inner.timers.remove(&suspension_id);

        let record = match self.inner.repository.claim_suspension(&suspension_id).await {
            Ok(record) => record,
            Err(RepositoryError::NotFound | RepositoryError::Conflict(_)) => {
                tracing::debug!(
                    suspension_id = %suspension_id,
                    "suspension already resumed, timeout ignored"
                );
                return;
            }
            Err(e) => {
                tracing::warn!(suspension_id = %suspension_id, error = %e, "failed to claim timed-out suspension");
                return;
            }
        };

        let timeout = EngineError::SuspensionTimeout {
            suspension_id,
            step_id: record.step_id.clone(),
        };
        tracing::warn!(
            run_id = %record.run_id,
            suspension_id = %suspension_id,
            error = %timeout,
            "running timeout fallback"
        );

        let Some(plan) = self.inner.runtime.plan(&record.workflow_id) else {
            tracing::warn!(
                workflow_id = record.workflow_id.as_str(),
                suspension_id = %suspension_id,
                "workflow no longer registered, timeout left pending"
            );
            self.settle(suspension_id, false).await;
            return;
        };

        let sink = EventSink::new(self.inner.bus.clone());
        let result = self
            .continue_claimed(plan, &record, Continuation::Timeout, sink)
            .await;
        if let Err(e) = &result {
            tracing::warn!(suspension_id = %suspension_id, error = %e, "timeout fallback failed");
        }
        self.settle(suspension_id, result.is_ok()).await;
    }

    /// Arm timers for persisted suspensions, e.g. after a restart.
    ///
    /// Timeouts that passed while nothing was running fire immediately.
    /// Returns the number of timers armed.
    pub async fn recover_timeouts(&self) -> Result<usize, EngineError> {
        let records = self.inner.repository.list_suspensions().await?;
        let mut armed = 0;
        for record in records {
            if let Some(timeout_at) = record.timeout_at {
                self.arm_timer(record.suspension_id, timeout_at);
                armed += 1;
            }
        }
        tracing::info!(armed, "suspension timers recovered");
        Ok(armed)
    }

    // -- control ------------------------------------------------------------

    /// Cancel an in-progress run. Returns false when the run is not active.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.inner.cancellation_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                tracing::info!(run_id = %run_id, "workflow cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Abort a suspended run; later resumes fail with `UnknownSuspension`.
    pub async fn abandon(&self, suspension_id: Uuid) -> Result<(), EngineError> {
        let record = self
            .inner
            .repository
            .abandon_suspension(&suspension_id)
            .await
            .map_err(|e| match e {
                RepositoryError::NotFound => EngineError::UnknownSuspension(suspension_id),
                RepositoryError::Conflict(_) => EngineError::DuplicateResume(suspension_id),
                other => EngineError::Storage(other),
            })?;
        self.cancel_timer(&suspension_id);

        let error = "suspension abandoned".to_string();
        if let Some(mut run) = self
            .inner
            .repository
            .get_run(&record.workflow_id, &record.run_id)
            .await?
        {
            let now = Utc::now();
            run.status = WorkflowRunStatus::Cancelled;
            run.error = Some(error.clone());
            run.updated_at = now;
            run.completed_at = Some(now);
            self.inner.repository.save_run(&run).await?;
        }

        tracing::info!(
            run_id = %record.run_id,
            suspension_id = %suspension_id,
            "suspension abandoned"
        );
        self.inner.bus.publish(WorkflowEvent::Failed {
            workflow_id: record.workflow_id,
            run_id: record.run_id,
            error,
        });
        Ok(())
    }

    // -- introspection ------------------------------------------------------

    /// Active suspensions, oldest first.
    pub async fn get_suspended_workflows(&self) -> Result<Vec<SuspensionSummary>, EngineError> {
        let records = self.inner.repository.list_suspensions().await?;
        Ok(records.iter().map(SuspensionSummary::from).collect())
    }

    /// Runs of a workflow, newest first.
    pub async fn get_workflow_runs(
        &self,
        workflow_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<WorkflowRunRecord>, EngineError> {
        Ok(self.inner.repository.list_runs(workflow_id, limit).await?)
    }

    pub async fn get_workflow_state(
        &self,
        workflow_id: &str,
        run_id: Uuid,
    ) -> Result<WorkflowRunRecord, EngineError> {
        self.inner
            .repository
            .get_run(workflow_id, &run_id)
            .await?
            .ok_or_else(|| EngineError::RunNotFound {
                workflow_id: workflow_id.to_string(),
                run_id,
            })
    }
}

/// Forward a run's events until (and including) the terminal one.
fn event_stream(
    mut rx: mpsc::UnboundedReceiver<WorkflowEvent>,
) -> impl Stream<Item = WorkflowEvent> + Send + 'static {
    async_stream::stream! {
        while let Some(event) = rx.recv().await {
            let terminal = event.is_terminal();
            yield event;
            if terminal {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::step::builtin::register_builtins;
    use crate::step::{StepFailure, StepHandler, StepInput, StepOutcome};
    use futures_util::StreamExt;
    use serde_json::json;

    /// Sleeps `config.ms` milliseconds.
    struct SleepHandler;

    impl StepHandler for SleepHandler {
        async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
            let ms = input.config.get("ms").and_then(Value::as_u64).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(StepOutcome::Completed(json!({ "slept": ms })))
        }
    }

    /// Returns `{ value: variables.current + 1 }`.
    struct Increment;

    impl StepHandler for Increment {
        async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
            let current = input
                .variables
                .get("current")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(StepOutcome::Completed(json!({ "value": current + 1 })))
        }
    }

    /// Drafts something, then waits for a reviewer.
    struct Gate;

    impl StepHandler for Gate {
        async fn execute(&self, _input: StepInput) -> Result<StepOutcome, StepFailure> {
            Ok(StepOutcome::suspend(json!({ "draft": "v1" }), "needs review"))
        }
    }

    fn engine() -> Engine {
        let handlers = HandlerRegistry::new();
        register_builtins(&handlers);
        handlers.register_function("sleep", SleepHandler);
        handlers.register_function("increment", Increment);
        handlers.register_function("gate", Gate);
        Engine::builder().handlers(handlers).build()
    }

    fn def(yaml: &str) -> WorkflowDefinition {
        serde_yaml_ng::from_str(yaml).unwrap()
    }

    fn register(engine: &Engine, yaml: &str) -> String {
        let definition = def(yaml);
        let id = definition.id.clone();
        engine.register_workflow(&id, definition).unwrap();
        id
    }

    fn drain(rx: &mut broadcast::Receiver<WorkflowEvent>, run_id: Uuid) -> Vec<WorkflowEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.run_id() == run_id {
                events.push(event);
            }
        }
        events
    }

    fn position(events: &[WorkflowEvent], name: &str, step: &str) -> usize {
        events
            .iter()
            .position(|e| {
                e.name() == name
                    && match e {
                        WorkflowEvent::StepStarted { step_id, .. }
                        | WorkflowEvent::StepCompleted { step_id, .. } => step_id == step,
                        _ => false,
                    }
            })
            .unwrap_or_else(|| panic!("no {name} event for {step}"))
    }

    const DRAFT: &str = r#"
id: draft
steps:
  - id: write
    kind: { type: function, handler: gate }
  - id: publish
    after: [write]
    variables:
      draft: $.steps.write.output.draft
    kind: { type: function, handler: echo }
"#;

    #[tokio::test]
    async fn test_cycle_rejected_at_registration() {
        let engine = engine();
        let err = engine
            .register_workflow(
                "cyclic",
                def(r#"
id: cyclic
steps:
  - id: a
    after: [c]
    kind: { type: function, handler: echo }
  - id: b
    after: [a]
    kind: { type: function, handler: echo }
  - id: c
    after: [b]
    kind: { type: function, handler: echo }
"#),
            )
            .unwrap_err();
        match err {
            EngineError::Workflow(WorkflowError::CyclicDependency { cycle }) => {
                assert_eq!(cycle.len(), 4);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle error, got {other:?}"),
        }
        assert!(engine.workflow_ids().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_transform_rejected() {
        let engine = engine();
        let err = engine
            .register_workflow(
                "t",
                def(r#"
id: t
steps:
  - id: a
    variables:
      name: { path: $.input.name, transform: shout }
    kind: { type: function, handler: echo }
"#),
            )
            .unwrap_err();
        assert!(err.to_string().contains("shout"));
    }

    #[tokio::test]
    async fn test_unregistered_workflow() {
        let engine = engine();
        let err = engine.execute_workflow("missing", Map::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::WorkflowNotFound(id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_skipped_predecessor_satisfies_dependent() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: branching
steps:
  - id: check
    kind:
      type: conditional
      condition: { truthy: $.input.flag }
      on_true: [a]
      on_false: [b]
  - id: a
    kind: { type: function, handler: echo }
  - id: b
    kind: { type: function, handler: echo }
  - id: c
    after: [a]
    kind: { type: function, handler: echo }
"#,
        );

        let result = engine
            .execute_workflow(&id, json!({ "flag": false }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_status("a"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("b"), Some(StepStatus::Success));
        assert_eq!(result.step_status("c"), Some(StepStatus::Success));
    }

    #[tokio::test]
    async fn test_scenario_a_join_waits_for_both_predecessors() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: join
steps:
  - id: a
    kind: { type: function, handler: sleep, config: { ms: 80 } }
  - id: b
    kind: { type: function, handler: sleep, config: { ms: 10 } }
  - id: fast
    after: [b]
    kind: { type: function, handler: echo }
  - id: c
    after: [a, b]
    kind: { type: function, handler: echo }
"#,
        );
        let mut rx = engine.subscribe();

        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(result.success);
        let events = drain(&mut rx, result.run_id);

        let c_started = position(&events, "step_started", "c");
        assert!(position(&events, "step_completed", "a") < c_started);
        assert!(position(&events, "step_completed", "b") < c_started);
        // Siblings start together.
        assert!(position(&events, "step_started", "b") < position(&events, "step_completed", "a"));
        // A fast branch is not held back by its slow sibling.
        assert!(position(&events, "step_completed", "fast") < position(&events, "step_completed", "a"));
    }

    #[tokio::test]
    async fn test_scenario_b_inactive_branch_skipped() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: review
steps:
  - id: gate
    kind:
      type: conditional
      condition:
        expr: "$.input.score >= 8"
      on_true: [publish]
      on_false: [revise]
  - id: publish
    kind: { type: function, handler: constant, config: { value: published } }
  - id: revise
    kind: { type: function, handler: constant, config: { value: revised } }
"#,
        );

        let result = engine
            .execute_workflow(&id, json!({ "score": 5 }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.step_status("publish"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("revise"), Some(StepStatus::Success));
        assert_eq!(Value::Object(result.output), json!({ "revise": "revised" }));
        assert_eq!(
            result.steps["gate"].output,
            Some(json!({ "result": false, "branch": "on_false" }))
        );
    }

    #[tokio::test]
    async fn test_output_default_for_untaken_branch() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: review_defaults
output:
  published: { path: $.steps.publish.output, default: none }
  revised: $.steps.revise.output
steps:
  - id: gate
    kind:
      type: conditional
      condition:
        expr: "$.input.score >= 8"
      on_true: [publish]
      on_false: [revise]
  - id: publish
    kind: { type: function, handler: constant, config: { value: published } }
  - id: revise
    kind: { type: function, handler: constant, config: { value: revised } }
"#,
        );

        let result = engine
            .execute_workflow(&id, json!({ "score": 3 }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_status("publish"), Some(StepStatus::Skipped));
        assert_eq!(
            Value::Object(result.output),
            json!({ "published": "none", "revised": "revised" })
        );
    }

    #[tokio::test]
    async fn test_skipped_conditional_activates_no_branch() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: optional_gate
steps:
  - id: gate
    condition:
      truthy: $.input.enabled
    kind:
      type: conditional
      condition: { truthy: $.input.approved }
      on_true: [publish]
      on_false: [revise]
  - id: publish
    kind: { type: function, handler: echo }
  - id: revise
    kind: { type: function, handler: echo }
  - id: report
    after: [gate]
    kind: { type: function, handler: echo }
"#,
        );
        let mut rx = engine.subscribe();

        let result = engine
            .execute_workflow(&id, json!({ "enabled": false }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(result.step_status("gate"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("publish"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("revise"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("report"), Some(StepStatus::Success));

        let skipped = drain(&mut rx, result.run_id)
            .into_iter()
            .filter(|e| matches!(e, WorkflowEvent::StepSkipped { .. }))
            .count();
        assert_eq!(skipped, 3);
    }

    #[tokio::test]
    async fn test_skipped_human_step_skips_timeout_fallback() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: optional_review
steps:
  - id: review
    condition: { truthy: $.input.needs_review }
    kind:
      type: human
      prompt: Check it
      timeout_ms: 50
      on_timeout: [escalate]
  - id: escalate
    kind: { type: function, handler: echo }
  - id: ship
    after: [review]
    kind: { type: function, handler: echo }
"#,
        );

        let result = engine
            .execute_workflow(&id, json!({ "needs_review": false }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Completed);
        assert!(result.suspension_id.is_none());
        assert_eq!(result.step_status("review"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("escalate"), Some(StepStatus::Skipped));
        assert_eq!(result.step_status("ship"), Some(StepStatus::Success));
        assert!(engine.get_suspended_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_scenario_c_retry_then_success() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: flaky
steps:
  - id: call
    retry:
      max_attempts: 3
      backoff: { type: constant, delay_ms: 100 }
    kind: { type: function, handler: fail, config: { succeed_after: 2 } }
"#,
        );
        let mut rx = engine.subscribe();

        let started = std::time::Instant::now();
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(result.success);
        assert!(started.elapsed() >= Duration::from_millis(200));

        let call = &result.steps["call"];
        assert_eq!(call.status, StepStatus::Success);
        assert_eq!(call.attempts, 3);
        assert_eq!(call.output, Some(json!({ "attempts": 3 })));

        let events = drain(&mut rx, result.run_id);
        let attempts = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepStarted { .. }))
            .count();
        let retries = events
            .iter()
            .filter(|e| matches!(e, WorkflowEvent::StepFailed { will_retry: true, .. }))
            .count();
        assert_eq!(attempts, 3);
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: perm
steps:
  - id: call
    retry: { max_attempts: 5, backoff: { type: constant, delay_ms: 10 } }
    kind: { type: function, handler: fail, config: { kind: permanent, message: nope } }
"#,
        );
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.steps["call"].attempts, 1);
        assert_eq!(result.error.as_deref(), Some("step 'call' failed: nope"));
    }

    #[tokio::test]
    async fn test_loop_runs_until_predicate_false() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: counter
steps:
  - id: count
    kind:
      type: loop
      condition:
        expr: "$.variables.iterationCount < 5"
      body: [inc]
      max_iterations: 50
      carry:
        iterationCount: $.steps.inc.output.value
      initial:
        iterationCount: 0
  - id: inc
    variables:
      current: $.variables.iterationCount
    kind: { type: function, handler: increment }
"#,
        );

        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(result.success, "{:?}", result.error);
        let output = result.steps["count"].output.clone().unwrap();
        assert_eq!(output["iterations"], 5);
        assert_eq!(output["completed"], true);
        assert_eq!(output["capped"], false);
        assert_eq!(output["variables"]["iterationCount"], 5);
        assert_eq!(result.steps["inc"].output, Some(json!({ "value": 5 })));
    }

    #[tokio::test]
    async fn test_loop_cap_enforced() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: forever
steps:
  - id: spin
    kind:
      type: loop
      condition: always
      body: [tick]
      max_iterations: 3
  - id: tick
    kind: { type: function, handler: echo }
"#,
        );

        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(result.success);
        let output = result.steps["spin"].output.clone().unwrap();
        assert_eq!(output["iterations"], 3);
        assert_eq!(output["capped"], true);
        assert_eq!(output["completed"], false);
    }

    #[tokio::test]
    async fn test_suspend_resume_round_trip() {
        let engine = engine();
        let id = register(&engine, DRAFT);

        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert_eq!(suspended.status, WorkflowRunStatus::Suspended);
        assert!(!suspended.success);
        assert!(suspended.error.is_some());
        assert_eq!(suspended.suspended_step.as_deref(), Some("write"));
        assert_eq!(suspended.step_status("publish"), Some(StepStatus::Pending));
        let suspension_id = suspended.suspension_id.unwrap();

        let pending = engine.get_suspended_workflows().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].reason.as_deref(), Some("needs review"));

        let state = engine
            .get_workflow_state(&id, suspended.run_id)
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowRunStatus::Suspended);
        let before = WorkflowContext::from_json(state.context).unwrap();
        assert_eq!(before.steps, suspended.steps);
        assert_eq!(before.run_id, suspended.run_id);
        assert_eq!(before.steps["write"].status, StepStatus::Suspended);
        assert_eq!(before.steps["write"].attempts, 1);

        // The snapshot a resume restores is the context as it stood.
        let record = engine
            .inner
            .repository
            .get_suspension(&suspension_id)
            .await
            .unwrap()
            .unwrap();
        let restored = WorkflowContext::from_json(record.context).unwrap();
        assert_eq!(restored, before);
        assert_eq!(
            WorkflowContext::from_json(restored.to_json().unwrap()).unwrap(),
            restored
        );

        let resumed = engine
            .resume_workflow(suspension_id, json!({}))
            .await
            .unwrap();
        assert!(resumed.success, "{:?}", resumed.error);
        assert_eq!(resumed.run_id, suspended.run_id);
        assert_eq!(resumed.steps["write"].output, before.steps["write"].output);
        assert_eq!(resumed.steps["publish"].output, Some(json!({ "draft": "v1" })));

        assert!(engine.get_suspended_workflows().await.unwrap().is_empty());
        let err = engine
            .resume_workflow(suspension_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSuspension(_)));
    }

    #[tokio::test]
    async fn test_resume_data_merged_into_output() {
        let engine = engine();
        let id = register(&engine, DRAFT);
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();

        let resumed = engine
            .resume_workflow(suspended.suspension_id.unwrap(), json!({ "approved": true }))
            .await
            .unwrap();
        assert_eq!(
            resumed.steps["write"].output,
            Some(json!({ "draft": "v1", "approved": true }))
        );
    }

    #[tokio::test]
    async fn test_concurrent_resume_exactly_one_wins() {
        let engine = engine();
        let id = register(&engine, DRAFT);
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();
        let suspension_id = suspended.suspension_id.unwrap();

        let (first, second) = tokio::join!(
            engine.resume_workflow(suspension_id, json!({})),
            engine.resume_workflow(suspension_id, json!({})),
        );
        let results = [first, second];
        let wins = results.iter().filter(|r| r.is_ok()).count();
        let duplicates = results
            .iter()
            .filter(|r| matches!(r, Err(EngineError::DuplicateResume(_))))
            .count();
        assert_eq!(wins, 1);
        assert_eq!(duplicates, 1);
    }

    #[tokio::test]
    async fn test_scenario_d_human_timeout_runs_fallback() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: approval
steps:
  - id: approve
    kind:
      type: human
      prompt: "Ship {{ $.input.item }}?"
      timeout_ms: 200
      on_timeout: [fallback]
  - id: ship
    after: [approve]
    kind: { type: function, handler: echo }
  - id: fallback
    kind: { type: function, handler: constant, config: { value: escalated } }
"#,
        );
        let mut rx = engine.subscribe();

        let suspended = engine
            .execute_workflow(&id, json!({ "item": "v2" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(suspended.status, WorkflowRunStatus::Suspended);
        assert_eq!(
            suspended.steps["approve"].suspension,
            Some(json!({ "prompt": "Ship v2?", "timeout_ms": 200 }))
        );

        let completed = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                match rx.recv().await {
                    Ok(WorkflowEvent::Completed { run_id, .. }) if run_id == suspended.run_id => break,
                    Ok(_) => continue,
                    Err(e) => panic!("event bus closed: {e}"),
                }
            }
        })
        .await;
        assert!(completed.is_ok(), "timeout fallback never ran");

        let state = engine
            .get_workflow_state(&id, suspended.run_id)
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowRunStatus::Completed);
        let ctx = WorkflowContext::from_json(state.context).unwrap();
        assert_eq!(ctx.status("fallback"), StepStatus::Success);
        assert_eq!(ctx.status("ship"), StepStatus::Skipped);
        assert_eq!(
            ctx.output("approve"),
            Some(&json!({ "prompt": "Ship v2?", "response": null, "timed_out": true }))
        );
        assert!(engine.get_suspended_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_human_response_skips_fallback() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: approval
steps:
  - id: approve
    kind: { type: human, prompt: "ok?", timeout_ms: 60000, on_timeout: [fallback] }
  - id: ship
    after: [approve]
    variables:
      answer: $.steps.approve.output.response
    kind: { type: function, handler: echo }
  - id: fallback
    kind: { type: function, handler: echo }
"#,
        );
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();
        let result = engine
            .resume_workflow(suspended.suspension_id.unwrap(), json!("yes"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.step_status("fallback"), Some(StepStatus::Skipped));
        assert_eq!(result.steps["ship"].output, Some(json!({ "answer": "yes" })));
    }

    #[tokio::test]
    async fn test_wait_for_event_branches() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: signals
steps:
  - id: wait
    kind:
      type: wait_for_event
      events: [approved, rejected]
      branches:
        approved: [ship]
        rejected: [revise]
  - id: ship
    kind: { type: function, handler: constant, config: { value: shipped } }
  - id: revise
    kind: { type: function, handler: constant, config: { value: revised } }
"#,
        );
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();
        let suspension_id = suspended.suspension_id.unwrap();

        let err = engine
            .resume_workflow(suspension_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidResume { .. }));
        let err = engine
            .resume_workflow_with_event(suspension_id, "bogus", Value::Null)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidEvent { ref event, .. } if event == "bogus"));
        assert_eq!(engine.get_suspended_workflows().await.unwrap().len(), 1);

        let result = engine
            .resume_workflow_with_event(suspension_id, "approved", json!({ "by": "ana" }))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.step_status("ship"), Some(StepStatus::Success));
        assert_eq!(result.step_status("revise"), Some(StepStatus::Skipped));
        assert_eq!(
            result.steps["wait"].output,
            Some(json!({ "event": "approved", "payload": { "by": "ana" }, "timed_out": false }))
        );
    }

    #[tokio::test]
    async fn test_error_handling_modes() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: modes
steps:
  - id: flaky
    error_handling: continue_on_error
    kind: { type: function, handler: fail, config: { message: boom } }
  - id: quiet
    error_handling: ignore_error
    kind: { type: function, handler: fail }
  - id: after_both
    after: [flaky, quiet]
    kind: { type: function, handler: echo }
"#,
        );
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(result.success);
        assert_eq!(result.step_status("after_both"), Some(StepStatus::Success));
        assert_eq!(
            result.errors,
            vec![StepErrorSummary {
                step_id: "flaky".to_string(),
                error: "boom".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_fail_workflow_aborts_in_flight_siblings() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: fatal
steps:
  - id: bad
    kind: { type: function, handler: fail, config: { message: broken } }
  - id: slow
    kind: { type: function, handler: sleep, config: { ms: 10000 } }
  - id: never
    after: [bad]
    kind: { type: function, handler: echo }
"#,
        );
        let started = std::time::Instant::now();
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("step 'bad' failed: broken"));
        assert_eq!(result.step_status("slow"), Some(StepStatus::Error));
        assert_eq!(result.step_status("never"), Some(StepStatus::Pending));
    }

    #[tokio::test]
    async fn test_workflow_timeout() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: slow
timeout_ms: 100
steps:
  - id: nap
    kind: { type: function, handler: sleep, config: { ms: 10000 } }
"#,
        );
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Failed);
        assert!(result.error.unwrap().contains("timed out after 100ms"));
    }

    #[tokio::test]
    async fn test_cancel_running_workflow() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: long
steps:
  - id: nap
    kind: { type: function, handler: sleep, config: { ms: 10000 } }
"#,
        );
        let mut rx = engine.subscribe();
        let runner = engine.clone();
        let handle = tokio::spawn(async move { runner.execute_workflow(&id, Map::new()).await });

        let run_id = loop {
            if let Ok(WorkflowEvent::StepStarted { run_id, .. }) = rx.recv().await {
                break run_id;
            }
        };
        assert!(engine.cancel(run_id));

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.status, WorkflowRunStatus::Cancelled);
        assert!(!engine.cancel(run_id));
    }

    #[tokio::test]
    async fn test_sub_workflow_suspends_and_resumes_parent() {
        let engine = engine();
        register(
            &engine,
            r#"
id: child
steps:
  - id: ask
    kind: { type: human, prompt: "name?" }
  - id: done
    after: [ask]
    variables:
      answer: $.steps.ask.output.response
    kind: { type: function, handler: echo }
"#,
        );
        let parent = register(
            &engine,
            r#"
id: parent
steps:
  - id: delegate
    kind: { type: sub_workflow, workflow: child }
  - id: report
    after: [delegate]
    variables:
      answer: $.steps.delegate.output.done.answer
    kind: { type: function, handler: echo }
"#,
        );

        let suspended = engine.execute_workflow(&parent, Map::new()).await.unwrap();
        assert_eq!(suspended.status, WorkflowRunStatus::Suspended);
        assert_eq!(suspended.suspended_step.as_deref(), Some("delegate"));
        let pending = engine.get_suspended_workflows().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].workflow_id, "parent");

        let result = engine
            .resume_workflow(suspended.suspension_id.unwrap(), json!("weaver"))
            .await
            .unwrap();
        assert!(result.success, "{:?}", result.error);
        assert_eq!(
            result.steps["delegate"].output,
            Some(json!({ "done": { "answer": "weaver" } }))
        );
        assert_eq!(result.steps["report"].output, Some(json!({ "answer": "weaver" })));
    }

    #[tokio::test]
    async fn test_sub_workflow_depth_limited() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: recursive
steps:
  - id: again
    kind: { type: sub_workflow, workflow: recursive }
"#,
        );
        let result = engine.execute_workflow(&id, Map::new()).await.unwrap();
        assert!(!result.success);
        assert!(result.error.unwrap().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_abandon_rejects_later_resume() {
        let engine = engine();
        let id = register(&engine, DRAFT);
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();
        let suspension_id = suspended.suspension_id.unwrap();

        engine.abandon(suspension_id).await.unwrap();
        let err = engine
            .resume_workflow(suspension_id, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownSuspension(_)));

        let state = engine
            .get_workflow_state(&id, suspended.run_id)
            .await
            .unwrap();
        assert_eq!(state.status, WorkflowRunStatus::Cancelled);
        assert!(engine.get_suspended_workflows().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_stream_ends_with_terminal_event() {
        let engine = engine();
        let id = register(
            &engine,
            r#"
id: simple
steps:
  - id: a
    kind: { type: function, handler: echo, config: { x: 1 } }
"#,
        );
        let events: Vec<WorkflowEvent> = engine.execute_stream(&id, Map::new()).collect().await;
        let names: Vec<&str> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["started", "step_started", "step_completed", "completed"]
        );

        let runs = engine.get_workflow_runs(&id, None).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, WorkflowRunStatus::Completed);
    }

    #[tokio::test]
    async fn test_resume_stream() {
        let engine = engine();
        let id = register(&engine, DRAFT);
        let suspended = engine.execute_workflow(&id, Map::new()).await.unwrap();

        let events: Vec<WorkflowEvent> = engine
            .resume_stream(
                suspended.suspension_id.unwrap(),
                ResumeInput::Data(json!({})),
            )
            .collect()
            .await;
        assert_eq!(events.first().map(|e| e.name()), Some("resumed"));
        assert_eq!(events.last().map(|e| e.name()), Some("completed"));
    }
}

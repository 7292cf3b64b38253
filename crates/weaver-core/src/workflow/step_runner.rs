//! Step workers for every step kind.
//!
//! `run_step` is what the scheduler spawns. It resolves the step's
//! variables from its context snapshot, runs the kind-specific logic, and
//! returns a `StepReport`; it never mutates shared state.
//!
//! Agent and function steps go through `run_attempts`, which applies the
//! per-attempt timeout and the retry policy. Backoff sleeps happen here, in
//! the worker, so sibling steps keep running.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;
use weaver_types::condition::Condition;
use weaver_types::variable::VariableRef;
use weaver_types::workflow::{
    FailureKind, RetryPolicy, StepDefinition, StepKind, StepResult, SuspensionKind,
};

use crate::step::{BoxStepHandler, StepFailure, StepInput, StepOutcome};

use super::condition::evaluate;
use super::context::WorkflowContext;
use super::resolver::ResolveError;
use super::retry::RetryHandler;
use super::scheduler::{collect_output, run_scope, RunEnv, ScopeOutcome, StepReport};
use super::suspension::{build_record, SuspendRequest};

/// Execute one step against a context snapshot.
pub(crate) async fn run_step(env: RunEnv, step: StepDefinition, ctx: WorkflowContext) -> StepReport {
    match &step.kind {
        StepKind::Agent { .. } | StepKind::Function { .. } => {
            run_handler_step(&env, &step, &ctx).await
        }
        StepKind::Conditional {
            condition,
            on_true,
            on_false,
        } => run_conditional(&env, &step, &ctx, condition, on_true, on_false),
        StepKind::Loop {
            condition,
            max_iterations,
            carry,
            initial,
            ..
        } => run_loop(&env, &step, ctx, condition, *max_iterations, carry, initial).await,
        StepKind::SubWorkflow { workflow, input } => {
            run_sub_workflow(&env, &step, &ctx, workflow, input).await
        }
        StepKind::Human { prompt, timeout_ms, .. } => suspend_human(&env, &step, &ctx, prompt, *timeout_ms),
        StepKind::WaitForEvent {
            events, timeout_ms, ..
        } => suspend_for_event(&env, &step, events, *timeout_ms),
    }
}

// ---------------------------------------------------------------------------
// Agent / function steps
// ---------------------------------------------------------------------------

async fn run_handler_step(env: &RunEnv, step: &StepDefinition, ctx: &WorkflowContext) -> StepReport {
    let (handler, variables, config) = match prepare_handler(env, step, ctx) {
        Ok(prepared) => prepared,
        Err(failure) => {
            env.step_started(&step.id, 1);
            return StepReport::failed(&step.id, failure.message, failure.kind, 1);
        }
    };

    let (result, attempts) = run_attempts(env, step, |attempt| {
        let handler = handler.clone();
        let input = step_input(env, step, attempt, variables.clone(), config.clone());
        async move { handler.execute(input).await }
    })
    .await;
    handler_report(step, result, attempts)
}

/// Continue a handler step that suspended, feeding it the resume data.
pub(crate) async fn resume_handler_step(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    resume_data: Value,
) -> StepReport {
    let partial = ctx.output(&step.id).cloned().unwrap_or(Value::Null);
    let (handler, variables, config) = match prepare_handler(env, step, ctx) {
        Ok(prepared) => prepared,
        Err(failure) => return StepReport::failed(&step.id, failure.message, failure.kind, 1),
    };

    let (result, attempts) = run_attempts(env, step, |attempt| {
        let handler = handler.clone();
        let input = step_input(env, step, attempt, variables.clone(), config.clone());
        let partial = partial.clone();
        let data = resume_data.clone();
        async move { handler.resume(input, partial, data).await }
    })
    .await;
    handler_report(step, result, attempts)
}

fn prepare_handler(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: &WorkflowContext,
) -> Result<(BoxStepHandler, Map<String, Value>, Value), StepFailure> {
    let scope = ctx.scope();
    let variables = env
        .runtime
        .resolver
        .resolve_all(&step.variables, &scope)
        .map_err(resolve_failure)?;

    match &step.kind {
        StepKind::Agent {
            agent,
            instructions,
        } => {
            let handler = env.runtime.handlers.agent(agent).ok_or_else(|| {
                StepFailure::permanent(format!("no agent registered under '{agent}'"))
            })?;
            let instructions = env.runtime.resolver.render(instructions, &scope);
            Ok((
                handler,
                variables,
                json!({ "agent": agent, "instructions": instructions }),
            ))
        }
        StepKind::Function { handler, config } => {
            let boxed = env.runtime.handlers.function(handler).ok_or_else(|| {
                StepFailure::permanent(format!("no function handler registered under '{handler}'"))
            })?;
            Ok((boxed, variables, config.clone()))
        }
        other => Err(StepFailure::permanent(format!(
            "step kind '{}' has no handler",
            other.name()
        ))),
    }
}

fn step_input(
    env: &RunEnv,
    step: &StepDefinition,
    attempt: u32,
    variables: Map<String, Value>,
    config: Value,
) -> StepInput {
    StepInput {
        workflow_id: env.workflow_id(),
        run_id: env.run_id,
        step_id: step.id.clone(),
        attempt,
        variables,
        config,
    }
}

/// Run `call` under the step's timeout and retry policy.
///
/// Returns the last result and the number of attempts made.
async fn run_attempts<F, Fut>(
    env: &RunEnv,
    step: &StepDefinition,
    mut call: F,
) -> (Result<StepOutcome, StepFailure>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<StepOutcome, StepFailure>>,
{
    let policy = step.retry.clone().unwrap_or_else(RetryPolicy::none);
    let timeout_ms = step.timeout_ms.unwrap_or(env.runtime.config.step_timeout_ms);
    let mut attempt = 1;

    loop {
        env.step_started(&step.id, attempt);
        let result = match tokio::time::timeout(Duration::from_millis(timeout_ms), call(attempt)).await
        {
            Ok(result) => result,
            Err(_) => Err(StepFailure::timeout(format!(
                "step timed out after {timeout_ms}ms"
            ))),
        };

        let failure = match result {
            Ok(outcome) => return (Ok(outcome), attempt),
            Err(failure) => failure,
        };
        if !RetryHandler::should_retry(&policy, attempt, failure.kind) {
            return (Err(failure), attempt);
        }

        let delay = RetryHandler::delay_for(&policy, attempt);
        tracing::warn!(
            run_id = %env.run_id,
            step_id = step.id.as_str(),
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure,
            "step attempt failed, retrying"
        );
        env.step_failed(&step.id, &failure.message, true);

        tokio::select! {
            _ = env.cancel.cancelled() => {
                return (Err(StepFailure::permanent("run cancelled during retry backoff")), attempt);
            }
            _ = tokio::time::sleep(delay) => {}
        }
        attempt += 1;
    }
}

fn handler_report(
    step: &StepDefinition,
    result: Result<StepOutcome, StepFailure>,
    attempts: u32,
) -> StepReport {
    match result {
        Ok(StepOutcome::Completed(output)) => {
            StepReport::new(&step.id, StepResult::success(output, attempts))
        }
        Ok(StepOutcome::Suspend {
            partial,
            reason,
            metadata,
        }) => {
            let mut report = StepReport::new(
                &step.id,
                StepResult::suspended(partial, metadata.clone(), attempts),
            );
            report.suspension = Some(SuspendRequest {
                step_id: step.id.clone(),
                kind: SuspensionKind::Handler,
                reason,
                metadata,
                timeout_at: None,
                child: None,
            });
            report
        }
        Err(failure) => StepReport::failed(&step.id, failure.message, failure.kind, attempts),
    }
}

fn resolve_failure(err: ResolveError) -> StepFailure {
    match err {
        ResolveError::MissingVariable(_) | ResolveError::InvalidPath { .. } => {
            StepFailure::missing_variable(err.to_string())
        }
        ResolveError::UnknownTransform(_) => StepFailure::permanent(err.to_string()),
        ResolveError::Transform { .. } => StepFailure::execution(err.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Conditional
// ---------------------------------------------------------------------------

fn run_conditional(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    condition: &Condition,
    on_true: &[String],
    on_false: &[String],
) -> StepReport {
    env.step_started(&step.id, 1);
    let result = match evaluate(condition, &ctx.scope()) {
        Ok(result) => result,
        Err(e) => return StepReport::failed(&step.id, e.to_string(), FailureKind::Permanent, 1),
    };

    let (branch, active, inactive) = if result {
        ("on_true", on_true, on_false)
    } else {
        ("on_false", on_false, on_true)
    };
    let skip = inactive
        .iter()
        .filter(|id| !active.contains(id))
        .cloned()
        .collect();

    tracing::debug!(
        run_id = %env.run_id,
        step_id = step.id.as_str(),
        result,
        branch,
        "conditional evaluated"
    );
    StepReport::new(
        &step.id,
        StepResult::success(json!({ "result": result, "branch": branch }), 1),
    )
    .with_skip(skip)
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

async fn run_loop(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: WorkflowContext,
    condition: &Condition,
    max_iterations: Option<u32>,
    carry: &BTreeMap<String, VariableRef>,
    initial: &Map<String, Value>,
) -> StepReport {
    env.step_started(&step.id, 1);
    let cap = max_iterations.unwrap_or(env.runtime.config.max_loop_iterations);
    let nested = env.plan.nested_in(&step.id);

    let mut local = ctx;
    local.variables.extend(initial.clone());
    let mut carried = initial.clone();
    let mut iterations: u32 = 0;

    let collect_nested = |local: &WorkflowContext, iterations: u32| -> Vec<(String, StepResult)> {
        nested
            .iter()
            .map(|id| {
                let result = match local.result(id) {
                    Some(result) if iterations > 0 => result.clone(),
                    _ => StepResult::skipped(),
                };
                (id.clone(), result)
            })
            .collect()
    };
    let fail = |local: &WorkflowContext, iterations: u32, message: String, kind: FailureKind| {
        let mut report = StepReport::failed(&step.id, message, kind, 1);
        report.nested = collect_nested(local, iterations);
        report
    };

    let (completed, capped) = loop {
        local.variables.insert(
            "loop".to_string(),
            json!({ "id": step.id, "iteration": iterations }),
        );
        match evaluate(condition, &local.scope()) {
            Ok(false) => break (true, false),
            Ok(true) => {}
            Err(e) => return fail(&local, iterations, e.to_string(), FailureKind::Permanent),
        }
        if iterations >= cap {
            break (false, true);
        }

        for id in &nested {
            local.reset(id);
        }
        let (next, outcome) = run_scope(env.clone(), Some(step.id.clone()), local, None).await;
        local = next;
        iterations += 1;

        match outcome {
            ScopeOutcome::Completed => {}
            ScopeOutcome::Failed { step_id, error } => {
                return fail(
                    &local,
                    iterations,
                    format!("loop body step '{step_id}' failed: {error}"),
                    FailureKind::Execution,
                );
            }
            ScopeOutcome::Suspended(request) => {
                return fail(
                    &local,
                    iterations,
                    format!("loop body step '{}' cannot suspend", request.step_id),
                    FailureKind::Permanent,
                );
            }
            ScopeOutcome::Cancelled => {
                return fail(&local, iterations, "run cancelled".to_string(), FailureKind::Execution);
            }
            ScopeOutcome::TimedOut => {
                return fail(&local, iterations, "workflow timed out".to_string(), FailureKind::Timeout);
            }
        }

        let scope = local.scope();
        for (name, var) in carry {
            match env.runtime.resolver.resolve(var, &scope) {
                Ok(value) => {
                    local.variables.insert(name.clone(), value.clone());
                    carried.insert(name.clone(), value);
                }
                Err(e) => {
                    let failure = resolve_failure(e);
                    return fail(&local, iterations, failure.message, failure.kind);
                }
            }
        }
        tracing::debug!(
            run_id = %env.run_id,
            step_id = step.id.as_str(),
            iteration = iterations,
            "loop iteration finished"
        );
    };

    if capped {
        tracing::warn!(
            run_id = %env.run_id,
            step_id = step.id.as_str(),
            cap,
            "loop stopped at its iteration cap"
        );
    }

    let output = json!({
        "iterations": iterations,
        "completed": completed,
        "capped": capped,
        "variables": carried,
    });
    let mut report = StepReport::new(&step.id, StepResult::success(output, 1));
    report.nested = collect_nested(&local, iterations);
    report.variables = carried;
    report
}

// ---------------------------------------------------------------------------
// Sub-workflow
// ---------------------------------------------------------------------------

async fn run_sub_workflow(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    workflow: &str,
    input: &BTreeMap<String, VariableRef>,
) -> StepReport {
    env.step_started(&step.id, 1);

    let max = env.runtime.config.max_sub_workflow_depth;
    if env.depth + 1 > max {
        return StepReport::failed(
            &step.id,
            format!("sub-workflow depth {} exceeds maximum {max}", env.depth + 1),
            FailureKind::Permanent,
            1,
        );
    }
    let Some(plan) = env.runtime.plan(workflow) else {
        return StepReport::failed(
            &step.id,
            format!("workflow '{workflow}' is not registered"),
            FailureKind::Permanent,
            1,
        );
    };
    let input = match env.runtime.resolver.resolve_all(input, &ctx.scope()) {
        Ok(input) => input,
        Err(e) => {
            let failure = resolve_failure(e);
            return StepReport::failed(&step.id, failure.message, failure.kind, 1);
        }
    };

    let child_env = env.child(plan, Uuid::now_v7());
    let mut child_ctx = WorkflowContext::new(workflow, child_env.run_id, input);
    child_ctx.init_steps(child_env.plan.all_steps().map(|s| s.id.as_str()));

    tracing::debug!(
        run_id = %env.run_id,
        step_id = step.id.as_str(),
        child_run_id = %child_env.run_id,
        workflow,
        "starting sub-workflow"
    );
    let (child_ctx, outcome) = run_scope(child_env.clone(), None, child_ctx, None).await;
    sub_workflow_report(&step.id, &child_env, child_ctx, outcome)
}

/// Translate a child run's outcome into the parent step's report.
pub(crate) fn sub_workflow_report(
    step_id: &str,
    child_env: &RunEnv,
    child_ctx: WorkflowContext,
    outcome: ScopeOutcome,
) -> StepReport {
    let workflow = child_env.workflow_id();
    match outcome {
        ScopeOutcome::Completed => {
            let output = collect_output(&child_env.plan, &child_ctx, &child_env.runtime.resolver);
            StepReport::new(step_id, StepResult::success(Value::Object(output), 1))
        }
        ScopeOutcome::Failed {
            step_id: child_step,
            error,
        } => StepReport::failed(
            step_id,
            format!("sub-workflow '{workflow}' failed at step '{child_step}': {error}"),
            FailureKind::Execution,
            1,
        ),
        ScopeOutcome::Suspended(request) => {
            let record = match build_record(request, &workflow, child_env.run_id, &child_ctx) {
                Ok(record) => record,
                Err(e) => {
                    return StepReport::failed(step_id, e.to_string(), FailureKind::Execution, 1);
                }
            };
            let metadata = json!({
                "workflow": workflow,
                "child_step": record.step_id,
                "child_suspension_id": record.suspension_id,
            });
            let mut report = StepReport::new(
                step_id,
                StepResult::suspended(json!({}), metadata.clone(), 1),
            );
            report.suspension = Some(SuspendRequest {
                step_id: step_id.to_string(),
                kind: SuspensionKind::SubWorkflow,
                reason: record.reason.clone(),
                metadata,
                timeout_at: record.timeout_at,
                child: Some(Box::new(record)),
            });
            report
        }
        ScopeOutcome::Cancelled => {
            StepReport::failed(step_id, "run cancelled", FailureKind::Execution, 1)
        }
        ScopeOutcome::TimedOut => {
            StepReport::failed(step_id, "workflow timed out", FailureKind::Timeout, 1)
        }
    }
}

// ---------------------------------------------------------------------------
// Human / wait-for-event
// ---------------------------------------------------------------------------

fn suspend_human(
    env: &RunEnv,
    step: &StepDefinition,
    ctx: &WorkflowContext,
    prompt: &str,
    timeout_ms: Option<u64>,
) -> StepReport {
    env.step_started(&step.id, 1);
    let prompt = env.runtime.resolver.render(prompt, &ctx.scope());
    let metadata = json!({ "prompt": prompt, "timeout_ms": timeout_ms });

    let mut report = StepReport::new(
        &step.id,
        StepResult::suspended(json!({ "prompt": prompt }), metadata.clone(), 1),
    );
    report.suspension = Some(SuspendRequest {
        step_id: step.id.clone(),
        kind: SuspensionKind::Human,
        reason: Some(prompt),
        metadata,
        timeout_at: timeout_ms.and_then(deadline_after),
        child: None,
    });
    report
}

fn suspend_for_event(
    env: &RunEnv,
    step: &StepDefinition,
    events: &[String],
    timeout_ms: Option<u64>,
) -> StepReport {
    env.step_started(&step.id, 1);
    let metadata = json!({ "events": events, "timeout_ms": timeout_ms });

    let mut report = StepReport::new(
        &step.id,
        StepResult::suspended(json!({ "events": events }), metadata.clone(), 1),
    );
    report.suspension = Some(SuspendRequest {
        step_id: step.id.clone(),
        kind: SuspensionKind::Event,
        reason: Some(format!("waiting for event: {}", events.join(", "))),
        metadata,
        timeout_at: timeout_ms.and_then(deadline_after),
        child: None,
    });
    report
}

fn deadline_after(ms: u64) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::try_milliseconds(i64::try_from(ms).ok()?)?;
    Utc::now().checked_add_signed(delta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    use weaver_types::workflow::StepStatus;

    use crate::step::{HandlerRegistry, StepHandler};
    use crate::workflow::scheduler::tests::{test_context, test_env};

    /// Returns `{ value: variables.current + 1 }` and counts its calls.
    #[derive(Clone, Default)]
    struct Increment {
        calls: Arc<AtomicU32>,
    }

    impl StepHandler for Increment {
        async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let current = input
                .variables
                .get("current")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(StepOutcome::Completed(json!({ "value": current + 1 })))
        }
    }

    fn call_step(retry: &str) -> RunEnv {
        let yaml = format!(
            r#"
id: attempts
steps:
  - id: call
    timeout_ms: 50
{retry}
    kind: {{ type: function, handler: unused }}
"#
        );
        test_env(&yaml, HandlerRegistry::new())
    }

    fn step(env: &RunEnv, id: &str) -> StepDefinition {
        env.plan.step(id).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_retryable_failure_retried_with_backoff() {
        let env = call_step(
            "    retry: { max_attempts: 3, backoff: { type: constant, delay_ms: 40 } }",
        );
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let (result, attempts) = run_attempts(&env, &step(&env, "call"), |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(StepFailure::transient("flaky"))
                } else {
                    Ok(StepOutcome::Completed(json!(attempt)))
                }
            }
        })
        .await;

        assert_eq!(result, Ok(StepOutcome::Completed(json!(3))));
        assert_eq!(attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(started.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn test_permanent_failure_stops_after_first_attempt() {
        let env = call_step(
            "    retry: { max_attempts: 5, backoff: { type: constant, delay_ms: 10 } }",
        );
        let (result, attempts) = run_attempts(&env, &step(&env, "call"), |_| async {
            Err(StepFailure::permanent("bad input"))
        })
        .await;

        assert_eq!(attempts, 1);
        assert_eq!(result.unwrap_err().kind, FailureKind::Permanent);
    }

    #[tokio::test]
    async fn test_attempt_timeout_is_retryable() {
        let env = call_step(
            "    retry: { max_attempts: 2, backoff: { type: constant, delay_ms: 0 } }",
        );
        let (result, attempts) = run_attempts(&env, &step(&env, "call"), |_| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(StepOutcome::Completed(json!("late")))
        })
        .await;

        let failure = result.unwrap_err();
        assert_eq!(failure.kind, FailureKind::Timeout);
        assert!(failure.message.contains("50ms"));
        assert_eq!(attempts, 2);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let env = call_step(
            "    retry: { max_attempts: 3, backoff: { type: constant, delay_ms: 10000 } }",
        );
        let cancel = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        });

        let started = Instant::now();
        let (result, attempts) = run_attempts(&env, &step(&env, "call"), |_| async {
            Err(StepFailure::transient("down"))
        })
        .await;

        assert_eq!(attempts, 1);
        assert!(result.unwrap_err().message.contains("cancelled during retry backoff"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    fn loop_env(condition: &str, max_iterations: u32, initial: i64, inc: Increment) -> RunEnv {
        let yaml = format!(
            r#"
id: counter
steps:
  - id: count
    kind:
      type: loop
      condition:
        expr: "{condition}"
      body: [inc]
      max_iterations: {max_iterations}
      carry:
        n: $.steps.inc.output.value
      initial:
        n: {initial}
  - id: inc
    variables:
      current: $.variables.n
    kind: {{ type: function, handler: increment }}
"#
        );
        let handlers = HandlerRegistry::new();
        handlers.register_function("increment", inc);
        test_env(&yaml, handlers)
    }

    #[tokio::test]
    async fn test_loop_carries_variables_between_iterations() {
        let inc = Increment::default();
        let env = loop_env("$.variables.n < 3", 10, 0, inc.clone());
        let ctx = test_context(&env, json!({}));

        let report = run_step(env.clone(), step(&env, "count"), ctx).await;
        assert_eq!(report.result.status, StepStatus::Success);
        assert_eq!(
            report.result.output,
            Some(json!({
                "iterations": 3,
                "completed": true,
                "capped": false,
                "variables": { "n": 3 },
            }))
        );
        assert_eq!(report.variables.get("n"), Some(&json!(3)));
        assert_eq!(inc.calls.load(Ordering::SeqCst), 3);

        let (id, last) = &report.nested[0];
        assert_eq!(id, "inc");
        assert_eq!(last.output, Some(json!({ "value": 3 })));
    }

    #[tokio::test]
    async fn test_loop_with_false_predicate_runs_no_iterations() {
        let inc = Increment::default();
        let env = loop_env("$.variables.n < 3", 10, 5, inc.clone());
        let ctx = test_context(&env, json!({}));

        let report = run_step(env.clone(), step(&env, "count"), ctx).await;
        let output = report.result.output.unwrap();
        assert_eq!(output["iterations"], 0);
        assert_eq!(output["completed"], true);
        assert_eq!(output["capped"], false);
        assert_eq!(output["variables"]["n"], 5);
        assert_eq!(inc.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.nested.len(), 1);
        assert_eq!(report.nested[0].0, "inc");
        assert_eq!(report.nested[0].1.status, StepStatus::Skipped);
    }

    #[tokio::test]
    async fn test_loop_predicate_checked_before_cap() {
        // Predicate turns false exactly when the cap is reached.
        let inc = Increment::default();
        let env = loop_env("$.variables.n < 3", 3, 0, inc.clone());
        let ctx = test_context(&env, json!({}));

        let report = run_step(env.clone(), step(&env, "count"), ctx).await;
        let output = report.result.output.unwrap();
        assert_eq!(output["iterations"], 3);
        assert_eq!(output["completed"], true);
        assert_eq!(output["capped"], false);

        let env = loop_env("$.variables.n < 100", 2, 0, Increment::default());
        let ctx = test_context(&env, json!({}));
        let report = run_step(env.clone(), step(&env, "count"), ctx).await;
        let output = report.result.output.unwrap();
        assert_eq!(output["iterations"], 2);
        assert_eq!(output["completed"], false);
        assert_eq!(output["capped"], true);
    }

    #[tokio::test]
    async fn test_conditional_reports_inactive_branch() {
        let env = test_env(
            r#"
id: pick
steps:
  - id: gate
    kind:
      type: conditional
      condition: { compare: { path: $.input.n, op: gt, value: 2 } }
      on_true: [big]
      on_false: [small]
  - id: big
    kind: { type: function, handler: echo }
  - id: small
    kind: { type: function, handler: echo }
"#,
            HandlerRegistry::new(),
        );
        let ctx = test_context(&env, json!({ "n": 5 }));

        let report = run_step(env.clone(), step(&env, "gate"), ctx).await;
        assert_eq!(
            report.result.output,
            Some(json!({ "result": true, "branch": "on_true" }))
        );
        assert_eq!(report.skip, vec!["small".to_string()]);
    }
}

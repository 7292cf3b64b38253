//! Workflow subcommands: validate, run, runs and state.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use comfy_table::Cell;
use console::style;
use uuid::Uuid;
use weaver_core::step::builtin::register_builtins;
use weaver_core::step::HandlerRegistry;
use weaver_core::workflow::{
    load_workflow_file, Engine, WorkflowContext, WorkflowError, WorkflowPlan,
};
use weaver_types::workflow::WorkflowDefinition;

use super::output::{
    follow_events, new_table, parse_json_object, print_result, status_cell, steps_table,
};
use crate::state::{workflow_id_for, AppState};

fn load(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::Parse(msg) => anyhow::anyhow!("Failed to parse workflow: {msg}"),
        WorkflowError::Validation(msg) => anyhow::anyhow!("Workflow validation failed: {msg}"),
        other => anyhow::anyhow!("Failed to load workflow {}: {other}", file.display()),
    })
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

/// Parallel group of each step within its scope (top level or loop body).
///
/// Steps sharing a wave number in the same scope can run concurrently.
fn wave_index(plan: &WorkflowPlan) -> HashMap<String, usize> {
    let loops = plan.all_steps().filter_map(|s| plan.loop_scope(&s.id));
    let mut index = HashMap::new();
    for scope in std::iter::once(plan.top_scope()).chain(loops) {
        for (wave, ids) in scope.waves().into_iter().enumerate() {
            for id in ids {
                index.insert(id.to_string(), wave);
            }
        }
    }
    index
}

/// Parse, validate and compile a definition against the builtin transforms.
pub fn validate(file: &Path, json: bool) -> Result<()> {
    let def = load(file)?;
    let id = workflow_id_for(file, &def);

    let handlers = HandlerRegistry::new();
    register_builtins(&handlers);
    let engine = Engine::builder().handlers(handlers).build();
    engine
        .register_workflow(&id, def.clone())
        .map_err(|e| anyhow::anyhow!("Workflow '{id}' is invalid: {e}"))?;
    let plan = WorkflowPlan::compile(def.clone())
        .map_err(|e| anyhow::anyhow!("Workflow '{id}' is invalid: {e}"))?;
    let waves = wave_index(&plan);

    if json {
        let steps: Vec<_> = def
            .steps
            .iter()
            .map(|s| {
                serde_json::json!({
                    "id": s.id,
                    "kind": s.kind.name(),
                    "after": s.after,
                    "wave": waves.get(&s.id),
                    "loop": plan.owner_of(&s.id),
                })
            })
            .collect();
        let out = serde_json::json!({ "workflow_id": id, "valid": true, "steps": steps });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Workflow '{}' is valid ({} steps)",
            style("*").green().bold(),
            style(&id).cyan(),
            def.steps.len()
        );
        println!();
        let mut table = new_table(vec!["Step", "Kind", "After", "Wave"]);
        for step in &def.steps {
            let wave = match (waves.get(&step.id), plan.owner_of(&step.id)) {
                (Some(wave), Some(owner)) => format!("{owner}/{wave}"),
                (Some(wave), None) => wave.to_string(),
                (None, _) => "-".to_string(),
            };
            table.add_row(vec![
                Cell::new(&step.id),
                Cell::new(step.kind.name()),
                Cell::new(step.after.join(", ")),
                Cell::new(wave),
            ]);
        }
        println!("{table}");
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn run(
    state: &AppState,
    file: &Path,
    input: Option<&str>,
    stream: bool,
    workflows: Option<&Path>,
    json: bool,
) -> Result<()> {
    let input = parse_json_object(input, "input")?;
    let def = load(file)?;
    let id = workflow_id_for(file, &def);

    // Sibling definitions make sub-workflows resolvable
    let dir = workflows.or_else(|| file.parent().filter(|p| !p.as_os_str().is_empty()));
    if let Some(dir) = dir {
        state.load_workflows(Some(dir))?;
    }
    state
        .engine
        .register_workflow(&id, def)
        .with_context(|| format!("Workflow '{id}' is invalid"))?;

    if stream {
        return follow_events(state.engine.execute_stream(&id, input), json).await;
    }

    let result = state
        .engine
        .execute_workflow(&id, input)
        .await
        .with_context(|| format!("Failed to run workflow '{id}'"))?;
    print_result(&result, json)
}

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn runs(state: &AppState, workflow_id: &str, limit: u32, json: bool) -> Result<()> {
    let runs = state
        .engine
        .get_workflow_runs(workflow_id, Some(limit))
        .await
        .context("Failed to list runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs recorded for '{}'.", style(workflow_id).cyan());
        println!();
        return Ok(());
    }

    let mut table = new_table(vec!["Run ID", "Status", "Started", "Finished", "Error"]);
    for run in &runs {
        table.add_row(vec![
            Cell::new(run.run_id),
            status_cell(run.status.as_str()),
            Cell::new(run.started_at.format("%Y-%m-%d %H:%M:%S")),
            Cell::new(
                run.completed_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
            Cell::new(run.error.as_deref().unwrap_or("")),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

pub async fn state(state: &AppState, workflow_id: &str, run_id: &str, json: bool) -> Result<()> {
    let run_id: Uuid = run_id.parse().context("Invalid run ID")?;
    let run = state.engine.get_workflow_state(workflow_id, run_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
        return Ok(());
    }

    println!();
    println!(
        "  Run {} of '{}': {}",
        run.run_id,
        style(&run.workflow_id).cyan(),
        run.status
    );
    println!("  Started: {}", run.started_at.format("%Y-%m-%d %H:%M:%S"));
    if let Some(done) = run.completed_at {
        println!("  Finished: {}", done.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(id) = run.suspension_id {
        println!("  Suspension: {}", style(id).yellow());
    }
    if let Some(error) = &run.error {
        println!("  Error: {}", style(error).red());
    }

    match WorkflowContext::from_json(run.context.clone()) {
        Ok(ctx) => {
            println!();
            println!("{}", steps_table(&ctx.steps));
        }
        Err(e) => {
            tracing::warn!(error = %e, "stored context is unreadable");
        }
    }
    println!();
    Ok(())
}

//! Shared terminal rendering for run results, events and step tables.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use comfy_table::{presets, Cell, Color, ContentArrangement, Table};
use console::style;
use futures_util::{pin_mut, Stream, StreamExt};
use serde_json::{Map, Value};
use weaver_types::event::WorkflowEvent;
use weaver_types::workflow::{StepResult, StepStatus, WorkflowResult, WorkflowRunStatus};

/// Parse an optional JSON argument, defaulting to `null`.
pub fn parse_json_arg(raw: Option<&str>, what: &str) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(raw).with_context(|| format!("Invalid JSON {what}")),
        None => Ok(Value::Null),
    }
}

/// Parse an optional JSON object argument, defaulting to `{}`.
pub fn parse_json_object(raw: Option<&str>, what: &str) -> Result<Map<String, Value>> {
    match parse_json_arg(raw, what)? {
        Value::Null => Ok(Map::new()),
        Value::Object(map) => Ok(map),
        other => bail!("{what} must be a JSON object, got {other}"),
    }
}

pub fn status_cell(status: &str) -> Cell {
    let color = match status {
        "completed" | "success" => Color::Green,
        "failed" | "error" | "cancelled" => Color::Red,
        "suspended" | "running" => Color::Yellow,
        _ => Color::DarkGrey,
    };
    Cell::new(status).fg(color)
}

fn styled_status(status: WorkflowRunStatus) -> String {
    match status {
        WorkflowRunStatus::Completed => style(status.as_str()).green().to_string(),
        WorkflowRunStatus::Suspended | WorkflowRunStatus::Running => {
            style(status.as_str()).yellow().to_string()
        }
        WorkflowRunStatus::Failed | WorkflowRunStatus::Cancelled => {
            style(status.as_str()).red().to_string()
        }
    }
}

pub fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

/// Table of step results: id, status, attempts, detail.
pub fn steps_table(steps: &BTreeMap<String, StepResult>) -> Table {
    let mut table = new_table(vec!["Step", "Status", "Attempts", "Detail"]);
    for (id, result) in steps {
        let detail = match result.status {
            StepStatus::Error => result.error.clone().unwrap_or_default(),
            StepStatus::Success => result
                .output
                .as_ref()
                .map(compact)
                .unwrap_or_default(),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(id),
            status_cell(&result.status.to_string()),
            Cell::new(result.attempts),
            Cell::new(detail),
        ]);
    }
    table
}

/// Single-line JSON, truncated for table cells.
pub fn compact(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 60 {
        let cut: String = text.chars().take(57).collect();
        format!("{cut}...")
    } else {
        text
    }
}

/// Print the outcome of an execute or resume call.
///
/// Returns an error when the run failed so the process exits non-zero.
pub fn print_result(result: &WorkflowResult, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else {
        println!();
        println!(
            "  Workflow '{}' {}",
            style(&result.workflow_id).cyan(),
            styled_status(result.status)
        );
        println!("  Run ID: {}", result.run_id);
        if let Some(id) = result.suspension_id {
            println!(
                "  Suspended at '{}' (suspension {})",
                result.suspended_step.as_deref().unwrap_or("?"),
                style(id).yellow()
            );
        }
        if let Some(error) = &result.error {
            println!("  Error: {}", style(error).red());
        }
        for e in &result.errors {
            println!("  {} step '{}': {}", style("!").yellow(), e.step_id, e.error);
        }
        if !result.output.is_empty() {
            println!();
            println!(
                "  Output: {}",
                serde_json::to_string_pretty(&Value::Object(result.output.clone()))?
            );
        }
        println!();
        println!("{}", steps_table(&result.steps));
        println!();
    }

    if result.status == WorkflowRunStatus::Failed || result.status == WorkflowRunStatus::Cancelled
    {
        bail!(
            "workflow '{}' {}",
            result.workflow_id,
            result.status.as_str()
        );
    }
    Ok(())
}

fn describe(event: &WorkflowEvent) -> String {
    match event {
        WorkflowEvent::Started { workflow_id, run_id } => {
            format!("started {} (run {run_id})", style(workflow_id).cyan())
        }
        WorkflowEvent::StepStarted {
            step_id, attempt, ..
        } => format!("step {step_id} started (attempt {attempt})"),
        WorkflowEvent::StepCompleted {
            step_id, output, ..
        } => format!("step {step_id} {} {}", style("ok").green(), compact(output)),
        WorkflowEvent::StepFailed {
            step_id,
            error,
            will_retry,
            ..
        } => {
            let retry = if *will_retry { " (retrying)" } else { "" };
            format!("step {step_id} {}: {error}{retry}", style("failed").red())
        }
        WorkflowEvent::StepSkipped { step_id, .. } => {
            format!("step {step_id} {}", style("skipped").dim())
        }
        WorkflowEvent::Suspended {
            step_id,
            suspension_id,
            ..
        } => format!(
            "{} at {step_id} (suspension {suspension_id})",
            style("suspended").yellow()
        ),
        WorkflowEvent::Resumed { suspension_id, .. } => {
            format!("resumed from suspension {suspension_id}")
        }
        WorkflowEvent::Completed { output, .. } => format!(
            "{} {}",
            style("completed").green().bold(),
            compact(&Value::Object(output.clone()))
        ),
        WorkflowEvent::Failed { error, .. } => {
            format!("{}: {error}", style("failed").red().bold())
        }
    }
}

/// Print events as they arrive; errors if the stream ended in failure.
pub async fn follow_events(events: impl Stream<Item = WorkflowEvent>, json: bool) -> Result<()> {
    pin_mut!(events);
    let mut last = None;
    while let Some(event) = events.next().await {
        if json {
            println!("{}", serde_json::to_string(&event)?);
        } else {
            println!("  {}", describe(&event));
        }
        last = Some(event);
    }

    match last {
        Some(WorkflowEvent::Failed { error, .. }) => bail!("{error}"),
        Some(_) => Ok(()),
        None => bail!("event stream ended without a terminal event"),
    }
}

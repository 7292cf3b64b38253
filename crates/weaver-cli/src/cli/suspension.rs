//! Suspension subcommands: resume, signal, suspended and abandon.

use anyhow::{Context, Result};
use comfy_table::Cell;
use console::style;
use uuid::Uuid;
use weaver_core::workflow::{EngineError, ResumeInput};

use super::output::{follow_events, new_table, parse_json_arg, print_result};
use crate::state::AppState;

fn parse_suspension_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .with_context(|| format!("Invalid suspension ID '{raw}'"))
}

/// Add a hint for the errors a user can act on.
fn explain(e: EngineError) -> anyhow::Error {
    let hint = match &e {
        EngineError::UnknownSuspension(_) => Some("run `weaver suspended` to list active ones"),
        EngineError::WorkflowNotFound(_) => {
            Some("pass --workflows DIR pointing at the workflow definitions")
        }
        EngineError::InvalidResume { .. } => Some("use `weaver signal` for event waits"),
        _ => None,
    };
    match hint {
        Some(hint) => anyhow::anyhow!("{e} ({hint})"),
        None => anyhow::Error::new(e),
    }
}

// ---------------------------------------------------------------------------
// Resume / signal
// ---------------------------------------------------------------------------

pub async fn resume(
    state: &AppState,
    suspension_id: &str,
    data: Option<&str>,
    stream: bool,
    json: bool,
) -> Result<()> {
    let suspension_id = parse_suspension_id(suspension_id)?;
    let data = parse_json_arg(data, "resume data")?;

    if stream {
        let events = state
            .engine
            .resume_stream(suspension_id, ResumeInput::Data(data));
        return follow_events(events, json).await;
    }

    let result = state
        .engine
        .resume_workflow(suspension_id, data)
        .await
        .map_err(explain)?;
    print_result(&result, json)
}

pub async fn signal(
    state: &AppState,
    suspension_id: &str,
    event: &str,
    payload: Option<&str>,
    stream: bool,
    json: bool,
) -> Result<()> {
    let suspension_id = parse_suspension_id(suspension_id)?;
    let payload = parse_json_arg(payload, "event payload")?;

    if stream {
        let events = state.engine.resume_stream(
            suspension_id,
            ResumeInput::Event {
                name: event.to_string(),
                payload,
            },
        );
        return follow_events(events, json).await;
    }

    let result = state
        .engine
        .resume_workflow_with_event(suspension_id, event, payload)
        .await
        .map_err(explain)?;
    print_result(&result, json)
}

// ---------------------------------------------------------------------------
// List / abandon
// ---------------------------------------------------------------------------

pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let suspended = state
        .engine
        .get_suspended_workflows()
        .await
        .context("Failed to list suspensions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&suspended)?);
        return Ok(());
    }

    if suspended.is_empty() {
        println!();
        println!("  No suspended runs.");
        println!();
        return Ok(());
    }

    let mut table = new_table(vec![
        "Suspension ID",
        "Workflow",
        "Step",
        "Kind",
        "Reason",
        "Times out",
    ]);
    for s in &suspended {
        table.add_row(vec![
            Cell::new(s.suspension_id),
            Cell::new(&s.workflow_id),
            Cell::new(&s.step_id),
            Cell::new(s.kind),
            Cell::new(s.reason.as_deref().unwrap_or("")),
            Cell::new(
                s.timeout_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
            ),
        ]);
    }
    println!();
    println!("{table}");
    println!();
    Ok(())
}

pub async fn abandon(state: &AppState, suspension_id: &str, json: bool) -> Result<()> {
    let suspension_id = parse_suspension_id(suspension_id)?;
    state
        .engine
        .abandon(suspension_id)
        .await
        .map_err(explain)?;

    if json {
        let out = serde_json::json!({
            "suspension_id": suspension_id.to_string(),
            "abandoned": true,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else {
        println!();
        println!(
            "  {} Abandoned suspension {}",
            style("*").green().bold(),
            style(suspension_id).yellow()
        );
        println!();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const REVIEW: &str = r#"
id: review
steps:
  - id: approve
    kind: { type: human, prompt: "Ship it?" }
  - id: ship
    after: [approve]
    kind: { type: function, handler: echo }
"#;

    /// Run `review` in one state, then resume it from a fresh one.
    #[tokio::test]
    async fn test_resume_across_processes() {
        let tmp = TempDir::new().unwrap();
        let data_dir = tmp.path().join("data");
        let workflows = data_dir.join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("review.yaml"), REVIEW).unwrap();

        let first = AppState::init(Some(&data_dir)).await.unwrap();
        first.load_workflows(None).unwrap();
        let result = first
            .engine
            .execute_workflow("review", serde_json::Map::new())
            .await
            .unwrap();
        let suspension_id = result.suspension_id.unwrap();
        drop(first);

        let second = AppState::init(Some(&data_dir)).await.unwrap();
        let listed = second.engine.get_suspended_workflows().await.unwrap();
        assert_eq!(listed.len(), 1);

        second.load_workflows(None).unwrap();
        resume(
            &second,
            &suspension_id.to_string(),
            Some(r#""yes""#),
            false,
            true,
        )
        .await
        .unwrap();

        assert!(second.engine.get_suspended_workflows().await.unwrap().is_empty());
        let err = abandon(&second, &suspension_id.to_string(), true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("weaver suspended"));
    }

    #[tokio::test]
    async fn test_invalid_suspension_id() {
        let tmp = TempDir::new().unwrap();
        let state = AppState::init(Some(tmp.path())).await.unwrap();
        let err = resume(&state, "not-a-uuid", None, false, true)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Invalid suspension ID"));
    }
}

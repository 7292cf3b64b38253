//! Workflow definition parsing, validation, and filesystem operations.
//!
//! Converts between YAML/JSON files and `WorkflowDefinition`, validates
//! structural constraints (unique IDs, known references, branch ownership,
//! well-formed paths and conditions), and discovers workflow files on disk.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use weaver_types::workflow::{StepKind, WorkflowDefinition};

use super::condition::validate_condition;
use super::dag;
use super::path::ContextPath;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading or validating workflows.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML/JSON parse failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    Validation(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The `after` edges (plus implicit branch edges) contain a cycle.
    #[error("cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    /// A step references an unknown step.
    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    /// Malformed path or condition.
    #[error("expression error: {0}")]
    Expression(String),

    /// Runtime context failure.
    #[error("execution error: {0}")]
    Execution(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `WorkflowDefinition`.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Parse a JSON string into a validated `WorkflowDefinition`.
pub fn parse_workflow_json(json: &str) -> Result<WorkflowDefinition, WorkflowError> {
    let def: WorkflowDefinition =
        serde_json::from_str(json).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&def)?;
    Ok(def)
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_workflow_yaml(def: &WorkflowDefinition) -> Result<String, WorkflowError> {
    serde_yaml_ng::to_string(def).map_err(|e| WorkflowError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a definition: structure first, then the dependency graph.
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    check_structure(def)?;
    dag::analyze(def).map(|_| ())
}

/// Structural checks that do not need the graph.
pub(crate) fn check_structure(def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if def.id.trim().is_empty() {
        return Err(WorkflowError::Validation("workflow id must not be empty".into()));
    }
    if def.steps.is_empty() {
        return Err(WorkflowError::Validation(format!(
            "workflow '{}' has no steps",
            def.id
        )));
    }
    if def.timeout_ms == Some(0) {
        return Err(WorkflowError::Validation("workflow timeout_ms must be > 0".into()));
    }

    let mut ids = HashSet::new();
    for step in &def.steps {
        if step.id.trim().is_empty() {
            return Err(WorkflowError::Validation("step id must not be empty".into()));
        }
        if !ids.insert(step.id.as_str()) {
            return Err(WorkflowError::Validation(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    let mut loop_owner: HashMap<&str, &str> = HashMap::new();
    for step in &def.steps {
        for dep in &step.after {
            if !ids.contains(dep.as_str()) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' runs after unknown step '{}'",
                    step.id, dep
                )));
            }
        }
        for target in step.kind.branch_targets() {
            if !ids.contains(target) {
                return Err(WorkflowError::UnknownDependency(format!(
                    "step '{}' branches to unknown step '{}'",
                    step.id, target
                )));
            }
            if target == step.id {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' cannot branch to itself",
                    step.id
                )));
            }
        }

        if step.timeout_ms == Some(0) {
            return Err(WorkflowError::Validation(format!(
                "step '{}': timeout_ms must be > 0",
                step.id
            )));
        }
        if let Some(retry) = &step.retry {
            if retry.max_attempts == 0 {
                return Err(WorkflowError::Validation(format!(
                    "step '{}': retry.max_attempts must be >= 1",
                    step.id
                )));
            }
        }
        if let Some(condition) = &step.condition {
            validate_condition(condition).map_err(|e| WorkflowError::Expression(e.to_string()))?;
        }
        for var in step.variables.values() {
            check_path(&step.id, &var.path)?;
        }

        match &step.kind {
            StepKind::Conditional { condition, .. } => {
                validate_condition(condition)
                    .map_err(|e| WorkflowError::Expression(e.to_string()))?;
            }
            StepKind::Loop {
                condition,
                body,
                carry,
                ..
            } => {
                validate_condition(condition)
                    .map_err(|e| WorkflowError::Expression(e.to_string()))?;
                if body.is_empty() {
                    return Err(WorkflowError::Validation(format!(
                        "loop '{}' has an empty body",
                        step.id
                    )));
                }
                for member in body {
                    if !ids.contains(member.as_str()) {
                        return Err(WorkflowError::UnknownDependency(format!(
                            "loop '{}' body references unknown step '{}'",
                            step.id, member
                        )));
                    }
                    if member == &step.id {
                        return Err(WorkflowError::Validation(format!(
                            "loop '{}' cannot contain itself",
                            step.id
                        )));
                    }
                    if let Some(other) = loop_owner.insert(member.as_str(), step.id.as_str()) {
                        return Err(WorkflowError::Validation(format!(
                            "step '{member}' belongs to both loop '{other}' and loop '{}'",
                            step.id
                        )));
                    }
                }
                for var in carry.values() {
                    check_path(&step.id, &var.path)?;
                }
            }
            StepKind::SubWorkflow { workflow, input } => {
                if workflow.trim().is_empty() {
                    return Err(WorkflowError::Validation(format!(
                        "step '{}': sub-workflow name must not be empty",
                        step.id
                    )));
                }
                for var in input.values() {
                    check_path(&step.id, &var.path)?;
                }
            }
            StepKind::Human { timeout_ms, .. } => {
                if *timeout_ms == Some(0) {
                    return Err(WorkflowError::Validation(format!(
                        "step '{}': human timeout_ms must be > 0",
                        step.id
                    )));
                }
            }
            StepKind::WaitForEvent {
                events,
                branches,
                timeout_ms,
                ..
            } => {
                if events.is_empty() {
                    return Err(WorkflowError::Validation(format!(
                        "step '{}' waits for no events",
                        step.id
                    )));
                }
                if let Some(unknown) = branches.keys().find(|k| !events.contains(k)) {
                    return Err(WorkflowError::Validation(format!(
                        "step '{}' has a branch for undeclared event '{unknown}'",
                        step.id
                    )));
                }
                if *timeout_ms == Some(0) {
                    return Err(WorkflowError::Validation(format!(
                        "step '{}': event timeout_ms must be > 0",
                        step.id
                    )));
                }
            }
            StepKind::Agent { .. } | StepKind::Function { .. } => {}
        }
    }

    // Suspension inside a loop iteration cannot be resumed.
    for step in &def.steps {
        if step.kind.always_suspends() {
            if let Some(owner) = loop_owner.get(step.id.as_str()) {
                return Err(WorkflowError::Validation(format!(
                    "step '{}' ({}) cannot be part of loop '{owner}'",
                    step.id,
                    step.kind.name()
                )));
            }
        }
    }

    for var in def.output.values() {
        check_path(&def.id, &var.path)?;
    }

    Ok(())
}

fn check_path(owner: &str, path: &str) -> Result<(), WorkflowError> {
    ContextPath::parse(path)
        .map(|_| ())
        .map_err(|e| WorkflowError::Expression(format!("'{owner}': {e}")))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a workflow definition from a `.yaml`, `.yml` or `.json` file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_workflow_json(&content),
        _ => parse_workflow_yaml(&content),
    }
}

/// Save a workflow definition to a YAML file.
///
/// Creates parent directories if they don't exist.
pub fn save_workflow_file(path: &Path, def: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_workflow_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all workflow files under `base_dir`.
///
/// Scans for `.yaml`, `.yml` and `.json` files recursively. Files that fail
/// to parse are skipped with a warning.
pub fn discover_workflows(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), WorkflowError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_workflow = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_workflow {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

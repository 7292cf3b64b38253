//! Workflow engine core: definitions, DAG scheduling, suspension and resumption.
//!
//! - `definition` -- YAML/JSON parsing, structural validation, filesystem load/save
//! - `path` / `resolver` / `transform` -- context paths, variable resolution, named transforms
//! - `condition` -- structured predicates over the context
//! - `dag` -- graph analysis, cycle detection, per-scope dependency order
//! - `context` -- run state: input, step results, variables
//! - `retry` -- retry decisions and backoff delays
//! - `scheduler` -- completion-driven coordinator over a `JoinSet`
//! - `step_runner` -- per-kind step execution
//! - `suspension` -- suspension records and continuations
//! - `engine` -- the public facade

pub mod condition;
pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod path;
pub mod resolver;
pub mod retry;
pub(crate) mod scheduler;
pub(crate) mod step_runner;
pub(crate) mod suspension;
pub mod transform;

pub use context::WorkflowContext;
pub use dag::WorkflowPlan;
pub use definition::{
    discover_workflows, load_workflow_file, parse_workflow_json, parse_workflow_yaml,
    save_workflow_file, serialize_workflow_yaml, validate_definition, WorkflowError,
};
pub use engine::{Engine, EngineBuilder, EngineError, ResumeInput};
pub use resolver::{ResolveError, VariableResolver};
pub use transform::TransformRegistry;

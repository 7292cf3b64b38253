//! Step handler trait: the seam between the engine and step implementations.
//!
//! Agent and function steps delegate to a `StepHandler` looked up by name.
//! A handler either completes with an output, asks the engine to suspend the
//! run, or fails with a classified `StepFailure`.

use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;
use weaver_types::workflow::FailureKind;

/// Everything a handler sees for one attempt.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub step_id: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Resolved step variables.
    pub variables: Map<String, Value>,
    /// Static configuration from the step definition.
    pub config: Value,
}

/// Successful result of a handler call.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Completed(Value),
    /// Pause the run. `partial` becomes the step's output until resumed.
    Suspend {
        partial: Value,
        reason: Option<String>,
        metadata: Value,
    },
}

impl StepOutcome {
    pub fn suspend(partial: Value, reason: impl Into<String>) -> Self {
        StepOutcome::Suspend {
            partial,
            reason: Some(reason.into()),
            metadata: Value::Null,
        }
    }
}

/// A classified step failure.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind} failure: {message}")]
pub struct StepFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl StepFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Execution, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Permanent, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn missing_variable(message: impl Into<String>) -> Self {
        Self::new(FailureKind::MissingVariable, message)
    }
}

/// Implementation of an agent or function step.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
/// See `BoxStepHandler` for dynamic dispatch.
pub trait StepHandler: Send + Sync {
    /// Run one attempt of the step.
    fn execute(
        &self,
        input: StepInput,
    ) -> impl std::future::Future<Output = Result<StepOutcome, StepFailure>> + Send;

    /// Continue a step that previously returned `StepOutcome::Suspend`.
    ///
    /// The default merges `resume_data` into `partial` when both are objects,
    /// keeps `partial` when `resume_data` is empty, and otherwise returns
    /// `resume_data`.
    fn resume(
        &self,
        input: StepInput,
        partial: Value,
        resume_data: Value,
    ) -> impl std::future::Future<Output = Result<StepOutcome, StepFailure>> + Send {
        let _ = input;
        async move { Ok(StepOutcome::Completed(merge_resume(partial, resume_data))) }
    }
}

/// Merge resume data into a partial output.
pub fn merge_resume(partial: Value, resume_data: Value) -> Value {
    match (partial, resume_data) {
        (partial, Value::Null) => partial,
        (partial, Value::Object(data)) if data.is_empty() => partial,
        (Value::Object(mut base), Value::Object(data)) => {
            base.extend(data);
            Value::Object(base)
        }
        (_, data) => data,
    }
}

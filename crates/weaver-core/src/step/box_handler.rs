//! BoxStepHandler -- object-safe dynamic dispatch wrapper for StepHandler.
//!
//! 1. `StepHandlerDyn` is the object-safe version with boxed futures
//! 2. Blanket impl of `StepHandlerDyn` for all `T: StepHandler`
//! 3. `BoxStepHandler` wraps `Arc<dyn StepHandlerDyn>` and delegates
//!
//! The `Arc` lets one handler serve many concurrent step workers.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use super::handler::{StepFailure, StepHandler, StepInput, StepOutcome};

type OutcomeFuture<'a> = Pin<Box<dyn Future<Output = Result<StepOutcome, StepFailure>> + Send + 'a>>;

/// Object-safe version of [`StepHandler`] with boxed futures.
pub trait StepHandlerDyn: Send + Sync {
    fn execute_boxed(&self, input: StepInput) -> OutcomeFuture<'_>;

    fn resume_boxed(&self, input: StepInput, partial: Value, resume_data: Value)
    -> OutcomeFuture<'_>;
}

impl<T: StepHandler> StepHandlerDyn for T {
    fn execute_boxed(&self, input: StepInput) -> OutcomeFuture<'_> {
        Box::pin(self.execute(input))
    }

    fn resume_boxed(
        &self,
        input: StepInput,
        partial: Value,
        resume_data: Value,
    ) -> OutcomeFuture<'_> {
        Box::pin(self.resume(input, partial, resume_data))
    }
}

/// Type-erased, cheaply cloneable step handler.
#[derive(Clone)]
pub struct BoxStepHandler {
    inner: Arc<dyn StepHandlerDyn>,
}

impl BoxStepHandler {
    pub fn new<T: StepHandler + 'static>(handler: T) -> Self {
        Self {
            inner: Arc::new(handler),
        }
    }

    pub async fn execute(&self, input: StepInput) -> Result<StepOutcome, StepFailure> {
        self.inner.execute_boxed(input).await
    }

    pub async fn resume(
        &self,
        input: StepInput,
        partial: Value,
        resume_data: Value,
    ) -> Result<StepOutcome, StepFailure> {
        self.inner.resume_boxed(input, partial, resume_data).await
    }
}

impl std::fmt::Debug for BoxStepHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxStepHandler").finish_non_exhaustive()
    }
}

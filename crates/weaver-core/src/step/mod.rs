//! Step handlers: the trait agent and function steps delegate to, its boxed
//! wrapper for dynamic dispatch, the name-indexed registry, and built-ins.

pub mod box_handler;
pub mod builtin;
pub mod handler;
pub mod registry;

pub use box_handler::BoxStepHandler;
pub use handler::{StepFailure, StepHandler, StepInput, StepOutcome};
pub use registry::HandlerRegistry;

//! Repository trait definitions (ports).
//!
//! `WorkflowRepository` is the storage interface the infrastructure layer
//! (weaver-infra) implements. The core crate never depends on any specific
//! storage technology; it ships only the in-memory implementation.

pub mod memory;
pub mod workflow;

pub use memory::InMemoryWorkflowRepository;
pub use workflow::{BoxWorkflowRepository, WorkflowRepository, WorkflowRepositoryDyn};

//! Shared domain types for Weaver.
//!
//! Workflow definitions, step kinds, variable references, conditions, run and
//! suspension records, lifecycle events and engine configuration.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod condition;
pub mod config;
pub mod error;
pub mod event;
pub mod variable;
pub mod workflow;

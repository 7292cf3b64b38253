//! Workflow engine logic and repository trait definitions for Weaver.
//!
//! This crate defines the storage port (`WorkflowRepository`) that the
//! infrastructure layer implements, plus everything needed to run workflows
//! in-process. It depends only on `weaver-types` -- never on `weaver-infra`
//! or any database crate.

pub mod event;
pub mod repository;
pub mod step;
pub mod workflow;

//! Infrastructure layer for Weaver.
//!
//! Contains implementations of the `WorkflowRepository` trait defined in
//! `weaver-core`: SQLite storage and a JSON-file store, plus data directory
//! resolution and `config.toml` loading.

pub mod config;
pub mod filesystem;
pub mod sqlite;

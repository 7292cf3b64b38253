//! Observability for Weaver: tracing subscriber initialization with
//! structured logging and optional OpenTelemetry trace export.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, init_tracing_with, shutdown_tracing, LogFormat};

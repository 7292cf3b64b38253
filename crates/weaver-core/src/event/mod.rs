//! Event bus for workflow lifecycle events.
//!
//! Provides an `EventBus` that distributes `WorkflowEvent` messages to all
//! subscribers via a `tokio::sync::broadcast` channel, and an `EventSink`
//! that fans a run's events out to the bus and an optional per-call stream.

pub mod bus;

pub use bus::{EventBus, EventSink};

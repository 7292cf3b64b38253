//! Filesystem storage layer.
//!
//! One JSON document per record under a state directory.

pub mod store;

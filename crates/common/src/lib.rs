//! Shared types used across the orchestrator crates.

pub mod types;

pub use types::{InstanceId, ParseIdError};

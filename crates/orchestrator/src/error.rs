//! Orchestration error types.

use common::InstanceId;
use history_store::HistoryStoreError;
use thiserror::Error;

/// Errors that can occur while creating, driving or querying instances.
///
/// Activity faults are not errors at this level: they are recorded in the
/// instance history and turned into actions by the engine.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// History store error.
    #[error("History store error: {0}")]
    HistoryStore(#[from] HistoryStoreError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Instance not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// Another task in this process is already driving the instance.
    #[error("Instance {0} is already being driven")]
    AlreadyRunning(InstanceId),

    /// The stored input could not be read back as an order.
    #[error("Invalid input for instance {instance_id}: {reason}")]
    InvalidInput {
        instance_id: InstanceId,
        reason: String,
    },

    /// The activity worker pool was shut down.
    #[error("Activity worker pool is closed")]
    WorkerPoolClosed,
}

/// Convenience type alias for orchestration results.
pub type Result<T> = std::result::Result<T, OrchestrationError>;

use thiserror::Error;

use crate::{InstanceId, Sequence};

/// Errors that can occur when interacting with the history store.
#[derive(Debug, Error)]
pub enum HistoryStoreError {
    /// Another writer appended to the instance since it was last read.
    #[error(
        "Concurrency conflict for instance {instance_id}: expected sequence {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        instance_id: InstanceId,
        expected: Sequence,
        actual: Sequence,
    },

    /// The instance was not found in the store.
    #[error("Instance not found: {0}")]
    InstanceNotFound(InstanceId),

    /// An instance with this identifier already exists.
    #[error("Instance already exists: {0}")]
    InstanceAlreadyExists(InstanceId),

    /// The instance history already ends with a terminal event.
    #[error("Instance {0} has already terminated")]
    InstanceTerminated(InstanceId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HistoryStoreError {
    /// Returns true if the operation may succeed when attempted again.
    ///
    /// Only connectivity problems qualify; a conflict or a terminated
    /// instance is an answer, not an outage.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            HistoryStoreError::Database(
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Database(_)
            )
        )
    }
}

/// Result type for history store operations.
pub type Result<T> = std::result::Result<T, HistoryStoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connectivity_errors_are_transient() {
        assert!(HistoryStoreError::Database(sqlx::Error::PoolTimedOut).is_transient());
        assert!(
            HistoryStoreError::Database(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset by peer"
            )))
            .is_transient()
        );
    }

    #[test]
    fn test_answers_are_not_transient() {
        let id = InstanceId::new();
        assert!(!HistoryStoreError::InstanceTerminated(id).is_transient());
        assert!(!HistoryStoreError::InstanceNotFound(id).is_transient());
        assert!(
            !HistoryStoreError::ConcurrencyConflict {
                instance_id: id,
                expected: Sequence::new(1),
                actual: Sequence::new(2),
            }
            .is_transient()
        );
        assert!(!HistoryStoreError::Database(sqlx::Error::PoolClosed).is_transient());
    }
}

//! Append-only, per-instance history log for durable orchestrations.
//!
//! The history of an instance is the source of truth for its progress:
//! the orchestration engine replays it to decide what to do next, and the
//! instance tracker folds it into a status projection.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::InstanceId;
pub use error::{HistoryStoreError, Result};
pub use event::{
    ActivityCompletedData, ActivityFailedData, ActivityScheduledData, FailureKind, HistoryEvent,
    HistoryRecord, OrchestrationCompletedData, OrchestrationFailedData, Sequence,
};
pub use memory::InMemoryHistoryStore;
pub use postgres::PostgresHistoryStore;
pub use store::{AppendOptions, HistoryStore, HistoryStoreExt, StoredInstance};

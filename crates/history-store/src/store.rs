use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{HistoryEvent, HistoryRecord, InstanceId, Result, Sequence};

/// Options for appending an event to an instance's history.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Expected last sequence of the history for optimistic concurrency control.
    /// If None, no sequence check is performed.
    pub expected_sequence: Option<Sequence>,
}

impl AppendOptions {
    /// Creates options with no sequence check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options expecting the history to end at a specific sequence.
    pub fn expect_sequence(sequence: Sequence) -> Self {
        Self {
            expected_sequence: Some(sequence),
        }
    }

    /// Creates options expecting the history to be empty.
    pub fn expect_empty() -> Self {
        Self {
            expected_sequence: Some(Sequence::initial()),
        }
    }
}

/// An instance as persisted: its input plus the full ordered history.
#[derive(Debug, Clone)]
pub struct StoredInstance {
    pub instance_id: InstanceId,
    /// The serialized orchestration input.
    pub input: serde_json::Value,
    pub created_at: DateTime<Utc>,
    /// History records in sequence order.
    pub records: Vec<HistoryRecord>,
}

impl StoredInstance {
    /// Returns the recorded events in order.
    pub fn events(&self) -> impl Iterator<Item = &HistoryEvent> {
        self.records.iter().map(|r| &r.event)
    }

    /// Returns the sequence of the last record, or `Sequence::initial()` if empty.
    pub fn last_sequence(&self) -> Sequence {
        self.records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(Sequence::initial())
    }

    /// Returns true if the history ends with a terminal event.
    pub fn is_terminal(&self) -> bool {
        self.records.last().is_some_and(|r| r.event.is_terminal())
    }

    /// Returns when the instance last changed.
    pub fn last_updated_at(&self) -> DateTime<Utc> {
        self.records
            .last()
            .map(|r| r.recorded_at)
            .unwrap_or(self.created_at)
    }
}

/// Core trait for history store implementations.
///
/// Appends to one instance are serialized and atomic; appends to different
/// instances are independent. All implementations must be thread-safe.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Registers a new instance with its input and an empty history.
    ///
    /// Fails with `InstanceAlreadyExists` if the id is taken.
    async fn create_instance(
        &self,
        instance_id: InstanceId,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Appends a single event to an instance's history.
    ///
    /// If `options.expected_sequence` is set, the operation fails with
    /// `ConcurrencyConflict` when the history has moved on. Appending after a
    /// terminal event fails with `InstanceTerminated`.
    ///
    /// Returns the sequence assigned to the new record.
    async fn append(
        &self,
        instance_id: InstanceId,
        event: HistoryEvent,
        options: AppendOptions,
    ) -> Result<Sequence>;

    /// Reads an instance's history in sequence order.
    async fn read(&self, instance_id: InstanceId) -> Result<Vec<HistoryRecord>>;

    /// Loads an instance with its input and history.
    ///
    /// Returns None if the instance doesn't exist.
    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<StoredInstance>>;

    /// Lists instances whose history has not reached a terminal event,
    /// oldest first.
    async fn list_active_instances(&self) -> Result<Vec<InstanceId>>;
}

/// Extension trait providing convenience methods for history stores.
#[async_trait]
pub trait HistoryStoreExt: HistoryStore {
    /// Appends an event without a sequence check.
    async fn append_event(&self, instance_id: InstanceId, event: HistoryEvent) -> Result<Sequence> {
        self.append(instance_id, event, AppendOptions::new()).await
    }

    /// Checks if an instance has been created.
    async fn instance_exists(&self, instance_id: InstanceId) -> Result<bool> {
        Ok(self.load_instance(instance_id).await?.is_some())
    }

    /// Returns the sequence of the instance's last record.
    async fn last_sequence(&self, instance_id: InstanceId) -> Result<Sequence> {
        let records = self.read(instance_id).await?;
        Ok(records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(Sequence::initial()))
    }
}

// Blanket implementation for all HistoryStore implementations
impl<T: HistoryStore + ?Sized> HistoryStoreExt for T {}

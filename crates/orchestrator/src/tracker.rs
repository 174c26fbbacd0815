//! Instance creation and status queries.

use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::{NewOrder, OrderId};
use history_store::{HistoryRecord, HistoryStore, InstanceId, StoredInstance};
use serde::Serialize;

use crate::engine::replay;
use crate::error::Result;
use crate::order_processing::ORCHESTRATION_NAME;
use crate::state::InstanceState;

/// A point-in-time view of an instance, derived from its history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub instance_id: InstanceId,
    pub order_id: Option<OrderId>,
    pub state: InstanceState,
    /// Output when completed, reason when failed.
    pub output: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub history_length: usize,
}

impl InstanceStatus {
    /// Projects a stored instance.
    pub fn from_stored(stored: &StoredInstance) -> Self {
        let progress = replay(stored.events());
        let order_id = stored
            .input
            .get("id")
            .and_then(|id| serde_json::from_value(id.clone()).ok());

        Self {
            instance_id: stored.instance_id,
            order_id,
            state: progress.state(),
            output: progress.output().map(str::to_string),
            created_at: stored.created_at,
            last_updated_at: stored.last_updated_at(),
            history_length: stored.records.len(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// Creates instances and answers status queries.
///
/// Queries are read-only: they load the history and fold it, so they may be
/// served by any process sharing the store.
#[derive(Clone)]
pub struct InstanceTracker<H>
where
    H: HistoryStore,
{
    store: H,
}

impl<H> InstanceTracker<H>
where
    H: HistoryStore,
{
    /// Creates a new tracker over `store`.
    pub fn new(store: H) -> Self {
        Self { store }
    }

    /// Persists a new instance for `new_order` and returns its id.
    ///
    /// Missing order id and creation time are filled in here, so the stored
    /// input is exactly what every activity attempt sees.
    #[tracing::instrument(skip(self, new_order), fields(orchestration = ORCHESTRATION_NAME))]
    pub async fn create(&self, new_order: NewOrder) -> Result<InstanceId> {
        let now = Utc::now();
        let order = new_order.into_order(now);
        let input = serde_json::to_value(&order)?;
        let instance_id = InstanceId::new();

        self.store.create_instance(instance_id, input, now).await?;

        metrics::counter!("orchestrations_started_total").increment(1);
        tracing::info!(%instance_id, order_id = %order.id, "orchestration instance created");
        Ok(instance_id)
    }

    /// Returns the status of an instance, or None if it doesn't exist.
    pub async fn status(&self, instance_id: InstanceId) -> Result<Option<InstanceStatus>> {
        let stored = self.store.load_instance(instance_id).await?;
        Ok(stored.as_ref().map(InstanceStatus::from_stored))
    }

    /// Returns the full history of an instance, or None if it doesn't exist.
    pub async fn history(&self, instance_id: InstanceId) -> Result<Option<Vec<HistoryRecord>>> {
        let stored = self.store.load_instance(instance_id).await?;
        Ok(stored.map(|s| s.records))
    }

    /// Polls until the instance is terminal or `timeout` elapses, returning
    /// the last observed status.
    pub async fn wait_for_completion(
        &self,
        instance_id: InstanceId,
        timeout: Duration,
    ) -> Result<Option<InstanceStatus>> {
        let poll_interval = Duration::from_millis(10);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let status = self.status(instance_id).await?;
            match &status {
                Some(s) if !s.is_terminal() && tokio::time::Instant::now() < deadline => {
                    tokio::time::sleep(poll_interval).await;
                }
                _ => return Ok(status),
            }
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::{
    HistoryEvent, HistoryRecord, HistoryStoreError, InstanceId, Result, Sequence,
    store::{AppendOptions, HistoryStore, StoredInstance},
};

#[derive(Debug)]
struct InstanceLog {
    input: serde_json::Value,
    created_at: DateTime<Utc>,
    records: Vec<HistoryRecord>,
}

impl InstanceLog {
    fn last_sequence(&self) -> Sequence {
        self.records
            .last()
            .map(|r| r.sequence)
            .unwrap_or(Sequence::initial())
    }

    fn is_terminal(&self) -> bool {
        self.records.last().is_some_and(|r| r.event.is_terminal())
    }
}

/// In-memory history store.
///
/// Each instance's log sits behind its own mutex, so appends to one instance
/// are serialized while appends to different instances never wait on each
/// other. Nothing survives a process restart; use it for tests and local runs.
#[derive(Clone, Default)]
pub struct InMemoryHistoryStore {
    instances: Arc<RwLock<HashMap<InstanceId, Arc<Mutex<InstanceLog>>>>>,
}

impl InMemoryHistoryStore {
    /// Creates a new empty in-memory history store.
    pub fn new() -> Self {
        Self::default()
    }

    async fn log(&self, instance_id: InstanceId) -> Option<Arc<Mutex<InstanceLog>>> {
        self.instances.read().await.get(&instance_id).cloned()
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn create_instance(
        &self,
        instance_id: InstanceId,
        input: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&instance_id) {
            return Err(HistoryStoreError::InstanceAlreadyExists(instance_id));
        }
        instances.insert(
            instance_id,
            Arc::new(Mutex::new(InstanceLog {
                input,
                created_at,
                records: Vec::new(),
            })),
        );
        Ok(())
    }

    async fn append(
        &self,
        instance_id: InstanceId,
        event: HistoryEvent,
        options: AppendOptions,
    ) -> Result<Sequence> {
        let log = self
            .log(instance_id)
            .await
            .ok_or(HistoryStoreError::InstanceNotFound(instance_id))?;
        let mut log = log.lock().await;

        if log.is_terminal() {
            return Err(HistoryStoreError::InstanceTerminated(instance_id));
        }

        let current = log.last_sequence();
        if let Some(expected) = options.expected_sequence
            && current != expected
        {
            return Err(HistoryStoreError::ConcurrencyConflict {
                instance_id,
                expected,
                actual: current,
            });
        }

        let sequence = current.next();
        metrics::counter!("history_events_appended_total", "event_type" => event.event_type())
            .increment(1);
        tracing::debug!(%instance_id, %sequence, event_type = event.event_type(), "history event appended");

        log.records.push(HistoryRecord {
            instance_id,
            sequence,
            recorded_at: Utc::now(),
            event,
        });

        Ok(sequence)
    }

    async fn read(&self, instance_id: InstanceId) -> Result<Vec<HistoryRecord>> {
        let log = self
            .log(instance_id)
            .await
            .ok_or(HistoryStoreError::InstanceNotFound(instance_id))?;
        let log = log.lock().await;
        Ok(log.records.clone())
    }

    async fn load_instance(&self, instance_id: InstanceId) -> Result<Option<StoredInstance>> {
        let Some(log) = self.log(instance_id).await else {
            return Ok(None);
        };
        let log = log.lock().await;
        Ok(Some(StoredInstance {
            instance_id,
            input: log.input.clone(),
            created_at: log.created_at,
            records: log.records.clone(),
        }))
    }

    async fn list_active_instances(&self) -> Result<Vec<InstanceId>> {
        let logs: Vec<_> = self
            .instances
            .read()
            .await
            .iter()
            .map(|(id, log)| (*id, log.clone()))
            .collect();

        let mut active = Vec::new();
        for (id, log) in logs {
            let log = log.lock().await;
            if !log.is_terminal() {
                active.push((log.created_at, id));
            }
        }
        active.sort();
        Ok(active.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FailureKind;

    fn scheduled(name: &str) -> HistoryEvent {
        HistoryEvent::activity_scheduled(name, serde_json::json!({"test": true}), Utc::now())
    }

    async fn store_with_instance() -> (InMemoryHistoryStore, InstanceId) {
        let store = InMemoryHistoryStore::new();
        let instance_id = InstanceId::new();
        store
            .create_instance(instance_id, serde_json::json!({"order": 1}), Utc::now())
            .await
            .unwrap();
        (store, instance_id)
    }

    #[tokio::test]
    async fn append_and_read_in_order() {
        let (store, id) = store_with_instance().await;

        let s1 = store
            .append(id, scheduled("ValidateOrder"), AppendOptions::expect_empty())
            .await
            .unwrap();
        let s2 = store
            .append(
                id,
                HistoryEvent::activity_completed("ValidateOrder", serde_json::json!(true), 1),
                AppendOptions::expect_sequence(s1),
            )
            .await
            .unwrap();

        assert_eq!(s1, Sequence::first());
        assert_eq!(s2, Sequence::new(2));

        let records = store.read(id).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].event.event_type(), "ActivityScheduled");
        assert_eq!(records[1].event.event_type(), "ActivityCompleted");
        assert!(records.iter().all(|r| r.instance_id == id));
    }

    #[tokio::test]
    async fn duplicate_instance_is_rejected() {
        let (store, id) = store_with_instance().await;

        let result = store
            .create_instance(id, serde_json::json!({}), Utc::now())
            .await;
        assert!(matches!(
            result,
            Err(HistoryStoreError::InstanceAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn append_to_unknown_instance_fails() {
        let store = InMemoryHistoryStore::new();
        let result = store
            .append(InstanceId::new(), scheduled("ValidateOrder"), AppendOptions::new())
            .await;
        assert!(matches!(result, Err(HistoryStoreError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn concurrency_conflict_on_stale_sequence() {
        let (store, id) = store_with_instance().await;
        store
            .append(id, scheduled("ValidateOrder"), AppendOptions::expect_empty())
            .await
            .unwrap();

        let result = store
            .append(
                id,
                HistoryEvent::activity_completed("ValidateOrder", serde_json::json!(true), 1),
                AppendOptions::expect_empty(),
            )
            .await;

        assert!(matches!(
            result,
            Err(HistoryStoreError::ConcurrencyConflict { expected, actual, .. })
                if expected == Sequence::initial() && actual == Sequence::first()
        ));
        assert_eq!(store.read(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn nothing_may_follow_a_terminal_event() {
        let (store, id) = store_with_instance().await;
        store
            .append(id, HistoryEvent::orchestration_failed("cancelled"), AppendOptions::new())
            .await
            .unwrap();

        let result = store
            .append(
                id,
                HistoryEvent::activity_completed("SaveOrder", serde_json::json!(null), 1),
                AppendOptions::new(),
            )
            .await;

        assert!(matches!(
            result,
            Err(HistoryStoreError::InstanceTerminated(_))
        ));
        assert_eq!(store.read(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn load_instance_returns_input_and_history() {
        let (store, id) = store_with_instance().await;
        store
            .append(id, scheduled("ValidateOrder"), AppendOptions::new())
            .await
            .unwrap();

        let instance = store.load_instance(id).await.unwrap().unwrap();
        assert_eq!(instance.instance_id, id);
        assert_eq!(instance.input, serde_json::json!({"order": 1}));
        assert_eq!(instance.records.len(), 1);
        assert_eq!(instance.last_sequence(), Sequence::first());
        assert!(!instance.is_terminal());

        assert!(store.load_instance(InstanceId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_active_skips_terminal_instances() {
        let store = InMemoryHistoryStore::new();
        let running = InstanceId::new();
        let finished = InstanceId::new();
        for id in [running, finished] {
            store
                .create_instance(id, serde_json::json!({}), Utc::now())
                .await
                .unwrap();
        }
        store
            .append(finished, HistoryEvent::orchestration_completed("ok"), AppendOptions::new())
            .await
            .unwrap();
        store
            .append(
                running,
                HistoryEvent::activity_failed("SaveOrder", "down", FailureKind::Transient, 1),
                AppendOptions::new(),
            )
            .await
            .unwrap();

        let active = store.list_active_instances().await.unwrap();
        assert_eq!(active, vec![running]);
    }

    #[tokio::test]
    async fn concurrent_appends_to_one_instance_are_serialized() {
        let (store, id) = store_with_instance().await;

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .append(
                        id,
                        HistoryEvent::activity_failed("SaveOrder", format!("e{i}"), FailureKind::Transient, 1),
                        AppendOptions::new(),
                    )
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let records = store.read(id).await.unwrap();
        let sequences: Vec<i64> = records.iter().map(|r| r.sequence.as_i64()).collect();
        assert_eq!(sequences, (1..=20).collect::<Vec<_>>());
    }
}

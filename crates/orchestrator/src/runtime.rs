//! Drives orchestration instances by executing engine actions.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use domain::NewOrder;
use history_store::{
    AppendOptions, FailureKind, HistoryEvent, HistoryStore, HistoryStoreError, HistoryStoreExt,
    InstanceId, Sequence, StoredInstance,
};
use serde_json::Value;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio::task::JoinHandle;

use crate::activities::{ActivityError, ActivityExecutor, ActivityName};
use crate::engine::{Action, Engine, OrchestrationInstance};
use crate::error::{OrchestrationError, Result};
use crate::order_processing;
use crate::retry::RetryPolicy;
use crate::services::{NotificationPublisher, OrderRepository};
use crate::tracker::{InstanceStatus, InstanceTracker};

const MIN_STORE_RETRY_DELAY: Duration = Duration::from_millis(1);

/// Runtime tuning.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Activity attempts that may run at once across all instances.
    pub max_concurrent_activities: usize,
    /// Upper bound for a single activity attempt.
    pub activity_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_activities: 16,
            activity_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Outcome of an append attempt.
enum Recorded {
    Appended(Sequence),
    /// Someone else appended first; reload and decide again.
    Stale,
    /// The instance reached a terminal event; stop driving it.
    Terminated,
}

/// What the drive loop does after an action was carried out.
enum Step {
    Record(HistoryEvent, AppendOptions),
    Reload,
    Stop,
}

struct RuntimeInner<H, R, N>
where
    H: HistoryStore,
    R: OrderRepository,
    N: NotificationPublisher,
{
    store: H,
    tracker: InstanceTracker<H>,
    engine: Engine,
    executor: ActivityExecutor<R, N>,
    permits: Semaphore,
    activity_timeout: Duration,
    driving: Mutex<HashSet<InstanceId>>,
}

/// Executes order-processing instances.
///
/// Each instance is driven by its own task: load the history, ask the engine
/// for the next action, carry it out, append the outcome, repeat. Appends are
/// conditional on the history not having moved, so a cancellation racing
/// with an activity always wins and the late outcome is discarded.
///
/// Activity attempts from all instances share a bounded worker pool.
pub struct OrchestrationRuntime<H, R, N>
where
    H: HistoryStore,
    R: OrderRepository,
    N: NotificationPublisher,
{
    inner: Arc<RuntimeInner<H, R, N>>,
}

impl<H, R, N> Clone for OrchestrationRuntime<H, R, N>
where
    H: HistoryStore,
    R: OrderRepository,
    N: NotificationPublisher,
{
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H, R, N> OrchestrationRuntime<H, R, N>
where
    H: HistoryStore + Clone + 'static,
    R: OrderRepository + 'static,
    N: NotificationPublisher + 'static,
{
    /// Creates a new runtime.
    pub fn new(store: H, repository: R, publisher: N, config: RuntimeConfig) -> Self {
        let tracker = InstanceTracker::new(store.clone());
        Self {
            inner: Arc::new(RuntimeInner {
                store,
                tracker,
                engine: Engine::new(config.retry_policy),
                executor: ActivityExecutor::new(repository, publisher),
                permits: Semaphore::new(config.max_concurrent_activities.max(1)),
                activity_timeout: config.activity_timeout,
                driving: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn tracker(&self) -> &InstanceTracker<H> {
        &self.inner.tracker
    }

    pub fn store(&self) -> &H {
        &self.inner.store
    }

    pub fn executor(&self) -> &ActivityExecutor<R, N> {
        &self.inner.executor
    }

    /// Creates an instance for `new_order` and starts driving it in the background.
    pub async fn start(&self, new_order: NewOrder) -> Result<InstanceId> {
        let instance_id = self.inner.tracker.create(new_order).await?;
        self.spawn(instance_id);
        Ok(instance_id)
    }

    /// Drives `instance_id` on a background task.
    pub fn spawn(&self, instance_id: InstanceId) -> JoinHandle<()> {
        let runtime = self.clone();
        tokio::spawn(async move {
            match runtime.run(instance_id).await {
                Ok(status) => {
                    tracing::debug!(%instance_id, state = %status.state, "driver finished")
                }
                Err(OrchestrationError::AlreadyRunning(_)) => {
                    tracing::debug!(%instance_id, "instance already driven by another task")
                }
                Err(e) => tracing::error!(%instance_id, error = %e, "orchestration driver failed"),
            }
        })
    }

    /// Spawns drivers for every instance that has not reached a terminal event.
    ///
    /// Call once at startup; instances left mid-activity by a crash resume
    /// from their recorded history.
    pub async fn recover(&self) -> Result<Vec<InstanceId>> {
        let active = self.inner.store.list_active_instances().await?;
        tracing::info!(count = active.len(), "recovering active instances");
        for instance_id in &active {
            self.spawn(*instance_id);
        }
        Ok(active)
    }

    /// Cancels an instance by recording a terminal failure.
    ///
    /// Returns false if the instance had already finished. An activity that
    /// is running when the instance is cancelled runs to completion, but its
    /// outcome is not recorded.
    #[tracing::instrument(skip(self))]
    pub async fn cancel(&self, instance_id: InstanceId) -> Result<bool> {
        let event = HistoryEvent::orchestration_failed(order_processing::CANCELLED);
        match self.inner.store.append_event(instance_id, event).await {
            Ok(_) => {
                metrics::counter!("orchestrations_cancelled_total").increment(1);
                tracing::info!("orchestration cancelled");
                Ok(true)
            }
            Err(HistoryStoreError::InstanceTerminated(_)) => Ok(false),
            Err(HistoryStoreError::InstanceNotFound(_)) => {
                Err(OrchestrationError::InstanceNotFound(instance_id))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drives an instance until it is terminal and returns its final status.
    ///
    /// Fails with `AlreadyRunning` if another task of this runtime is
    /// driving the same instance.
    #[tracing::instrument(skip(self), fields(orchestration = order_processing::ORCHESTRATION_NAME))]
    pub async fn run(&self, instance_id: InstanceId) -> Result<InstanceStatus> {
        let _guard = DriveGuard::acquire(&self.inner.driving, instance_id)?;

        loop {
            let stored = self
                .load(instance_id)
                .await?
                .ok_or(OrchestrationError::InstanceNotFound(instance_id))?;
            if stored.is_terminal() {
                break;
            }
            let expected = AppendOptions::expect_sequence(stored.last_sequence());

            let step = match OrchestrationInstance::from_stored(stored) {
                Ok(instance) => {
                    let action = self.inner.engine.advance(&instance);
                    self.perform(&instance, action).await?
                }
                Err(e) => {
                    tracing::error!(error = %e, "stored input is not an order");
                    Step::Record(
                        HistoryEvent::orchestration_failed(order_processing::error_reason(&e)),
                        expected,
                    )
                }
            };

            match step {
                Step::Record(event, options) => {
                    let finished = event.is_terminal().then(|| event.clone());
                    match self.record(instance_id, event, options).await? {
                        Recorded::Appended(_) => {
                            if let Some(event) = finished {
                                report_finished(instance_id, &event);
                            }
                        }
                        Recorded::Stale => {}
                        Recorded::Terminated => break,
                    }
                }
                Step::Reload => {}
                Step::Stop => break,
            }
        }

        self.load(instance_id)
            .await?
            .map(|stored| InstanceStatus::from_stored(&stored))
            .ok_or(OrchestrationError::InstanceNotFound(instance_id))
    }

    async fn perform(&self, instance: &OrchestrationInstance, action: Action) -> Result<Step> {
        let instance_id = instance.instance_id;
        let expected = AppendOptions::expect_sequence(instance.last_sequence());

        match action {
            Action::Idle => Ok(Step::Stop),
            Action::Complete { output } => Ok(Step::Record(
                HistoryEvent::orchestration_completed(output),
                expected,
            )),
            Action::Fail { reason } => Ok(Step::Record(
                HistoryEvent::orchestration_failed(reason),
                expected,
            )),
            Action::ScheduleActivity { activity, input } => {
                let permit = self.acquire_permit().await?;
                let timeout = chrono::Duration::from_std(self.inner.activity_timeout)
                    .unwrap_or_else(|_| chrono::Duration::days(1));
                let scheduled = HistoryEvent::activity_scheduled(
                    activity.as_str(),
                    input.clone(),
                    Utc::now() + timeout,
                );

                let sequence = match self.record(instance_id, scheduled, expected).await? {
                    Recorded::Appended(sequence) => sequence,
                    Recorded::Stale => return Ok(Step::Reload),
                    Recorded::Terminated => return Ok(Step::Stop),
                };
                tracing::info!(%activity, "activity scheduled");

                let outcome = self.execute_attempt(activity, &input, 1, permit).await;
                Ok(Step::Record(outcome, AppendOptions::expect_sequence(sequence)))
            }
            Action::RetryActivity {
                activity,
                input,
                attempt,
                delay,
            } => {
                metrics::counter!("activity_retries_total", "activity" => activity.as_str())
                    .increment(1);
                tracing::info!(
                    %activity,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying activity"
                );
                tokio::time::sleep(delay).await;

                let permit = self.acquire_permit().await?;
                // History may have moved while waiting, e.g. a cancellation
                let current = self
                    .persist("last_sequence", || self.inner.store.last_sequence(instance_id))
                    .await?;
                if current != instance.last_sequence() {
                    return Ok(Step::Reload);
                }

                let outcome = self.execute_attempt(activity, &input, attempt, permit).await;
                Ok(Step::Record(outcome, expected))
            }
            Action::AwaitActivity { activity, attempt } => {
                let deadline = instance
                    .scheduled_deadline(activity)
                    .unwrap_or_else(Utc::now);
                let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                tracing::warn!(
                    %activity,
                    attempt,
                    remaining_ms = remaining.as_millis() as u64,
                    "activity outcome was never recorded; waiting for its deadline"
                );
                tokio::time::sleep(remaining).await;

                Ok(Step::Record(
                    HistoryEvent::activity_failed(
                        activity.as_str(),
                        format!("{activity} timed out before an outcome was recorded"),
                        FailureKind::Transient,
                        attempt,
                    ),
                    expected,
                ))
            }
        }
    }

    async fn acquire_permit(&self) -> Result<SemaphorePermit<'_>> {
        self.inner
            .permits
            .acquire()
            .await
            .map_err(|_| OrchestrationError::WorkerPoolClosed)
    }

    /// Runs one attempt while holding a worker permit and turns the result
    /// into the event to record.
    async fn execute_attempt(
        &self,
        activity: ActivityName,
        input: &Value,
        attempt: u32,
        _permit: SemaphorePermit<'_>,
    ) -> HistoryEvent {
        let timeout = self.inner.activity_timeout;
        metrics::counter!("activity_executions_total", "activity" => activity.as_str())
            .increment(1);
        let started = Instant::now();

        let execution = self.inner.executor.execute(activity, input);
        let result = match tokio::time::timeout(timeout, execution).await {
            Ok(result) => result,
            Err(_) => Err(ActivityError::Transient(format!(
                "{activity} timed out after {}ms",
                timeout.as_millis()
            ))),
        };

        metrics::histogram!("activity_duration_seconds", "activity" => activity.as_str())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(result) => {
                tracing::debug!(%activity, attempt, "activity attempt succeeded");
                HistoryEvent::activity_completed(activity.as_str(), result, attempt)
            }
            Err(err) => {
                metrics::counter!(
                    "activity_failures_total",
                    "activity" => activity.as_str(),
                    "kind" => err.kind().as_str()
                )
                .increment(1);
                tracing::warn!(
                    %activity,
                    attempt,
                    kind = %err.kind(),
                    error = %err,
                    "activity attempt failed"
                );
                HistoryEvent::activity_failed(
                    activity.as_str(),
                    err.to_string(),
                    err.kind(),
                    attempt,
                )
            }
        }
    }

    async fn load(&self, instance_id: InstanceId) -> Result<Option<StoredInstance>> {
        self.persist("load_instance", || self.inner.store.load_instance(instance_id))
            .await
            .map_err(OrchestrationError::from)
    }

    /// Runs a store operation, waiting out transient store errors with the
    /// retry policy's backoff. There is no attempt limit: an outcome that was
    /// already produced is kept until it can be written.
    async fn persist<T, F, Fut>(
        &self,
        operation: &'static str,
        mut op: F,
    ) -> history_store::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = history_store::Result<T>>,
    {
        let mut failures = 0u32;
        loop {
            match op().await {
                Err(e) if e.is_transient() => {
                    failures = failures.saturating_add(1);
                    let delay = self
                        .inner
                        .engine
                        .retry_policy()
                        .backoff_after(failures)
                        .max(MIN_STORE_RETRY_DELAY);
                    metrics::counter!("history_store_retries_total", "operation" => operation)
                        .increment(1);
                    tracing::warn!(
                        operation,
                        failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "history store unavailable; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                result => return result,
            }
        }
    }

    async fn record(
        &self,
        instance_id: InstanceId,
        event: HistoryEvent,
        options: AppendOptions,
    ) -> Result<Recorded> {
        let appended = self
            .persist("append", || {
                self.inner
                    .store
                    .append(instance_id, event.clone(), options.clone())
            })
            .await;
        match appended {
            Ok(sequence) => Ok(Recorded::Appended(sequence)),
            Err(HistoryStoreError::ConcurrencyConflict {
                expected, actual, ..
            }) => {
                tracing::debug!(%expected, %actual, "history moved on; reloading");
                Ok(Recorded::Stale)
            }
            Err(HistoryStoreError::InstanceTerminated(_)) => {
                tracing::info!("instance already terminal; discarding outcome");
                Ok(Recorded::Terminated)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn report_finished(instance_id: InstanceId, event: &HistoryEvent) {
    match event {
        HistoryEvent::OrchestrationCompleted(data) => {
            metrics::counter!("orchestrations_completed_total").increment(1);
            tracing::info!(%instance_id, output = %data.output, "orchestration completed");
        }
        HistoryEvent::OrchestrationFailed(data) => {
            metrics::counter!("orchestrations_failed_total").increment(1);
            tracing::warn!(%instance_id, reason = %data.reason, "orchestration failed");
        }
        _ => {}
    }
}

/// Marks an instance as driven by this process until dropped.
struct DriveGuard<'a> {
    driving: &'a Mutex<HashSet<InstanceId>>,
    instance_id: InstanceId,
}

impl<'a> DriveGuard<'a> {
    fn acquire(driving: &'a Mutex<HashSet<InstanceId>>, instance_id: InstanceId) -> Result<Self> {
        let inserted = driving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(instance_id);
        if !inserted {
            return Err(OrchestrationError::AlreadyRunning(instance_id));
        }
        Ok(Self {
            driving,
            instance_id,
        })
    }
}

impl Drop for DriveGuard<'_> {
    fn drop(&mut self) {
        self.driving
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.instance_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryNotificationPublisher, InMemoryOrderRepository};
    use crate::state::InstanceState;
    use domain::{Money, OrderItem};
    use history_store::InMemoryHistoryStore;

    type TestRuntime = OrchestrationRuntime<
        InMemoryHistoryStore,
        InMemoryOrderRepository,
        InMemoryNotificationPublisher,
    >;

    fn runtime() -> TestRuntime {
        OrchestrationRuntime::new(
            InMemoryHistoryStore::new(),
            InMemoryOrderRepository::new(),
            InMemoryNotificationPublisher::new(),
            RuntimeConfig {
                max_concurrent_activities: 4,
                activity_timeout: Duration::from_secs(5),
                retry_policy: RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5)),
            },
        )
    }

    fn new_order() -> NewOrder {
        NewOrder {
            customer_name: Some("Alice".to_string()),
            items: Some(vec![OrderItem::new("P1", "Widget", 2, Money::from_cents(999))]),
            total_amount: Money::from_cents(1998),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_drives_instance_to_completion() {
        let runtime = runtime();
        let id = runtime.tracker().create(new_order()).await.unwrap();

        let status = runtime.run(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Completed);
        assert_eq!(status.history_length, 7);
        assert_eq!(runtime.executor().repository().order_count(), 1);
        assert_eq!(runtime.executor().publisher().published_count(), 1);
    }

    #[tokio::test]
    async fn test_run_on_terminal_instance_is_a_no_op() {
        let runtime = runtime();
        let id = runtime.tracker().create(new_order()).await.unwrap();
        runtime.run(id).await.unwrap();

        let status = runtime.run(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Completed);
        assert_eq!(status.history_length, 7);
        assert_eq!(runtime.executor().repository().save_calls(), 1);
    }

    #[tokio::test]
    async fn test_run_unknown_instance() {
        let result = runtime().run(InstanceId::new()).await;
        assert!(matches!(result, Err(OrchestrationError::InstanceNotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_results() {
        let runtime = runtime();
        let id = runtime.tracker().create(new_order()).await.unwrap();

        assert!(runtime.cancel(id).await.unwrap());
        assert!(!runtime.cancel(id).await.unwrap());
        assert!(matches!(
            runtime.cancel(InstanceId::new()).await,
            Err(OrchestrationError::InstanceNotFound(_))
        ));

        let status = runtime.run(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Failed);
        assert_eq!(status.output.as_deref(), Some("cancelled"));
        assert_eq!(runtime.executor().repository().save_calls(), 0);
    }

    #[tokio::test]
    async fn test_drive_guard_rejects_second_driver() {
        let driving = Mutex::new(HashSet::new());
        let id = InstanceId::new();

        let guard = DriveGuard::acquire(&driving, id).unwrap();
        assert!(matches!(
            DriveGuard::acquire(&driving, id),
            Err(OrchestrationError::AlreadyRunning(_))
        ));
        drop(guard);
        assert!(DriveGuard::acquire(&driving, id).is_ok());
    }

    #[tokio::test]
    async fn test_invalid_stored_input_fails_instance() {
        let runtime = runtime();
        let id = InstanceId::new();
        runtime
            .store()
            .create_instance(id, serde_json::json!({"not": "an order"}), Utc::now())
            .await
            .unwrap();

        let status = runtime.run(id).await.unwrap();
        assert_eq!(status.state, InstanceState::Failed);
        assert!(
            status
                .output
                .unwrap()
                .starts_with("Error processing order: Invalid input")
        );
    }
}

//! Order repository trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use domain::{Order, OrderId};
use thiserror::Error;

/// Errors raised by an order repository.
#[derive(Debug, Clone, Error)]
pub enum PersistenceError {
    /// The backing store could not be reached; the save may be retried.
    #[error("order store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the order; retrying cannot help.
    #[error("order rejected by store: {0}")]
    Rejected(String),
}

/// What a save actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// The order was written.
    Inserted,
    /// An order with the same id was already stored; nothing changed.
    AlreadyExists,
}

impl SaveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaveOutcome::Inserted => "inserted",
            SaveOutcome::AlreadyExists => "already_exists",
        }
    }
}

/// Durable storage for processed orders.
///
/// Saves are keyed by order id and must be idempotent: an activity attempt
/// can be re-executed after a crash, so saving the same order twice has to
/// leave a single stored copy.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Stores the order if no order with the same id exists.
    async fn save(&self, order: &Order) -> Result<SaveOutcome, PersistenceError>;
}

#[derive(Debug, Default)]
struct InMemoryRepositoryState {
    orders: HashMap<OrderId, Order>,
    save_calls: usize,
    transient_failures: u32,
    reject: bool,
    delay: Duration,
    in_flight: usize,
    peak_in_flight: usize,
}

/// In-memory order repository with failure injection for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderRepository {
    state: Arc<RwLock<InMemoryRepositoryState>>,
}

impl InMemoryOrderRepository {
    /// Creates a new empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` saves fail as unavailable.
    pub fn fail_next_saves(&self, count: u32) {
        self.write().transient_failures = count;
    }

    /// Makes every save fail as rejected while set.
    pub fn set_reject(&self, reject: bool) {
        self.write().reject = reject;
    }

    /// Delays every save by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.write().delay = delay;
    }

    /// Returns the number of stored orders.
    pub fn order_count(&self) -> usize {
        self.read().orders.len()
    }

    /// Returns the number of times `save` was called, including failed calls.
    pub fn save_calls(&self) -> usize {
        self.read().save_calls
    }

    /// Returns the largest number of saves that were running at the same time.
    pub fn peak_concurrent_saves(&self) -> usize {
        self.read().peak_in_flight
    }

    /// Returns true if an order with `id` is stored.
    pub fn contains(&self, id: OrderId) -> bool {
        self.read().orders.contains_key(&id)
    }

    /// Returns the stored order with `id`.
    pub fn get(&self, id: OrderId) -> Option<Order> {
        self.read().orders.get(&id).cloned()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryRepositoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryRepositoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn save(&self, order: &Order) -> Result<SaveOutcome, PersistenceError> {
        let _in_flight = InFlightSave::enter(self);
        let delay = self.read().delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        state.save_calls += 1;

        if state.reject {
            return Err(PersistenceError::Rejected(format!(
                "order {} violates a storage constraint",
                order.id
            )));
        }
        if state.transient_failures > 0 {
            state.transient_failures -= 1;
            return Err(PersistenceError::Unavailable(
                "connection refused".to_string(),
            ));
        }

        if state.orders.contains_key(&order.id) {
            return Ok(SaveOutcome::AlreadyExists);
        }
        state.orders.insert(order.id, order.clone());
        Ok(SaveOutcome::Inserted)
    }
}

/// Counts a running save until dropped, including when the save is abandoned
/// by a timeout.
struct InFlightSave<'a> {
    repository: &'a InMemoryOrderRepository,
}

impl<'a> InFlightSave<'a> {
    fn enter(repository: &'a InMemoryOrderRepository) -> Self {
        let mut state = repository.write();
        state.in_flight += 1;
        state.peak_in_flight = state.peak_in_flight.max(state.in_flight);
        Self { repository }
    }
}

impl Drop for InFlightSave<'_> {
    fn drop(&mut self) {
        let mut state = self.repository.write();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

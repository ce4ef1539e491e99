//! The counter backend seen through the narrow interface the write path needs.

use crate::core::StoreError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Durable home of counter values (a document database in production).
///
/// Implementations must report a missing entity as [`StoreError::NotFound`]
/// and overload or connectivity problems with one of the retryable variants.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn increment(&self, entity_id: &str, delta: i64) -> Result<(), StoreError>;

    async fn get(&self, entity_id: &str) -> Result<i64, StoreError>;
}

/// The backend write injected into an aggregator.
pub type IncrementFn =
    Arc<dyn Fn(String, i64) -> BoxFuture<'static, Result<(), StoreError>> + Send + Sync>;

/// Wraps a closure returning a future into an [`IncrementFn`].
pub fn increment_fn<F, Fut>(f: F) -> IncrementFn
where
    F: Fn(String, i64) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), StoreError>> + Send + 'static,
{
    Arc::new(
        move |entity_id: String, delta: i64| -> BoxFuture<'static, Result<(), StoreError>> {
            Box::pin(f(entity_id, delta))
        },
    )
}

/// Routes an aggregator's writes to `store.increment`.
pub fn increment_fn_from_store<S>(store: Arc<S>) -> IncrementFn
where
    S: CounterStore + 'static,
{
    increment_fn(move |entity_id: String, delta| {
        let store = store.clone();
        async move { store.increment(&entity_id, delta).await }
    })
}

#[derive(Debug, Default)]
struct MemoryState {
    counters: HashMap<String, i64>,
    scripted_failures: HashMap<String, VecDeque<StoreError>>,
    increment_calls: u64,
}

/// Process-local [`CounterStore`] with failure injection.
///
/// Only registered entities exist; everything else is `NotFound`.
#[derive(Debug, Default)]
pub struct InMemoryCounterStore {
    state: Mutex<MemoryState>,
}

impl InMemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the counter for `entity_id` at zero if it does not exist yet.
    pub fn register(&self, entity_id: &str) {
        self.lock_state()
            .counters
            .entry(entity_id.to_string())
            .or_insert(0);
    }

    /// Makes the next `times` calls touching `entity_id` fail with `error`.
    pub fn fail_next(&self, entity_id: &str, error: StoreError, times: usize) {
        let mut state = self.lock_state();
        let queue = state
            .scripted_failures
            .entry(entity_id.to_string())
            .or_default();
        queue.extend(std::iter::repeat_n(error, times));
    }

    /// Current value, if the entity exists.
    pub fn value(&self, entity_id: &str) -> Option<i64> {
        self.lock_state().counters.get(entity_id).copied()
    }

    /// All counters, sorted by entity id.
    pub fn snapshot(&self) -> Vec<(String, i64)> {
        let state = self.lock_state();
        let mut counters: Vec<(String, i64)> = state
            .counters
            .iter()
            .map(|(id, value)| (id.clone(), *value))
            .collect();
        counters.sort();
        counters
    }

    /// Number of `increment` calls received, failed ones included.
    pub fn increment_calls(&self) -> u64 {
        self.lock_state().increment_calls
    }

    fn take_scripted_failure(state: &mut MemoryState, entity_id: &str) -> Option<StoreError> {
        let queue = state.scripted_failures.get_mut(entity_id)?;
        let failure = queue.pop_front();
        if queue.is_empty() {
            state.scripted_failures.remove(entity_id);
        }
        failure
    }

    fn lock_state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl CounterStore for InMemoryCounterStore {
    async fn increment(&self, entity_id: &str, delta: i64) -> Result<(), StoreError> {
        let mut state = self.lock_state();
        state.increment_calls += 1;
        if let Some(err) = Self::take_scripted_failure(&mut state, entity_id) {
            return Err(err);
        }

        let counter = state
            .counters
            .get_mut(entity_id)
            .ok_or_else(|| StoreError::NotFound(entity_id.to_string()))?;
        *counter = counter.checked_add(delta).ok_or_else(|| {
            StoreError::InvalidArgument(format!(
                "increment of {} overflows counter '{}'",
                delta, entity_id
            ))
        })?;
        Ok(())
    }

    async fn get(&self, entity_id: &str) -> Result<i64, StoreError> {
        let mut state = self.lock_state();
        if let Some(err) = Self::take_scripted_failure(&mut state, entity_id) {
            return Err(err);
        }
        state
            .counters
            .get(entity_id)
            .copied()
            .ok_or_else(|| StoreError::NotFound(entity_id.to_string()))
    }
}

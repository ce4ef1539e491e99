// ============================================================================
// tallyflush Library
// ============================================================================

pub mod core;
pub mod config;
pub mod retry;
pub mod rate_limit;
pub mod store;
pub mod aggregator;
pub mod service;

// Re-export main types for convenience
pub use crate::core::{Result, Retryable, StoreError, TallyError};
pub use config::{AggregatorPolicy, RateLimitPolicy, RetryPolicy, TallyConfig};
pub use retry::{RetryExecutor, backoff_delay, with_retry};
pub use rate_limit::{RateLimiter, RateWindowSnapshot};
pub use store::{
    CounterStore, InMemoryCounterStore, IncrementFn, increment_fn, increment_fn_from_store,
};
pub use aggregator::{AggregatorStats, FlushReport, IncrementAggregator};
pub use service::{CounterService, DirectWrite};

// ============================================================================
// Quick start
// ============================================================================

/// Builds a [`CounterService`] over `store` with default policies.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use tallyflush::InMemoryCounterStore;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> tallyflush::Result<()> {
/// let store = Arc::new(InMemoryCounterStore::new());
/// store.register("post-1");
///
/// let service = tallyflush::connect(store.clone())?;
/// service.record_view("post-1");
/// service.record_view("post-1");
///
/// let report = service.shutdown().await;
/// assert_eq!(report.delivered, 1);
/// assert_eq!(store.value("post-1"), Some(2));
/// # Ok(())
/// # }
/// ```
pub fn connect<S: CounterStore + 'static>(store: std::sync::Arc<S>) -> Result<CounterService<S>> {
    CounterService::new(store, TallyConfig::default())
}

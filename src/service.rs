//! Call-site facade over one counter store.
//!
//! Hot telemetry (`record_view`) goes through the aggregator. The direct
//! paths (`increment_now`, `read_counter`) hit the store immediately and are
//! admitted by the rate limiter first; when the limiter says no they degrade
//! instead of failing.

use crate::aggregator::{AggregatorStats, FlushReport, IncrementAggregator};
use crate::config::TallyConfig;
use crate::core::Result;
use crate::rate_limit::{GET_CHANGELOG_POSTS, INCREMENT_POST_VIEWS, RateLimiter};
use crate::retry::{RETRY_CATEGORY, RetryExecutor};
use crate::store::CounterStore;
use std::sync::Arc;
use tracing::debug;

/// How a direct write was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectWrite {
    /// Written to the store before returning.
    Applied,
    /// Rate limited; handed to the aggregator instead.
    Deferred,
}

pub struct CounterService<S: CounterStore + 'static> {
    store: Arc<S>,
    limiter: Arc<RateLimiter>,
    retry: RetryExecutor,
    aggregator: IncrementAggregator,
}

impl<S: CounterStore + 'static> CounterService<S> {
    /// Builds the full write path for `store`. Must run inside a tokio runtime.
    pub fn new(store: Arc<S>, config: TallyConfig) -> Result<Self> {
        config.validate()?;
        let limiter = Arc::new(RateLimiter::new(config.rate_limit));
        let retry = RetryExecutor::new(config.retry).with_gate(limiter.clone(), RETRY_CATEGORY);
        let aggregator =
            IncrementAggregator::for_store(config.aggregator, retry.clone(), store.clone())?;

        Ok(Self {
            store,
            limiter,
            retry,
            aggregator,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn aggregator(&self) -> &IncrementAggregator {
        &self.aggregator
    }

    pub fn record_view(&self, entity_id: &str) {
        self.aggregator.queue_increment(entity_id, 1);
    }

    pub fn record(&self, entity_id: &str, delta: i64) {
        self.aggregator.queue_increment(entity_id, delta);
    }

    /// Writes `delta` straight to the store when the limiter admits it,
    /// otherwise queues it for the next batch.
    ///
    /// Errors only when an admitted write fails after retries; nothing is
    /// queued in that case.
    pub async fn increment_now(&self, entity_id: &str, delta: i64) -> Result<DirectWrite> {
        if !self.limiter.can_perform_operation(INCREMENT_POST_VIEWS) {
            debug!(entity_id, delta, "direct write rate limited, deferring");
            self.aggregator.queue_increment(entity_id, delta);
            return Ok(DirectWrite::Deferred);
        }

        let store = &self.store;
        self.retry
            .run(move || store.increment(entity_id, delta))
            .await?;
        Ok(DirectWrite::Applied)
    }

    /// Reads a counter from the store. `Ok(None)` means the read was rate
    /// limited and the caller should fall back to whatever it has cached.
    ///
    /// Increments still waiting in the aggregator are not included.
    pub async fn read_counter(&self, entity_id: &str) -> Result<Option<i64>> {
        if !self.limiter.can_perform_operation(GET_CHANGELOG_POSTS) {
            debug!(entity_id, "direct read rate limited");
            return Ok(None);
        }

        let store = &self.store;
        let value = self.retry.run(move || store.get(entity_id)).await?;
        Ok(Some(value))
    }

    /// Store value plus whatever is still pending locally for `entity_id`.
    pub async fn read_counter_with_pending(&self, entity_id: &str) -> Result<Option<i64>> {
        let pending = self.aggregator.pending_delta(entity_id).unwrap_or(0);
        Ok(self
            .read_counter(entity_id)
            .await?
            .map(|value| value.saturating_add(pending)))
    }

    pub async fn flush(&self) -> FlushReport {
        self.aggregator.flush_pending_operations().await
    }

    pub fn stats(&self) -> AggregatorStats {
        self.aggregator.stats()
    }

    pub async fn shutdown(self) -> FlushReport {
        self.aggregator.shutdown().await
    }
}

//! Write coalescing for counter telemetry.
//!
//! Increments are summed per entity in memory and written out in timed
//! batches. Each flush takes the whole pending set in one step under the
//! state lock, so increments queued while a flush is in flight land in the
//! next generation. Every per-entity write goes through the
//! [`RetryExecutor`]; an entity whose write still fails is merged back into
//! the pending set and tried again on the next cycle.
//!
//! Entity lifecycle across flushes:
//!
//! ```text
//! absent -> pending -> in-flight -> absent            (delivered)
//!                                -> pending           (re-queued)
//!                                -> absent + logged   (dropped, only with max_requeues)
//! ```

use crate::config::AggregatorPolicy;
use crate::core::{Result, TallyError};
use crate::retry::RetryExecutor;
use crate::store::{CounterStore, IncrementFn, increment_fn_from_store};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};
use tracing::{debug, error, warn};

/// Pending total for one entity, bucketed by how many flush cycles each part
/// has already failed in. Bucket `0` holds increments not yet attempted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PendingIncrement {
    buckets: Vec<(u32, i64)>,
}

impl PendingIncrement {
    fn delta(&self) -> i64 {
        self.buckets
            .iter()
            .fold(0i64, |sum, (_, delta)| sum.saturating_add(*delta))
    }

    fn failed_cycles(&self) -> u32 {
        self.buckets
            .iter()
            .map(|(cycles, _)| *cycles)
            .max()
            .unwrap_or(0)
    }

    fn add(&mut self, failed_cycles: u32, delta: i64) {
        match self
            .buckets
            .iter_mut()
            .find(|(cycles, _)| *cycles == failed_cycles)
        {
            Some((_, total)) => *total = total.saturating_add(delta),
            None => self.buckets.push((failed_cycles, delta)),
        }
    }

    fn merge(&mut self, other: PendingIncrement) {
        for (cycles, delta) in other.buckets {
            self.add(cycles, delta);
        }
    }
}

/// Scheduling state: at most one armed timer, identified by a generation id
/// so a timer that lost a cancellation race can tell it is stale.
#[derive(Debug, Default)]
struct BatchCursor {
    timer: Option<(u64, JoinHandle<()>)>,
    next_timer_id: u64,
}

impl BatchCursor {
    fn cancel(&mut self) {
        if let Some((_, handle)) = self.timer.take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Default)]
struct AggregatorState {
    pending: HashMap<String, PendingIncrement>,
    cursor: BatchCursor,
    closed: bool,
}

impl AggregatorState {
    /// Drains the pending set. Entities whose increments cancelled out are
    /// discarded instead of written.
    fn take_batch(&mut self) -> Vec<(String, PendingIncrement)> {
        self.pending
            .drain()
            .filter(|(_, pending)| pending.delta() != 0)
            .collect()
    }
}

#[derive(Debug, Default)]
struct AggregatorCounters {
    flushes: AtomicU64,
    delivered: AtomicU64,
    requeued: AtomicU64,
    dropped: AtomicU64,
    delta_delivered: AtomicI64,
}

/// Outcome of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entities in the snapshot.
    pub entities: usize,
    pub delivered: usize,
    pub requeued: usize,
    pub dropped: usize,
    /// Sum of the deltas that reached the store.
    pub delta_delivered: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregatorStats {
    pub pending_entities: usize,
    pub pending_delta: i64,
    pub timer_armed: bool,
    pub flushes: u64,
    pub delivered: u64,
    pub requeued: u64,
    pub dropped: u64,
    pub delta_delivered: i64,
}

struct Inner {
    policy: AggregatorPolicy,
    retry: RetryExecutor,
    increment_fn: IncrementFn,
    runtime: Handle,
    state: Mutex<AggregatorState>,
    counters: AggregatorCounters,
}

impl Inner {
    // No code path panics while holding the lock mid-update.
    fn lock_state(&self) -> MutexGuard<'_, AggregatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arms the batch timer unless one is already armed or nothing is pending.
    fn arm_timer(self: &Arc<Self>, state: &mut AggregatorState) {
        if state.closed || state.cursor.timer.is_some() || state.pending.is_empty() {
            return;
        }

        let timer_id = state.cursor.next_timer_id;
        state.cursor.next_timer_id += 1;
        let delay = Duration::from_millis(self.policy.batch_delay_ms);
        let inner = self.clone();

        let handle = self.runtime.spawn(async move {
            sleep(delay).await;
            let batch = {
                let mut state = inner.lock_state();
                let armed_id = state.cursor.timer.as_ref().map(|(id, _)| *id);
                if armed_id != Some(timer_id) {
                    return;
                }
                state.cursor.timer = None;
                state.take_batch()
            };
            inner.flush_batch(batch).await;
        });
        state.cursor.timer = Some((timer_id, handle));
    }

    async fn flush_batch(
        self: &Arc<Self>,
        batch: Vec<(String, PendingIncrement)>,
    ) -> FlushReport {
        let mut report = FlushReport {
            entities: batch.len(),
            ..FlushReport::default()
        };
        if batch.is_empty() {
            return report;
        }

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        debug!(entities = batch.len(), "flushing pending increments");

        let chunk_size = self.policy.chunk_size.max(1);
        let inter_chunk_delay = Duration::from_millis(self.policy.inter_chunk_delay_ms);

        for (index, chunk) in batch.chunks(chunk_size).enumerate() {
            if index > 0 && !inter_chunk_delay.is_zero() {
                sleep(inter_chunk_delay).await;
            }

            let results = join_all(chunk.iter().map(move |(entity_id, pending)| {
                let write = self.increment_fn.clone();
                let entity_id = entity_id.clone();
                let delta = pending.delta();
                async move {
                    self.retry
                        .run(move || write(entity_id.clone(), delta))
                        .await
                }
            }))
            .await;

            let mut failed = Vec::new();
            for ((entity_id, pending), result) in chunk.iter().zip(results) {
                match result {
                    Ok(()) => {
                        report.delivered += 1;
                        report.delta_delivered =
                            report.delta_delivered.saturating_add(pending.delta());
                    }
                    Err(err) => {
                        warn!(
                            entity_id = %entity_id,
                            delta = pending.delta(),
                            failed_cycles = pending.failed_cycles() + 1,
                            error = %err,
                            "increment failed after retries"
                        );
                        failed.push((entity_id.clone(), pending.clone()));
                    }
                }
            }
            self.requeue(failed, &mut report);
        }

        self.counters
            .delivered
            .fetch_add(report.delivered as u64, Ordering::Relaxed);
        self.counters
            .delta_delivered
            .fetch_add(report.delta_delivered, Ordering::Relaxed);
        debug!(
            delivered = report.delivered,
            requeued = report.requeued,
            dropped = report.dropped,
            "flush finished"
        );
        report
    }

    /// Merges failed deltas back into the live pending set.
    ///
    /// Each bucket ages by one cycle. With `max_requeues` set, only buckets past
    /// the limit are dropped; increments queued after them keep their own
    /// count. Without it, everything collapses into one bucket.
    ///
    /// Never triggers the size-ceiling flush: a backend outage would otherwise
    /// turn every failed flush into an immediate new one.
    fn requeue(
        self: &Arc<Self>,
        failed: Vec<(String, PendingIncrement)>,
        report: &mut FlushReport,
    ) {
        if failed.is_empty() {
            return;
        }

        let mut state = self.lock_state();
        for (entity_id, pending) in failed {
            let mut kept = PendingIncrement::default();
            let mut dropped: Option<(u32, i64)> = None;
            match self.policy.max_requeues {
                Some(max_requeues) => {
                    for (cycles, delta) in pending.buckets {
                        let cycles = cycles.saturating_add(1);
                        if cycles > max_requeues {
                            let (_, lost) = dropped.get_or_insert((cycles, 0));
                            *lost = lost.saturating_add(delta);
                        } else {
                            kept.add(cycles, delta);
                        }
                    }
                }
                None => kept.add(pending.failed_cycles().saturating_add(1), pending.delta()),
            }

            if let Some((failed_cycles, delta)) = dropped {
                error!(
                    entity_id = %entity_id,
                    delta,
                    failed_cycles,
                    "dropping increment after exhausting requeues"
                );
                report.dropped += 1;
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
            if kept.buckets.is_empty() {
                continue;
            }

            state.pending.entry(entity_id).or_default().merge(kept);
            report.requeued += 1;
            self.counters.requeued.fetch_add(1, Ordering::Relaxed);
        }
        self.arm_timer(&mut state);
    }
}

/// Coalesces `queue_increment` calls into batched, retried writes.
///
/// Must be created inside a tokio runtime; timers and triggered flushes are
/// spawned onto that runtime.
pub struct IncrementAggregator {
    inner: Arc<Inner>,
}

impl IncrementAggregator {
    pub fn new(
        policy: AggregatorPolicy,
        retry: RetryExecutor,
        increment_fn: IncrementFn,
    ) -> Result<Self> {
        policy.validate()?;
        let runtime =
            Handle::try_current().map_err(|err| TallyError::NoRuntime(err.to_string()))?;

        Ok(Self {
            inner: Arc::new(Inner {
                policy,
                retry,
                increment_fn,
                runtime,
                state: Mutex::new(AggregatorState::default()),
                counters: AggregatorCounters::default(),
            }),
        })
    }

    /// Aggregator writing to `store.increment`.
    pub fn for_store<S>(
        policy: AggregatorPolicy,
        retry: RetryExecutor,
        store: Arc<S>,
    ) -> Result<Self>
    where
        S: CounterStore + 'static,
    {
        Self::new(policy, retry, increment_fn_from_store(store))
    }

    pub fn policy(&self) -> &AggregatorPolicy {
        &self.inner.policy
    }

    /// Adds `delta` to the pending total of `entity_id`. Never blocks on the
    /// backend and never fails; a zero delta is ignored.
    pub fn queue_increment(&self, entity_id: &str, delta: i64) {
        if delta == 0 {
            return;
        }

        let mut state = self.inner.lock_state();
        state
            .pending
            .entry(entity_id.to_string())
            .or_default()
            .add(0, delta);

        if state.pending.len() >= self.inner.policy.max_batch_size {
            state.cursor.cancel();
            let batch = state.take_batch();
            drop(state);

            debug!(entities = batch.len(), "batch size ceiling reached");
            let inner = self.inner.clone();
            self.inner.runtime.spawn(async move {
                inner.flush_batch(batch).await;
            });
        } else {
            self.inner.arm_timer(&mut state);
        }
    }

    /// Flushes everything pending right now, cancelling the armed timer.
    ///
    /// Resolves once every entity in the snapshot has been delivered or
    /// re-queued.
    pub async fn flush_pending_operations(&self) -> FlushReport {
        let batch = {
            let mut state = self.inner.lock_state();
            state.cursor.cancel();
            state.take_batch()
        };
        self.inner.flush_batch(batch).await
    }

    /// Pending totals sorted by entity id.
    pub fn pending(&self) -> Vec<(String, i64)> {
        let state = self.inner.lock_state();
        let mut pending: Vec<(String, i64)> = state
            .pending
            .iter()
            .map(|(id, pending)| (id.clone(), pending.delta()))
            .collect();
        pending.sort();
        pending
    }

    pub fn pending_delta(&self, entity_id: &str) -> Option<i64> {
        self.inner
            .lock_state()
            .pending
            .get(entity_id)
            .map(|pending| pending.delta())
    }

    pub fn stats(&self) -> AggregatorStats {
        let (pending_entities, pending_delta, timer_armed) = {
            let state = self.inner.lock_state();
            (
                state.pending.len(),
                state
                    .pending
                    .values()
                    .fold(0i64, |sum, pending| sum.saturating_add(pending.delta())),
                state.cursor.timer.is_some(),
            )
        };
        let counters = &self.inner.counters;
        AggregatorStats {
            pending_entities,
            pending_delta,
            timer_armed,
            flushes: counters.flushes.load(Ordering::Relaxed),
            delivered: counters.delivered.load(Ordering::Relaxed),
            requeued: counters.requeued.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            delta_delivered: counters.delta_delivered.load(Ordering::Relaxed),
        }
    }

    /// Final flush for graceful shutdown. Whatever is still pending afterwards
    /// is lost with the aggregator.
    pub async fn shutdown(self) -> FlushReport {
        let report = self.flush_pending_operations().await;
        if report.requeued > 0 {
            warn!(
                requeued = report.requeued,
                "shutting down with undelivered increments"
            );
        }
        report
    }
}

impl Drop for IncrementAggregator {
    fn drop(&mut self) {
        let mut state = self.inner.lock_state();
        state.closed = true;
        state.cursor.cancel();
        if !state.pending.is_empty() {
            warn!(
                pending_entities = state.pending.len(),
                "aggregator dropped with pending increments"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::core::StoreError;
    use crate::store::increment_fn;

    fn default_aggregator(write: IncrementFn) -> Result<IncrementAggregator> {
        IncrementAggregator::new(AggregatorPolicy::default(), RetryExecutor::default(), write)
    }

    fn noop_fn() -> IncrementFn {
        increment_fn(|_, _| async { Ok::<(), StoreError>(()) })
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_arms_single_timer() {
        let aggregator = default_aggregator(noop_fn()).unwrap();
        assert!(!aggregator.stats().timer_armed);

        aggregator.queue_increment("post-1", 1);
        aggregator.queue_increment("post-2", 1);
        let stats = aggregator.stats();
        assert!(stats.timer_armed);
        assert_eq!(stats.pending_entities, 2);
        assert_eq!(aggregator.inner.lock_state().cursor.next_timer_id, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_delta_is_ignored() {
        let aggregator = default_aggregator(noop_fn()).unwrap();
        aggregator.queue_increment("post-1", 0);
        assert!(aggregator.pending().is_empty());
        assert!(!aggregator.stats().timer_armed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_increments_keep_their_own_bucket() {
        let aggregator = IncrementAggregator::new(
            AggregatorPolicy::default(),
            RetryExecutor::new(RetryPolicy::default().max_retries(0)),
            increment_fn(|id, _| async move { Err::<(), _>(StoreError::Unavailable(id)) }),
        )
        .unwrap();

        aggregator.queue_increment("post-1", 2);
        aggregator.flush_pending_operations().await;
        aggregator.queue_increment("post-1", 1);

        let state = aggregator.inner.lock_state();
        let pending = state.pending.get("post-1").unwrap();
        assert_eq!(pending.buckets, vec![(1, 2), (0, 1)]);
        assert_eq!(pending.delta(), 3);
        assert_eq!(pending.failed_cycles(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_requeues_collapse_into_one_bucket() {
        let aggregator = IncrementAggregator::new(
            AggregatorPolicy::default(),
            RetryExecutor::new(RetryPolicy::default().max_retries(0)),
            increment_fn(|id, _| async move { Err::<(), _>(StoreError::Unavailable(id)) }),
        )
        .unwrap();

        aggregator.queue_increment("post-1", 2);
        aggregator.flush_pending_operations().await;
        aggregator.queue_increment("post-1", 1);
        aggregator.flush_pending_operations().await;

        let state = aggregator.inner.lock_state();
        assert_eq!(state.pending.get("post-1").unwrap().buckets, vec![(2, 3)]);
    }

    #[test]
    fn test_take_batch_skips_cancelled_out_entities() {
        let mut state = AggregatorState::default();
        state.pending.entry("post-1".to_string()).or_default().add(0, 1);
        state.pending.entry("post-1".to_string()).or_default().add(0, -1);
        state.pending.entry("post-2".to_string()).or_default().add(0, 4);

        let batch = state.take_batch();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].0, "post-2");
        assert!(state.pending.is_empty());
    }

    #[test]
    fn test_new_requires_runtime() {
        let result = default_aggregator(noop_fn());
        assert!(matches!(result, Err(TallyError::NoRuntime(_))));
    }
}

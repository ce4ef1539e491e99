//! Bounded exponential-backoff retry for async operations.

use crate::config::RetryPolicy;
use crate::core::Retryable;
use crate::rate_limit::RateLimiter;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use tokio::time::{Duration, sleep};
use tracing::{debug, warn};

/// Category the retry gate books retries under unless told otherwise.
pub const RETRY_CATEGORY: &str = "retry";

/// Delay before retry number `attempt + 1`: `min(base * multiplier^attempt, max)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = u64::from(policy.backoff_multiplier).saturating_pow(attempt);
    let ms = policy
        .base_delay_ms
        .saturating_mul(factor)
        .min(policy.max_delay_ms);
    Duration::from_millis(ms)
}

/// Runs `operation` under `policy` without a retry gate.
pub async fn with_retry<F, Fut, T, E>(operation: F, policy: &RetryPolicy) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    run_with_gate(operation, policy, None).await
}

#[derive(Clone)]
struct RetryGate {
    limiter: Arc<RateLimiter>,
    category: String,
}

/// Retry loop bound to one policy and, optionally, a limiter that must admit
/// every retry.
#[derive(Clone)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    gate: Option<RetryGate>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, gate: None }
    }

    /// Retries are only attempted while `limiter` admits `category`.
    ///
    /// The first attempt is never gated.
    pub fn with_gate(mut self, limiter: Arc<RateLimiter>, category: &str) -> Self {
        self.gate = Some(RetryGate {
            limiter,
            category: category.to_string(),
        });
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails fatally, exhausts the retry
    /// budget, or the gate refuses a retry. The error returned is the one
    /// produced by the last attempt.
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + Display,
    {
        run_with_gate(operation, &self.policy, self.gate.as_ref()).await
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

async fn run_with_gate<F, Fut, T, E>(
    mut operation: F,
    policy: &RetryPolicy,
    gate: Option<&RetryGate>,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + Display,
{
    let mut attempt = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        let retryable = err.is_retryable();
        warn!(
            attempt,
            max_retries = policy.max_retries,
            retryable,
            error = %err,
            "operation attempt failed"
        );

        if !retryable || attempt >= policy.max_retries {
            return Err(err);
        }

        if let Some(gate) = gate {
            if !gate.limiter.can_perform_operation(&gate.category) {
                debug!(
                    attempt,
                    category = %gate.category,
                    "retry gate closed, giving up"
                );
                return Err(err);
            }
        }

        let delay = backoff_delay(policy, attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            "backing off before retry"
        );
        sleep(delay).await;
        attempt += 1;
    }
}

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tallyflush::{
    RateLimitPolicy, RateLimiter, RetryExecutor, RetryPolicy, StoreError, with_retry,
};
use tokio::time::{Duration, Instant};
use tokio_test::{assert_err, assert_ok};

fn counting_op<F>(
    calls: &AtomicU32,
    fail_with: F,
) -> impl FnMut() -> std::future::Ready<Result<u32, StoreError>>
where
    F: Fn(u32) -> Option<StoreError>,
{
    move || {
        let attempt = calls.fetch_add(1, Ordering::SeqCst);
        std::future::ready(match fail_with(attempt) {
            Some(err) => Err(err),
            None => Ok(attempt),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn test_fatal_error_invokes_operation_once() {
    let calls = AtomicU32::new(0);
    let result = with_retry(
        counting_op(&calls, |_| Some(StoreError::PermissionDenied("rules".into()))),
        &RetryPolicy::default(),
    )
    .await;

    assert_eq!(result, Err(StoreError::PermissionDenied("rules".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retryable_error_exhausts_budget_and_returns_last_error() {
    let calls = AtomicU32::new(0);
    let result = with_retry(
        counting_op(&calls, |attempt| {
            Some(StoreError::RateLimited(format!("attempt {}", attempt)))
        }),
        &RetryPolicy::default().max_retries(3),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(result, Err(StoreError::RateLimited("attempt 3".into())));
}

#[tokio::test(start_paused = true)]
async fn test_success_returns_immediately() {
    let calls = AtomicU32::new(0);
    let start = Instant::now();
    let value =
        assert_ok!(with_retry(counting_op(&calls, |_| None), &RetryPolicy::default()).await);

    assert_eq!(value, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(start.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_after_transient_stops_retrying() {
    let calls = AtomicU32::new(0);
    let result = with_retry(
        counting_op(&calls, |attempt| match attempt {
            0 => Some(StoreError::DeadlineExceeded("slow".into())),
            _ => Some(StoreError::NotFound("post-9".into())),
        }),
        &RetryPolicy::default(),
    )
    .await;

    assert_err!(result.clone());
    assert_eq!(result, Err(StoreError::NotFound("post-9".into())));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn test_zero_retries_means_single_attempt() {
    let calls = AtomicU32::new(0);
    let executor = RetryExecutor::new(RetryPolicy::default().max_retries(0));
    let result = executor
        .run(counting_op(&calls, |_| Some(StoreError::Internal("500".into()))))
        .await;

    assert_err!(result);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_gate_budget_is_shared_across_calls() {
    let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::default().ceiling_per_window(3)));
    let executor = RetryExecutor::new(RetryPolicy::default().base_delay(Duration::from_millis(1)))
        .with_gate(limiter.clone(), "retry");

    let first = AtomicU32::new(0);
    let _ = executor
        .run(counting_op(&first, |_| Some(StoreError::Unavailable("down".into()))))
        .await;
    assert_eq!(first.load(Ordering::SeqCst), 4);

    // the first call used up all three admitted retries
    let second = AtomicU32::new(0);
    let _ = executor
        .run(counting_op(&second, |_| Some(StoreError::Unavailable("down".into()))))
        .await;
    assert_eq!(second.load(Ordering::SeqCst), 1);
}

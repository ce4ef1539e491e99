use tallyflush::rate_limit::{GET_CHANGELOG_POSTS, INCREMENT_POST_VIEWS};
use tallyflush::{RateLimitPolicy, RateLimiter};
use tokio::time::{Duration, sleep};

#[tokio::test(start_paused = true)]
async fn test_default_ceiling_then_reset_after_window() {
    let limiter = RateLimiter::default();

    for call in 0..50 {
        assert!(
            limiter.can_perform_operation(GET_CHANGELOG_POSTS),
            "call {} should be admitted",
            call
        );
    }
    assert!(!limiter.can_perform_operation(GET_CHANGELOG_POSTS));

    sleep(Duration::from_secs(59)).await;
    assert!(!limiter.can_perform_operation(GET_CHANGELOG_POSTS));

    sleep(Duration::from_secs(1)).await;
    assert!(limiter.can_perform_operation(GET_CHANGELOG_POSTS));
    assert_eq!(limiter.window(GET_CHANGELOG_POSTS).unwrap().count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_burst_on_one_category_does_not_throttle_another() {
    let limiter = RateLimiter::new(RateLimitPolicy::default().ceiling_per_window(5));
    while limiter.can_perform_operation(INCREMENT_POST_VIEWS) {}

    assert!(limiter.can_perform_operation(GET_CHANGELOG_POSTS));
    assert_eq!(limiter.window(INCREMENT_POST_VIEWS).unwrap().remaining, 0);
    assert_eq!(limiter.window(GET_CHANGELOG_POSTS).unwrap().remaining, 4);
}

#[tokio::test(start_paused = true)]
async fn test_check_then_record_through_separate_path() {
    let limiter = RateLimiter::new(
        RateLimitPolicy::default()
            .ceiling_per_window(2)
            .window_size(Duration::from_secs(10)),
    );

    assert!(limiter.window("export").is_none());
    limiter.record_operation("export");
    assert!(limiter.can_perform_operation("export"));
    assert!(!limiter.can_perform_operation("export"));

    sleep(Duration::from_secs(10)).await;
    limiter.record_operation("export");
    let window = limiter.window("export").unwrap();
    assert_eq!(window.count, 1);
    assert_eq!(window.remaining, 1);
}

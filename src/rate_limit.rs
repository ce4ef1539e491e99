//! Fixed-window admission control per operation category.
//!
//! Each category (`"getChangelogPosts"`, `"incrementPostViews"`, ...) owns an
//! independent window. A window admits up to its ceiling within
//! `[window_start, reset_at)` and starts over the first time it is consulted
//! at or after `reset_at`. The limiter is advisory: a `false` answer means the
//! caller should degrade (serve cached data, defer the write), not fail.

use crate::config::RateLimitPolicy;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::time::{Duration, Instant};
use tracing::debug;

/// Category used by the direct counter read path.
pub const GET_CHANGELOG_POSTS: &str = "getChangelogPosts";
/// Category used by the direct counter write path.
pub const INCREMENT_POST_VIEWS: &str = "incrementPostViews";

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    count: u32,
    reset_at: Instant,
}

/// Point-in-time view of one category window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateWindowSnapshot {
    pub count: u32,
    pub ceiling: u32,
    pub remaining: u32,
    pub reset_at: Instant,
}

#[derive(Debug)]
pub struct RateLimiter {
    policy: RateLimitPolicy,
    windows: Mutex<HashMap<String, RateWindow>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Asks whether one more `category` operation may run now, reserving a
    /// slot in the current window when it may.
    pub fn can_perform_operation(&self, category: &str) -> bool {
        self.can_perform_operation_at(category, Instant::now())
    }

    pub fn can_perform_operation_at(&self, category: &str, now: Instant) -> bool {
        let ceiling = self.policy.ceiling_for(category);
        let window_size = self.window_size();
        let mut windows = self.lock_windows();

        match windows.get_mut(category) {
            Some(window) if now < window.reset_at => {
                if window.count < ceiling {
                    window.count += 1;
                    true
                } else {
                    debug!(category, ceiling, "rate limit window exhausted");
                    false
                }
            }
            // A zero ceiling refuses everything, never opening a window.
            _ if ceiling == 0 => {
                debug!(category, "rate limit ceiling is zero");
                false
            }
            _ => {
                windows.insert(
                    category.to_string(),
                    RateWindow {
                        count: 1,
                        reset_at: now + window_size,
                    },
                );
                true
            }
        }
    }

    /// Books an operation that was performed without asking first.
    ///
    /// The count may exceed the ceiling here; `can_perform_operation` keeps
    /// answering `false` until the window rolls over.
    pub fn record_operation(&self, category: &str) {
        self.record_operation_at(category, Instant::now());
    }

    pub fn record_operation_at(&self, category: &str, now: Instant) {
        let window_size = self.window_size();
        let mut windows = self.lock_windows();

        match windows.get_mut(category) {
            Some(window) if now < window.reset_at => {
                window.count = window.count.saturating_add(1);
            }
            _ => {
                windows.insert(
                    category.to_string(),
                    RateWindow {
                        count: 1,
                        reset_at: now + window_size,
                    },
                );
            }
        }
    }

    /// Current window for `category`, or `None` when it has never been used.
    pub fn window(&self, category: &str) -> Option<RateWindowSnapshot> {
        let ceiling = self.policy.ceiling_for(category);
        let windows = self.lock_windows();
        windows.get(category).map(|window| RateWindowSnapshot {
            count: window.count,
            ceiling,
            remaining: ceiling.saturating_sub(window.count),
            reset_at: window.reset_at,
        })
    }

    /// Forgets all windows.
    pub fn reset(&self) {
        self.lock_windows().clear();
    }

    fn window_size(&self) -> Duration {
        Duration::from_millis(self.policy.window_size_ms)
    }

    // Window bookkeeping never panics mid-update, so a poisoned map is still consistent.
    fn lock_windows(&self) -> MutexGuard<'_, HashMap<String, RateWindow>> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(ceiling: u32) -> RateLimiter {
        RateLimiter::new(
            RateLimitPolicy::default()
                .ceiling_per_window(ceiling)
                .window_size(Duration::from_secs(60)),
        )
    }

    #[test]
    fn test_admits_up_to_ceiling_then_rejects() {
        let limiter = limiter(3);
        let now = Instant::now();

        assert!(limiter.can_perform_operation_at("reads", now));
        assert!(limiter.can_perform_operation_at("reads", now));
        assert!(limiter.can_perform_operation_at("reads", now));
        assert!(!limiter.can_perform_operation_at("reads", now));

        let window = limiter.window("reads").unwrap();
        assert_eq!(window.count, 3);
        assert_eq!(window.remaining, 0);
    }

    #[test]
    fn test_rejection_does_not_mutate_window() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.can_perform_operation_at("reads", now));
        let before = limiter.window("reads").unwrap();

        assert!(!limiter.can_perform_operation_at("reads", now + Duration::from_secs(1)));
        assert_eq!(limiter.window("reads").unwrap(), before);
    }

    #[test]
    fn test_window_rolls_over_at_reset_at() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.can_perform_operation_at("reads", now));
        assert!(!limiter.can_perform_operation_at("reads", now + Duration::from_millis(59_999)));

        let reset_at = now + Duration::from_secs(60);
        assert!(limiter.can_perform_operation_at("reads", reset_at));
        let window = limiter.window("reads").unwrap();
        assert_eq!(window.count, 1);
        assert_eq!(window.reset_at, reset_at + Duration::from_secs(60));
    }

    #[test]
    fn test_categories_are_independent() {
        let limiter = limiter(1);
        let now = Instant::now();
        assert!(limiter.can_perform_operation_at(GET_CHANGELOG_POSTS, now));
        assert!(!limiter.can_perform_operation_at(GET_CHANGELOG_POSTS, now));
        assert!(limiter.can_perform_operation_at(INCREMENT_POST_VIEWS, now));
    }

    #[test]
    fn test_category_ceiling_override() {
        let limiter = RateLimiter::new(
            RateLimitPolicy::default()
                .ceiling_per_window(1)
                .category_ceiling("bulk", 2),
        );
        let now = Instant::now();
        assert!(limiter.can_perform_operation_at("bulk", now));
        assert!(limiter.can_perform_operation_at("bulk", now));
        assert!(!limiter.can_perform_operation_at("bulk", now));
        assert_eq!(limiter.window("bulk").unwrap().ceiling, 2);
    }

    #[test]
    fn test_zero_category_ceiling_always_refuses() {
        let limiter = RateLimiter::new(RateLimitPolicy::default().category_ceiling("off", 0));
        let now = Instant::now();
        assert!(!limiter.can_perform_operation_at("off", now));
        assert!(!limiter.can_perform_operation_at("off", now + Duration::from_secs(120)));
        assert!(limiter.window("off").is_none());
        assert!(limiter.can_perform_operation_at("reads", now));
    }

    #[test]
    fn test_record_operation_consumes_budget() {
        let limiter = limiter(2);
        let now = Instant::now();
        limiter.record_operation_at("writes", now);
        limiter.record_operation_at("writes", now);
        limiter.record_operation_at("writes", now);

        assert_eq!(limiter.window("writes").unwrap().count, 3);
        assert!(!limiter.can_perform_operation_at("writes", now));
    }

    #[test]
    fn test_reset_forgets_windows() {
        let limiter = limiter(1);
        assert!(limiter.can_perform_operation("reads"));
        limiter.reset();
        assert!(limiter.window("reads").is_none());
        assert!(limiter.can_perform_operation("reads"));
    }
}

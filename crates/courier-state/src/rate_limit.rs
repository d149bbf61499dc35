//! Sliding-window rate limiting keyed by (identity, event).

use std::collections::VecDeque;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// Sliding-window counter.
///
/// Each (identity, event) key keeps the timestamps of accepted calls inside
/// the window. A check drops expired timestamps from the front, rejects when
/// `max_requests` remain, otherwise records `now`. Work per check is bounded
/// by the number of calls inside one window.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: DashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Allow `max_requests` calls per `window` for each key.
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: DashMap::new(),
        }
    }

    /// Record a call and report whether it is allowed.
    pub fn check(&self, identity: &str, event: &str) -> bool {
        let now = Instant::now();
        let mut window = self
            .windows
            .entry(format!("{identity}:{event}"))
            .or_default();

        while let Some(&oldest) = window.front() {
            if now.duration_since(oldest) >= self.window {
                let _ = window.pop_front();
            } else {
                break;
            }
        }

        if window.len() >= self.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Drop keys whose newest call is older than the window. Returns how many
    /// keys were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window
                .back()
                .is_some_and(|newest| now.duration_since(*newest) < self.window)
        });
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }

    /// Calls allowed per window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Window length.
    pub fn window(&self) -> Duration {
        self.window
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn allows_max_then_rejects() {
        let limiter = RateLimiter::new(3, Duration::from_secs(60));
        assert!(limiter.check("alice", "typing"));
        assert!(limiter.check("alice", "typing"));
        assert!(limiter.check("alice", "typing"));
        assert!(!limiter.check("alice", "typing"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_elapsing_readmits() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(limiter.check("alice", "typing"));
        assert!(limiter.check("alice", "typing"));
        assert!(!limiter.check("alice", "typing"));

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limiter.check("alice", "typing"));
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides_rather_than_resets() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        assert!(limiter.check("a", "e"));
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(limiter.check("a", "e"));
        tokio::time::advance(Duration::from_secs(5)).await;
        // first call expired, second still inside the window
        assert!(limiter.check("a", "e"));
        assert!(!limiter.check("a", "e"));
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_calls_do_not_extend_the_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10));
        assert!(limiter.check("a", "e"));
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(2)).await;
            assert!(!limiter.check("a", "e"));
        }
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(limiter.check("a", "e"));
    }

    #[tokio::test(start_paused = true)]
    async fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(limiter.check("alice", "typing"));
        assert!(!limiter.check("alice", "typing"));
        assert!(limiter.check("bob", "typing"));
        assert!(limiter.check("alice", "send-message"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_drops_idle_keys() {
        let limiter = RateLimiter::new(5, Duration::from_secs(10));
        assert!(limiter.check("alice", "typing"));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(limiter.check("bob", "typing"));
        tokio::time::advance(Duration::from_secs(6)).await;

        assert_eq!(limiter.sweep(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_checks_never_exceed_max() {
        let limiter = Arc::new(RateLimiter::new(10, Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move { limiter.check("alice", "typing") }));
        }
        let mut allowed = 0;
        for handle in handles {
            if handle.await.unwrap() {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 10);
    }
}

//! Per-event rate limiters.

use std::time::Duration;

use courier_settings::{RateLimitRule, RateLimitSettings};
use courier_state::RateLimiter;

use crate::protocol::EventKind;

fn limiter(rule: RateLimitRule) -> RateLimiter {
    RateLimiter::new(rule.max_requests, Duration::from_millis(rule.window_ms))
}

/// Maps event kinds to their sliding-window limiter.
#[derive(Debug)]
pub struct EventLimiters {
    send_message: RateLimiter,
    typing: RateLimiter,
    default: RateLimiter,
}

impl EventLimiters {
    /// Build limiters from settings.
    pub fn new(settings: &RateLimitSettings) -> Self {
        Self {
            send_message: limiter(settings.send_message),
            typing: limiter(settings.typing),
            default: limiter(settings.default),
        }
    }

    /// Limiter applied to `kind`.
    pub fn for_kind(&self, kind: EventKind) -> &RateLimiter {
        match kind {
            EventKind::SendMessage => &self.send_message,
            EventKind::Typing => &self.typing,
            _ => &self.default,
        }
    }

    /// Record a call by `identity` and report whether it is allowed.
    pub fn check(&self, identity: &str, kind: EventKind) -> bool {
        self.for_kind(kind).check(identity, kind.as_str())
    }

    /// Drop idle windows across all limiters.
    pub fn sweep(&self) -> usize {
        self.send_message.sweep() + self.typing.sweep() + self.default.sweep()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight() -> EventLimiters {
        EventLimiters::new(&RateLimitSettings {
            send_message: RateLimitRule::per_minute(2),
            typing: RateLimitRule::per_minute(1),
            default: RateLimitRule::per_minute(3),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn typing_has_its_own_budget() {
        let limits = tight();
        assert!(limits.check("alice", EventKind::Typing));
        assert!(!limits.check("alice", EventKind::Typing));
        assert!(limits.check("alice", EventKind::SendMessage));
        assert!(limits.check("bob", EventKind::Typing));
    }

    #[tokio::test(start_paused = true)]
    async fn default_budget_is_per_event() {
        let limits = tight();
        for _ in 0..3 {
            assert!(limits.check("alice", EventKind::Heartbeat));
        }
        assert!(!limits.check("alice", EventKind::Heartbeat));
        assert!(limits.check("alice", EventKind::Lock));
    }

    #[tokio::test(start_paused = true)]
    async fn window_reopens_and_sweeps() {
        let limits = tight();
        assert!(limits.check("alice", EventKind::Typing));
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(limits.check("alice", EventKind::Typing));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limits.sweep(), 1);
    }
}

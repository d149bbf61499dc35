//! Routing bounds, lock, heartbeat and rate-limit settings.

use serde::{Deserialize, Serialize};

/// Message routing bounds and collaborator timeouts.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeliverySettings {
    /// Longest accepted message body, in characters.
    pub max_content_chars: usize,
    /// Cap on `get-missed-messages` results.
    pub missed_messages_limit: usize,
    /// `sync-messages` page size when the client sends none.
    pub sync_default_limit: usize,
    /// Largest `sync-messages` page a client may request.
    pub sync_max_limit: usize,
    /// Whole-queue retention for offline messages, in seconds.
    pub queue_retention_secs: u64,
    /// Quiet period after the last `typing` before `typing-stopped` fires.
    pub typing_quiet_ms: u64,
    /// Bound on every collaborator and backing-store call.
    pub store_timeout_ms: u64,
    /// Bound on a whole event handler.
    pub handler_timeout_ms: u64,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_content_chars: 5000,
            missed_messages_limit: 500,
            sync_default_limit: 100,
            sync_max_limit: 500,
            queue_retention_secs: 7 * 24 * 60 * 60,
            typing_quiet_ms: 3000,
            store_timeout_ms: 5000,
            handler_timeout_ms: 30_000,
        }
    }
}

/// Cooperative edit locks.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    /// Lifetime of an edit lock.
    pub ttl_ms: u64,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self { ttl_ms: 300_000 }
    }
}

/// Heartbeat bookkeeping and the periodic maintenance sweep.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeartbeatSettings {
    /// Samples older than this are dropped by the sweep.
    pub inactivity_ms: u64,
    /// How often the sweep runs.
    pub sweep_interval_ms: u64,
    /// Per-identity latency aggregates with no live sample are forgotten
    /// once their last heartbeat is older than this.
    pub metrics_retention_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            inactivity_ms: 120_000,
            sweep_interval_ms: 60_000,
            metrics_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// One sliding-window rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Calls allowed inside one window.
    pub max_requests: usize,
    /// Window length.
    pub window_ms: u64,
}

impl RateLimitRule {
    /// A rule allowing `max_requests` per minute.
    pub const fn per_minute(max_requests: usize) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }
}

/// Per-event sliding-window limits.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimitSettings {
    /// `send-message`.
    pub send_message: RateLimitRule,
    /// `typing`.
    pub typing: RateLimitRule,
    /// Every other event.
    pub default: RateLimitRule,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            send_message: RateLimitRule::per_minute(50),
            typing: RateLimitRule::per_minute(30),
            default: RateLimitRule::per_minute(100),
        }
    }
}

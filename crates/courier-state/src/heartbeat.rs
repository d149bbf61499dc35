//! Per-connection liveness samples and per-identity latency aggregates.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Running latency aggregate for one identity.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyMetrics {
    /// Heartbeats folded in so far.
    pub total_heartbeats: u64,
    /// Running mean latency in milliseconds.
    pub avg_latency: f64,
    /// Lowest observed latency.
    pub min_latency: i64,
    /// Highest observed latency.
    pub max_latency: i64,
    /// Wall-clock time of the latest heartbeat.
    pub last_seen: DateTime<Utc>,
}

impl LatencyMetrics {
    fn first(latency_ms: i64, at: DateTime<Utc>) -> Self {
        Self {
            total_heartbeats: 1,
            avg_latency: latency_ms as f64,
            min_latency: latency_ms,
            max_latency: latency_ms,
            last_seen: at,
        }
    }

    fn fold(&mut self, latency_ms: i64, at: DateTime<Utc>) {
        self.total_heartbeats += 1;
        self.avg_latency += (latency_ms as f64 - self.avg_latency) / self.total_heartbeats as f64;
        self.min_latency = self.min_latency.min(latency_ms);
        self.max_latency = self.max_latency.max(latency_ms);
        self.last_seen = at;
    }
}

/// Aggregate over every identity with recorded heartbeats.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    /// Identities with metrics.
    pub total_identities: usize,
    /// Live per-connection samples.
    pub tracked_connections: usize,
    /// Mean of the per-identity averages.
    pub avg_latency: f64,
    /// Lowest latency seen by anyone.
    pub min_latency: i64,
    /// Highest latency seen by anyone.
    pub max_latency: i64,
}

#[derive(Debug)]
struct Sample {
    identity: String,
    last_seen: Instant,
    latency_ms: i64,
}

#[derive(Debug)]
struct Aggregate {
    metrics: LatencyMetrics,
    touched: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    samples: HashMap<String, Sample>,
    metrics: HashMap<String, Aggregate>,
}

/// Tracks heartbeats per connection and folds latency per identity.
#[derive(Debug, Default)]
pub struct HeartbeatManager {
    inner: Mutex<Inner>,
}

impl HeartbeatManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a heartbeat from `connection` owned by `identity`.
    ///
    /// Negative latencies (client clock ahead of the server) are clamped to 0.
    pub fn record_heartbeat(&self, connection: &str, identity: &str, latency_ms: i64) -> LatencyMetrics {
        let latency_ms = latency_ms.max(0);
        let now = Instant::now();
        let wall = Utc::now();
        let mut inner = self.inner.lock();

        let _ = inner.samples.insert(
            connection.to_owned(),
            Sample {
                identity: identity.to_owned(),
                last_seen: now,
                latency_ms,
            },
        );

        let aggregate = inner
            .metrics
            .entry(identity.to_owned())
            .and_modify(|a| {
                a.metrics.fold(latency_ms, wall);
                a.touched = now;
            })
            .or_insert_with(|| Aggregate {
                metrics: LatencyMetrics::first(latency_ms, wall),
                touched: now,
            });
        aggregate.metrics.clone()
    }

    /// Aggregate for `identity`, if it ever sent a heartbeat.
    pub fn get_metrics(&self, identity: &str) -> Option<LatencyMetrics> {
        self.inner.lock().metrics.get(identity).map(|a| a.metrics.clone())
    }

    /// Last latency sample of a connection.
    pub fn last_latency(&self, connection: &str) -> Option<i64> {
        self.inner.lock().samples.get(connection).map(|s| s.latency_ms)
    }

    /// Forget a connection's sample (called on disconnect).
    pub fn remove(&self, connection: &str) -> bool {
        self.inner.lock().samples.remove(connection).is_some()
    }

    /// Drop samples not refreshed within `threshold`. Returns how many were dropped.
    pub fn cleanup(&self, threshold: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.samples.len();
        inner
            .samples
            .retain(|_, s| now.duration_since(s.last_seen) < threshold);
        before - inner.samples.len()
    }

    /// Forget aggregates of identities with no live sample whose last
    /// heartbeat is older than `retention`. Returns how many were dropped.
    pub fn prune_metrics(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let Inner { samples, metrics } = &mut *inner;
        let before = metrics.len();
        metrics.retain(|identity, a| {
            now.duration_since(a.touched) < retention
                || samples.values().any(|s| s.identity == *identity)
        });
        before - metrics.len()
    }

    /// Aggregate across all identities.
    pub fn global_stats(&self) -> GlobalStats {
        let inner = self.inner.lock();
        let total = inner.metrics.len();
        if total == 0 {
            return GlobalStats {
                tracked_connections: inner.samples.len(),
                ..GlobalStats::default()
            };
        }
        let sum: f64 = inner.metrics.values().map(|a| a.metrics.avg_latency).sum();
        GlobalStats {
            total_identities: total,
            tracked_connections: inner.samples.len(),
            avg_latency: sum / total as f64,
            min_latency: inner.metrics.values().map(|a| a.metrics.min_latency).min().unwrap_or(0),
            max_latency: inner.metrics.values().map(|a| a.metrics.max_latency).max().unwrap_or(0),
        }
    }
}

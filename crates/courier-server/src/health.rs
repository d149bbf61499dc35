//! `/health` endpoint.

use std::time::Instant;

use courier_state::GlobalStats;
use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live WebSocket connections on this node.
    pub connections: usize,
    /// Identities reachable anywhere in the cluster.
    pub online_identities: usize,
    /// This node's identifier.
    pub node_id: String,
    /// `"local"` or `"redis"`.
    pub presence_backend: &'static str,
    /// Whether presence is currently served from the local fallback.
    pub degraded: bool,
    /// Heartbeat latency aggregates.
    pub latency: GlobalStats,
}

/// Live counters sampled for a health response.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// Live connections.
    pub connections: usize,
    /// Reachable identities.
    pub online_identities: usize,
    /// Node identifier.
    pub node_id: String,
    /// Presence strategy name.
    pub presence_backend: &'static str,
    /// Presence fallback flag.
    pub degraded: bool,
    /// Latency aggregates.
    pub latency: GlobalStats,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, snapshot: HealthSnapshot) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections: snapshot.connections,
        online_identities: snapshot.online_identities,
        node_id: snapshot.node_id,
        presence_backend: snapshot.presence_backend,
        degraded: snapshot.degraded,
        latency: snapshot.latency,
    }
}

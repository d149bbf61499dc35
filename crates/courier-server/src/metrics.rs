//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

// Metric name constants to avoid typos across modules.

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// WebSocket connection lifetime seconds (histogram).
pub const WS_CONNECTION_DURATION_SECONDS: &str = "ws_connection_duration_seconds";
/// Handshakes rejected (counter, labels: reason).
pub const WS_AUTH_FAILURES_TOTAL: &str = "ws_auth_failures_total";
/// Inbound events total (counter, labels: event).
pub const EVENTS_TOTAL: &str = "events_total";
/// Failed events total (counter, labels: event, code).
pub const EVENT_ERRORS_TOTAL: &str = "event_errors_total";
/// Handler duration seconds (histogram, labels: event).
pub const EVENT_DURATION_SECONDS: &str = "event_duration_seconds";
/// Events rejected by a rate limiter (counter, labels: event).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Messages queued for unreachable recipients (counter).
pub const OFFLINE_ENQUEUED_TOTAL: &str = "offline_enqueued_total";
/// Queued messages delivered on reconnect (counter).
pub const OFFLINE_FLUSHED_TOTAL: &str = "offline_flushed_total";
/// Envelopes dropped because the cluster publisher fell behind (counter).
pub const CLUSTER_PUBLISH_DROPPED_TOTAL: &str = "cluster_publish_dropped_total";

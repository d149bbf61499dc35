//! Runtime configuration for the server.
//!
//! [`ServerConfig`] is the resolved, duration-typed view of
//! [`CourierSettings`] that the gateway and the router read at runtime.

use std::time::Duration;

use courier_settings::{CourierSettings, RateLimitSettings};
use uuid::Uuid;

/// Configuration for a Courier server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind.
    pub host: String,
    /// Port to bind (`0` for auto-assign).
    pub port: u16,
    /// Identifier of this process in cluster envelopes and `/health`.
    pub node_id: String,
    /// HS256 secret for handshake tokens.
    pub jwt_secret: String,
    /// Max inbound WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection.
    pub send_queue_capacity: usize,
    /// Interval between server pings.
    pub ping_interval: Duration,
    /// Silence after which a connection is dropped.
    pub pong_timeout: Duration,
    /// Grace period for background tasks on shutdown.
    pub shutdown_timeout: Duration,
    /// Upper bound on message content, in characters.
    pub max_content_chars: usize,
    /// Cap on `get-missed-messages` results.
    pub missed_messages_limit: usize,
    /// `sync-messages` limit when the client gives none.
    pub sync_default_limit: usize,
    /// Largest `sync-messages` limit honoured.
    pub sync_max_limit: usize,
    /// Quiet period after which `typing-stopped` fires.
    pub typing_quiet: Duration,
    /// Bound on every collaborator and backing-store call.
    pub store_timeout: Duration,
    /// Bound on a whole event handler.
    pub handler_timeout: Duration,
    /// Edit lock lifetime.
    pub lock_ttl: Duration,
    /// Heartbeat samples older than this are swept.
    pub heartbeat_inactivity: Duration,
    /// Idle per-identity latency aggregates older than this are swept.
    pub heartbeat_metrics_retention: Duration,
    /// Maintenance sweep period.
    pub sweep_interval: Duration,
    /// Per-event sliding-window limits.
    pub rate_limits: RateLimitSettings,
}

impl ServerConfig {
    /// Resolve settings into runtime configuration, minting a node id when
    /// none is configured.
    pub fn from_settings(settings: &CourierSettings) -> Self {
        let delivery = &settings.delivery;
        Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            node_id: settings
                .server
                .node_id
                .clone()
                .unwrap_or_else(|| format!("node-{}", Uuid::now_v7().simple())),
            jwt_secret: settings.auth.jwt_secret.clone(),
            max_message_size: settings.server.max_message_size,
            send_queue_capacity: settings.server.send_queue_capacity,
            ping_interval: Duration::from_millis(settings.server.ping_interval_ms),
            pong_timeout: Duration::from_millis(settings.server.pong_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.server.shutdown_timeout_ms),
            max_content_chars: delivery.max_content_chars,
            missed_messages_limit: delivery.missed_messages_limit,
            sync_default_limit: delivery.sync_default_limit,
            sync_max_limit: delivery.sync_max_limit,
            typing_quiet: Duration::from_millis(delivery.typing_quiet_ms),
            store_timeout: Duration::from_millis(delivery.store_timeout_ms),
            handler_timeout: Duration::from_millis(delivery.handler_timeout_ms),
            lock_ttl: Duration::from_millis(settings.locks.ttl_ms),
            heartbeat_inactivity: Duration::from_millis(settings.heartbeat.inactivity_ms),
            heartbeat_metrics_retention: Duration::from_millis(settings.heartbeat.metrics_retention_ms),
            sweep_interval: Duration::from_millis(settings.heartbeat.sweep_interval_ms),
            rate_limits: settings.rate_limits.clone(),
        }
    }
}

impl Default for ServerConfig {
    /// Compiled settings defaults, bound to loopback on an auto-assigned port.
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            ..Self::from_settings(&CourierSettings::default())
        }
    }
}

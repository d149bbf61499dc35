//! Listener, authentication and logging settings.

use courier_core::logging::LogFormat;
use serde::{Deserialize, Serialize};

/// Listener and WebSocket transport settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (0 picks a free port).
    pub port: u16,
    /// Largest accepted inbound frame, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before drops start.
    pub send_queue_capacity: usize,
    /// Interval between server pings.
    pub ping_interval_ms: u64,
    /// Silence after which a connection is considered dead.
    pub pong_timeout_ms: u64,
    /// Grace period for draining connections on shutdown.
    pub shutdown_timeout_ms: u64,
    /// Identifier of this process in cluster envelopes and `/health`.
    /// Generated at startup when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            max_message_size: 1024 * 1024,
            send_queue_capacity: 1024,
            ping_interval_ms: 30_000,
            pong_timeout_ms: 60_000,
            shutdown_timeout_ms: 10_000,
            node_id: None,
        }
    }
}

/// Handshake credential verification.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AuthSettings {
    /// HS256 secret shared with the token issuer.
    pub jwt_secret: String,
}

impl AuthSettings {
    /// Secret used when nothing is configured. The server warns at startup
    /// while this is in effect.
    pub const DEV_SECRET: &'static str = "devsecret";

    /// Whether the development secret is still configured.
    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == Self::DEV_SECRET
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self {
            jwt_secret: Self::DEV_SECRET.to_string(),
        }
    }
}

/// Log output settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

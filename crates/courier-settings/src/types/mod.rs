//! Settings type definitions.
//!
//! All types use `#[serde(rename_all = "camelCase", default)]` so a settings
//! file may be partial: missing fields keep their compiled default.

mod backends;
mod delivery;
mod server;

pub use backends::*;
pub use delivery::*;
pub use server::*;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings type.
///
/// ```json
/// {
///   "server": { "port": 9000 },
///   "redis": { "url": "redis://127.0.0.1:6379" },
///   "rateLimits": { "typing": { "maxRequests": 10 } }
/// }
/// ```
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Listener and WebSocket transport.
    pub server: ServerSettings,
    /// Handshake credential verification.
    pub auth: AuthSettings,
    /// Shared presence, offline queue and cluster fan-out.
    pub redis: RedisSettings,
    /// Reference collaborator store.
    pub store: StoreSettings,
    /// Message routing bounds and collaborator timeouts.
    pub delivery: DeliverySettings,
    /// Cooperative edit locks.
    pub locks: LockSettings,
    /// Heartbeat bookkeeping and the maintenance sweep.
    pub heartbeat: HeartbeatSettings,
    /// Per-event sliding-window limits.
    pub rate_limits: RateLimitSettings,
    /// Log level and format.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.auth.jwt_secret.is_empty() {
            return Err(invalid("auth.jwtSecret must not be empty"));
        }
        if self.delivery.max_content_chars == 0 {
            return Err(invalid("delivery.maxContentChars must be at least 1"));
        }
        if self.delivery.sync_default_limit > self.delivery.sync_max_limit {
            return Err(invalid(
                "delivery.syncDefaultLimit must not exceed delivery.syncMaxLimit",
            ));
        }
        if self.server.send_queue_capacity == 0 {
            return Err(invalid("server.sendQueueCapacity must be at least 1"));
        }
        for (name, rule) in [
            ("sendMessage", &self.rate_limits.send_message),
            ("typing", &self.rate_limits.typing),
            ("default", &self.rate_limits.default),
        ] {
            if rule.max_requests == 0 || rule.window_ms == 0 {
                return Err(invalid(format!(
                    "rateLimits.{name} needs a positive maxRequests and windowMs"
                )));
            }
        }
        if self.locks.ttl_ms == 0 {
            return Err(invalid("locks.ttlMs must be positive"));
        }
        if self.heartbeat.metrics_retention_ms < self.heartbeat.inactivity_ms {
            return Err(invalid(
                "heartbeat.metricsRetentionMs must not be shorter than heartbeat.inactivityMs",
            ));
        }
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> SettingsError {
    SettingsError::InvalidValue(message.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_are_valid() {
        CourierSettings::default().validate().unwrap();
    }

    #[test]
    fn defaults_match_documented_values() {
        let s = CourierSettings::default();
        assert_eq!(s.delivery.max_content_chars, 5000);
        assert_eq!(s.delivery.missed_messages_limit, 500);
        assert_eq!(s.delivery.typing_quiet_ms, 3000);
        assert_eq!(s.delivery.queue_retention_secs, 7 * 24 * 60 * 60);
        assert_eq!(s.locks.ttl_ms, 300_000);
        assert_eq!(s.heartbeat.inactivity_ms, 120_000);
        assert_eq!(s.heartbeat.metrics_retention_ms, 86_400_000);
        assert_eq!(s.rate_limits.send_message.max_requests, 50);
        assert_eq!(s.rate_limits.typing.max_requests, 30);
        assert_eq!(s.rate_limits.default.max_requests, 100);
        assert!(s.redis.url.is_none());
    }

    #[test]
    fn empty_secret_rejected() {
        let mut s = CourierSettings::default();
        s.auth.jwt_secret.clear();
        assert_matches!(s.validate(), Err(SettingsError::InvalidValue(_)));
    }

    #[test]
    fn zero_rate_limit_rejected() {
        let mut s = CourierSettings::default();
        s.rate_limits.typing.max_requests = 0;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("rateLimits.typing"));
    }

    #[test]
    fn metrics_retention_cannot_undercut_inactivity() {
        let mut s = CourierSettings::default();
        s.heartbeat.metrics_retention_ms = s.heartbeat.inactivity_ms - 1;
        let err = s.validate().unwrap_err();
        assert!(err.to_string().contains("metricsRetentionMs"));
    }

    #[test]
    fn sync_limits_must_be_ordered() {
        let mut s = CourierSettings::default();
        s.delivery.sync_default_limit = 1000;
        assert!(s.validate().is_err());
    }

    #[test]
    fn serializes_camel_case_sections() {
        let value = serde_json::to_value(CourierSettings::default()).unwrap();
        assert!(value.get("rateLimits").is_some());
        assert!(value["delivery"].get("maxContentChars").is_some());
        assert!(value["server"].get("sendQueueCapacity").is_some());
    }
}

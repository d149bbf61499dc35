//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`CourierSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `COURIER_*` environment overrides
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::{CourierSettings, StoreBackend};

/// Resolve the default settings file (`~/.courier/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".courier").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<CourierSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON or an invalid merged value
/// is an error.
pub fn load_settings_from_path(path: &Path) -> Result<CourierSettings> {
    let mut settings = merge_file(path)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

fn merge_file(path: &Path) -> Result<CourierSettings> {
    let defaults = serde_json::to_value(CourierSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply process environment overrides.
pub fn apply_env_overrides(settings: &mut CourierSettings) {
    apply_overrides(settings, &|name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are logged and
/// ignored, leaving the file/default value in place.
pub fn apply_overrides(settings: &mut CourierSettings, lookup: &dyn Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u16("COURIER_PORT", 0, 65535).or_else(|| env.u16("PORT", 1, 65535)) {
        settings.server.port = v;
    }
    if let Some(v) = env.string("COURIER_NODE_ID") {
        settings.server.node_id = Some(v);
    }
    if let Some(v) = env.usize("COURIER_MAX_MESSAGE_SIZE", 1024, 64 * 1024 * 1024) {
        settings.server.max_message_size = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = env
        .string("COURIER_JWT_SECRET")
        .or_else(|| env.string("JWT_SECRET"))
    {
        settings.auth.jwt_secret = v;
    }

    // ── Redis ───────────────────────────────────────────────────────
    if let Some(v) = env
        .string("COURIER_REDIS_URL")
        .or_else(|| env.string("REDIS_URL"))
    {
        settings.redis.url = Some(v);
    }
    if let Some(v) = env.string("COURIER_REDIS_PREFIX") {
        settings.redis.key_prefix = v;
    }
    if let Some(v) = env.bool("COURIER_CLUSTER_ENABLED") {
        settings.redis.cluster_enabled = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_STORE") {
        match v.to_ascii_lowercase().as_str() {
            "memory" => settings.store.backend = StoreBackend::Memory,
            "sqlite" => settings.store.backend = StoreBackend::Sqlite,
            _ => warn!(key = "COURIER_STORE", value = %v, "unknown store backend, ignoring"),
        }
    }
    if let Some(v) = env.string("COURIER_SQLITE_PATH") {
        settings.store.sqlite_path = v;
    }

    // ── Delivery ────────────────────────────────────────────────────
    if let Some(v) = env.usize("COURIER_MAX_CONTENT_CHARS", 1, 1_000_000) {
        settings.delivery.max_content_chars = v;
    }
    if let Some(v) = env.u64("COURIER_TYPING_QUIET_MS", 100, 60_000) {
        settings.delivery.typing_quiet_ms = v;
    }
    if let Some(v) = env.u64("COURIER_STORE_TIMEOUT_MS", 100, 120_000) {
        settings.delivery.store_timeout_ms = v;
    }
    if let Some(v) = env.u64("COURIER_QUEUE_RETENTION_SECS", 60, 90 * 24 * 60 * 60) {
        settings.delivery.queue_retention_secs = v;
    }

    // ── Locks / heartbeat ───────────────────────────────────────────
    if let Some(v) = env.u64("COURIER_LOCK_TTL_MS", 1000, 3_600_000) {
        settings.locks.ttl_ms = v;
    }
    if let Some(v) = env.u64("COURIER_HEARTBEAT_INACTIVITY_MS", 1000, 3_600_000) {
        settings.heartbeat.inactivity_ms = v;
    }
    if let Some(v) = env.u64("COURIER_HEARTBEAT_METRICS_RETENTION_MS", 60_000, 30 * 24 * 3_600_000) {
        settings.heartbeat.metrics_retention_ms = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = env.string("COURIER_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.string("COURIER_LOG_FORMAT") {
        match v.parse() {
            Ok(format) => settings.logging.format = format,
            Err(e) => warn!(key = "COURIER_LOG_FORMAT", error = %e, "ignoring"),
        }
    }
}

// ── Pure parsing functions (testable without env vars) ──────────────────────

/// Parse a string as a boolean.
///
/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a string as a `u16` within a range.
pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `u64` within a range.
pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

/// Parse a string as a `usize` within a range.
pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

// ── Env var readers (thin wrappers) ─────────────────────────────────────────

struct EnvReader<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl EnvReader<'_> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn bool(&self, name: &str) -> Option<bool> {
        let val = (self.lookup)(name)?;
        let result = parse_bool(&val);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        let val = (self.lookup)(name)?;
        let result = parse_u16_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u16 env var, ignoring");
        }
        result
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let val = (self.lookup)(name)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid u64 env var, ignoring");
        }
        result
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        let val = (self.lookup)(name)?;
        let result = parse_usize_range(&val, min, max);
        if result.is_none() {
            warn!(key = name, value = %val, "invalid usize env var, ignoring");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::SettingsError;
    use assert_matches::assert_matches;
    use courier_core::logging::LogFormat;
    use std::collections::HashMap;

    fn overrides(pairs: &[(&str, &str)]) -> CourierSettings {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        let mut settings = CourierSettings::default();
        apply_overrides(&mut settings, &|name| vars.get(name).cloned());
        settings
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 5000, "host": "0.0.0.0"}});
        let source = serde_json::json!({"server": {"port": 9090}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 9090);
        assert_eq!(merged["server"]["host"], "0.0.0.0");
    }

    #[test]
    fn merge_null_preserves_target() {
        let merged = deep_merge(
            serde_json::json!({"a": 1, "b": 2}),
            serde_json::json!({"a": null}),
        );
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replaces() {
        let merged = deep_merge(
            serde_json::json!({"items": [1, 2, 3]}),
            serde_json::json!({"items": [4]}),
        );
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    // ── file loading ────────────────────────────────────────────────

    #[test]
    fn missing_file_yields_defaults() {
        let settings = merge_file(Path::new("/nonexistent/settings.json")).unwrap();
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.delivery.max_content_chars, 5000);
    }

    #[test]
    fn partial_file_overrides_only_named_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 9100}, "rateLimits": {"typing": {"maxRequests": 5, "windowMs": 1000}}}"#,
        )
        .unwrap();

        let settings = merge_file(&path).unwrap();
        assert_eq!(settings.server.port, 9100);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.rate_limits.typing.max_requests, 5);
        assert_eq!(settings.rate_limits.typing.window_ms, 1000);
        assert_eq!(settings.rate_limits.send_message.max_requests, 50);
    }

    #[test]
    fn invalid_json_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert_matches!(merge_file(&path), Err(SettingsError::Json(_)));
    }

    #[test]
    fn invalid_merged_value_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"locks": {"ttlMs": 0}}"#).unwrap();
        assert_matches!(
            load_settings_from_path(&path),
            Err(SettingsError::InvalidValue(_))
        );
    }

    // ── overrides ───────────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let s = overrides(&[
            ("COURIER_PORT", "7000"),
            ("COURIER_JWT_SECRET", "s3cret"),
            ("COURIER_REDIS_URL", "redis://cache:6379"),
            ("COURIER_STORE", "sqlite"),
            ("COURIER_LOG_FORMAT", "json"),
            ("COURIER_LOCK_TTL_MS", "60000"),
        ]);
        assert_eq!(s.server.port, 7000);
        assert_eq!(s.auth.jwt_secret, "s3cret");
        assert_eq!(s.redis.url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(s.store.backend, StoreBackend::Sqlite);
        assert_eq!(s.logging.format, LogFormat::Json);
        assert_eq!(s.locks.ttl_ms, 60_000);
    }

    #[test]
    fn unprefixed_fallbacks_apply() {
        let s = overrides(&[("JWT_SECRET", "legacy"), ("REDIS_URL", "redis://r")]);
        assert_eq!(s.auth.jwt_secret, "legacy");
        assert_eq!(s.redis.url.as_deref(), Some("redis://r"));
    }

    #[test]
    fn prefixed_wins_over_fallback() {
        let s = overrides(&[("JWT_SECRET", "legacy"), ("COURIER_JWT_SECRET", "new")]);
        assert_eq!(s.auth.jwt_secret, "new");
    }

    #[test]
    fn out_of_range_values_are_ignored() {
        let s = overrides(&[
            ("COURIER_LOCK_TTL_MS", "5"),
            ("COURIER_PORT", "99999"),
            ("COURIER_CLUSTER_ENABLED", "perhaps"),
        ]);
        assert_eq!(s.locks.ttl_ms, 300_000);
        assert_eq!(s.server.port, 5000);
        assert!(s.redis.cluster_enabled);
    }

    #[test]
    fn empty_strings_are_ignored() {
        let s = overrides(&[("COURIER_HOST", "")]);
        assert_eq!(s.server.host, "0.0.0.0");
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "no", "Off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn parse_ranges() {
        assert_eq!(parse_u16_range("9090", 1, 65535), Some(9090));
        assert_eq!(parse_u16_range("0", 1, 65535), None);
        assert_eq!(parse_u64_range("500", 1000, 600_000), None);
        assert_eq!(parse_u64_range("abc", 0, 10), None);
        assert_eq!(parse_usize_range("50", 1, 100), Some(50));
    }
}

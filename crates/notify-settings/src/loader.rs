//! Settings loading with deep merge and environment variable overrides.
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::Result;
use crate::types::GatewaySettings;

/// Resolve the path to the settings file (`~/.notifyd/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".notifyd").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<GatewaySettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides, then validate.
///
/// A missing file yields defaults; invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<GatewaySettings> {
    let mut settings = load_file_layer(path)?;
    apply_overrides(&mut settings, |name| std::env::var(name).ok());
    settings.validate()?;
    Ok(settings)
}

fn load_file_layer(path: &Path) -> Result<GatewaySettings> {
    let defaults = serde_json::to_value(GatewaySettings::default())?;

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

/// Apply `NOTIFYD_*` overrides read through `lookup`.
///
/// Invalid values are logged and ignored (fall back to file/default).
pub fn apply_overrides<F>(settings: &mut GatewaySettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let string = |name: &str| lookup(name).filter(|v| !v.is_empty());

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = string("NOTIFYD_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = string("NOTIFYD_PORT") {
        match parse_u16_range(&v, 0, 65535) {
            Some(port) => settings.server.port = port,
            None => tracing::warn!(key = "NOTIFYD_PORT", value = %v, "invalid port, ignoring"),
        }
    }

    // ── Broker ──────────────────────────────────────────────────────
    if let Some(v) = string("NOTIFYD_BROKER_ENABLE") {
        match parse_bool(&v) {
            Some(enable) => settings.broker.enable = enable,
            None => tracing::warn!(key = "NOTIFYD_BROKER_ENABLE", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = string("NOTIFYD_BROKER_ADDRESS") {
        settings.broker.address = v;
    }
    if let Some(v) = string("NOTIFYD_QUEUE_NAME") {
        settings.broker.queue_name = v;
    }
    if let Some(v) = string("NOTIFYD_EXCHANGE_NAME") {
        settings.broker.exchange_name = v;
    }

    // ── Auth ────────────────────────────────────────────────────────
    if let Some(v) = string("NOTIFYD_AUTH_ENABLE") {
        match parse_bool(&v) {
            Some(enable) => settings.auth.enable = enable,
            None => tracing::warn!(key = "NOTIFYD_AUTH_ENABLE", value = %v, "invalid boolean, ignoring"),
        }
    }
    if let Some(v) = string("NOTIFYD_JWT_SECRET") {
        settings.auth.jwt_secret = v;
    }

    // ── Logging ─────────────────────────────────────────────────────
    if let Some(v) = string("NOTIFYD_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = string("NOTIFYD_LOG_JSON") {
        match parse_bool(&v) {
            Some(json) => settings.logging.json = json,
            None => tracing::warn!(key = "NOTIFYD_LOG_JSON", value = %v, "invalid boolean, ignoring"),
        }
    }
}

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

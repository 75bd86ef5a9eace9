//! Server configuration.
//!
//! Loading flow:
//! 1. Start with [`ServerConfig::default()`]
//! 2. If a JSON file is given and exists, deep-merge it over the defaults
//! 3. Apply `TETHER_*` environment variable overrides (highest priority)

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_core::logging::LogFormat;
use thiserror::Error;
use tracing::debug;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the config file from disk.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// Failed to parse JSON in the config file.
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// A value was out of range or otherwise unusable.
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Result type for configuration operations.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Configuration for the Tether server.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent WebSocket connections.
    pub max_connections: usize,
    /// Outbound frames queued per connection before sends start failing.
    pub outbound_buffer: usize,
    /// Heartbeat interval in seconds.
    pub heartbeat_interval_secs: u64,
    /// Close a peer that has been silent this long.
    pub heartbeat_timeout_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Default tracing filter (`RUST_LOG` wins when set).
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
    /// Path of the WebSocket endpoint.
    pub ws_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            outbound_buffer: 1024,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: 45,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            log_level: "info".into(),
            log_format: LogFormat::Compact,
            ws_path: "/websocket".into(),
        }
    }
}

impl ServerConfig {
    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(ConfigError::InvalidValue("max_connections must be > 0".into()));
        }
        if self.outbound_buffer == 0 {
            return Err(ConfigError::InvalidValue("outbound_buffer must be > 0".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "heartbeat_interval_secs must be > 0".into(),
            ));
        }
        if self.heartbeat_timeout_secs < self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(
                "heartbeat_timeout_secs must be >= heartbeat_interval_secs".into(),
            ));
        }
        if !self.ws_path.starts_with('/') {
            return Err(ConfigError::InvalidValue(format!(
                "ws_path must start with '/': {}",
                self.ws_path
            )));
        }
        Ok(())
    }
}

/// Load configuration, optionally from a JSON file, with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config from file");
            let content = std::fs::read_to_string(path)?;
            let user: Value = serde_json::from_str(&content)?;
            deep_merge(defaults, user)
        }
        Some(path) => {
            debug!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

/// Recursive deep merge of two JSON values.
///
/// - Objects are merged recursively (source overrides target per-key)
/// - Arrays and primitives are replaced entirely by source
/// - Null values in source are skipped (preserving target)
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

/// Apply `TETHER_*` environment variable overrides.
///
/// Unparseable or out-of-range values are ignored.
pub fn apply_env_overrides(config: &mut ServerConfig) {
    apply_overrides_from(config, |key| std::env::var(key).ok());
}

fn apply_overrides_from(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| lookup(key).map(|v| v.trim().to_owned()).filter(|v| !v.is_empty());

    if let Some(v) = read("TETHER_HOST") {
        config.host = v;
    }
    if let Some(v) = read("TETHER_PORT").and_then(|v| v.parse::<u16>().ok()) {
        config.port = v;
    }
    if let Some(v) = read("TETHER_MAX_CONNECTIONS")
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| (1..=1_000_000).contains(v))
    {
        config.max_connections = v;
    }
    if let Some(v) = read("TETHER_LOG_LEVEL") {
        config.log_level = v;
    }
    if let Some(v) = read("TETHER_LOG_FORMAT").and_then(|v| v.parse::<LogFormat>().ok()) {
        config.log_format = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // ── Defaults ────────────────────────────────────────────────────

    #[test]
    fn defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.ws_path, "/websocket");
        assert_eq!(cfg.log_format, LogFormat::Compact);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn serde_roundtrip() {
        let cfg = ServerConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: ServerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: ServerConfig = serde_json::from_str(r#"{"port":3000}"#).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.host, "127.0.0.1");
    }

    // ── Validation ──────────────────────────────────────────────────

    #[test]
    fn validate_rejects_zero_connections() {
        let cfg = ServerConfig {
            max_connections: 0,
            ..ServerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn validate_rejects_timeout_below_interval() {
        let cfg = ServerConfig {
            heartbeat_interval_secs: 30,
            heartbeat_timeout_secs: 10,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_relative_ws_path() {
        let cfg = ServerConfig {
            ws_path: "ws".into(),
            ..ServerConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("ws_path"));
    }

    // ── Deep merge ──────────────────────────────────────────────────

    #[test]
    fn deep_merge_objects_per_key() {
        let merged = deep_merge(json!({"a": 1, "b": {"c": 2, "d": 3}}), json!({"b": {"c": 9}}));
        assert_eq!(merged, json!({"a": 1, "b": {"c": 9, "d": 3}}));
    }

    #[test]
    fn deep_merge_skips_nulls() {
        let merged = deep_merge(json!({"a": 1}), json!({"a": null}));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn deep_merge_replaces_arrays() {
        let merged = deep_merge(json!({"a": [1, 2]}), json!({"a": [3]}));
        assert_eq!(merged, json!({"a": [3]}));
    }

    // ── File loading ────────────────────────────────────────────────

    #[test]
    fn load_without_path_gives_defaults() {
        let cfg = load_config(None).unwrap();
        assert_eq!(cfg.ws_path, ServerConfig::default().ws_path);
    }

    #[test]
    fn load_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = load_config(Some(&dir.path().join("absent.json"))).unwrap();
        assert_eq!(cfg.max_connections, ServerConfig::default().max_connections);
    }

    #[test]
    fn load_merges_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tether.json");
        std::fs::write(&path, r#"{"max_connections": 7, "ws_path": "/ddp", "host": null}"#).unwrap();
        let cfg = load_config(Some(&path)).unwrap();
        assert_eq!(cfg.max_connections, 7);
        assert_eq!(cfg.ws_path, "/ddp");
        assert_eq!(cfg.heartbeat_interval_secs, 15);
    }

    #[test]
    fn load_invalid_json_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Json(_))));
    }

    #[test]
    fn load_invalid_value_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("zero.json");
        std::fs::write(&path, r#"{"outbound_buffer": 0}"#).unwrap();
        assert!(matches!(load_config(Some(&path)), Err(ConfigError::InvalidValue(_))));
    }

    // ── Env overrides ───────────────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut cfg = ServerConfig::default();
        apply_overrides_from(
            &mut cfg,
            env(&[
                ("TETHER_HOST", "0.0.0.0"),
                ("TETHER_PORT", "4000"),
                ("TETHER_MAX_CONNECTIONS", "12"),
                ("TETHER_LOG_LEVEL", "debug"),
                ("TETHER_LOG_FORMAT", "json"),
            ]),
        );
        assert_eq!(cfg.host, "0.0.0.0");
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.max_connections, 12);
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.log_format, LogFormat::Json);
    }

    #[test]
    fn invalid_env_values_ignored() {
        let mut cfg = ServerConfig::default();
        apply_overrides_from(
            &mut cfg,
            env(&[
                ("TETHER_PORT", "99999"),
                ("TETHER_MAX_CONNECTIONS", "0"),
                ("TETHER_LOG_FORMAT", "xml"),
                ("TETHER_HOST", "   "),
            ]),
        );
        assert_eq!(cfg, ServerConfig::default());
    }

    #[test]
    fn error_display() {
        let err = ConfigError::InvalidValue("port out of range".into());
        assert_eq!(err.to_string(), "invalid config value: port out of range");
        let io: ConfigError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(io.to_string().contains("gone"));
    }
}

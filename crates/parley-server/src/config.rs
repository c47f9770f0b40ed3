//! Server configuration with layered loading.
//!
//! Resolution order (later wins):
//! 1. Compiled [`ServerConfig::default()`]
//! 2. A JSON settings file, deep-merged over the defaults
//! 3. `PARLEY_*` environment variables
//!
//! CLI flags are applied on top by the binary.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Per-connection outbound queue. A full queue disconnects the client.
    pub outbound_queue_capacity: usize,
    /// Shared inbound queue feeding the hub's route step.
    pub route_queue_capacity: usize,
    pub heartbeat_interval_secs: u64,
    /// Silence (no frames, pongs included) tolerated before a client is dropped.
    pub client_timeout_secs: u64,
    pub max_message_size: usize,
    pub history_default_limit: u32,
    pub history_max_limit: u32,
    pub online_window_secs: u64,
    /// Deliver messages even when persistence fails.
    pub deliver_unsaved_messages: bool,
    pub shutdown_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            outbound_queue_capacity: 256,
            route_queue_capacity: 1024,
            heartbeat_interval_secs: 30,
            client_timeout_secs: 90,
            max_message_size: 64 * 1024,
            history_default_limit: 50,
            history_max_limit: 200,
            online_window_secs: 300,
            deliver_unsaved_messages: true,
            shutdown_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Reject combinations the hub cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.outbound_queue_capacity == 0 || self.route_queue_capacity == 0 {
            return Err(ConfigError::InvalidValue("queue capacities must be non-zero".into()));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(ConfigError::InvalidValue("heartbeat interval must be non-zero".into()));
        }
        if self.client_timeout_secs <= self.heartbeat_interval_secs {
            return Err(ConfigError::InvalidValue(format!(
                "client timeout ({}s) must exceed heartbeat interval ({}s)",
                self.client_timeout_secs, self.heartbeat_interval_secs
            )));
        }
        if self.history_default_limit == 0 || self.history_default_limit > self.history_max_limit {
            return Err(ConfigError::InvalidValue(
                "history default limit must be within 1..=history_max_limit".into(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from an optional JSON file plus env overrides.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let defaults = serde_json::to_value(ServerConfig::default())?;

    let merged = match path {
        Some(path) if path.exists() => {
            debug!(?path, "loading config file");
            let content = std::fs::read_to_string(path)?;
            deep_merge(defaults, serde_json::from_str(&content)?)
        }
        Some(path) => {
            warn!(?path, "config file not found, using defaults");
            defaults
        }
        None => defaults,
    };

    let mut config: ServerConfig = serde_json::from_value(merged)?;
    apply_env_overrides(&mut config, |name| std::env::var(name).ok());
    config.validate()?;
    Ok(config)
}

/// Objects merge per key, everything else is replaced, nulls are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `PARLEY_*` overrides read through `lookup`. Invalid values are
/// logged and ignored.
pub fn apply_env_overrides(config: &mut ServerConfig, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());

    if let Some(v) = read("PARLEY_HOST") {
        config.host = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_PORT", |v| parse_range::<u16>(v, 0, u16::MAX)) {
        config.port = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_OUTBOUND_QUEUE", |v| parse_range(v, 1, 65_536)) {
        config.outbound_queue_capacity = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_ROUTE_QUEUE", |v| parse_range(v, 1, 1_048_576)) {
        config.route_queue_capacity = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_HEARTBEAT_SECS", |v| parse_range(v, 1, 3600)) {
        config.heartbeat_interval_secs = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_CLIENT_TIMEOUT_SECS", |v| parse_range(v, 2, 86_400)) {
        config.client_timeout_secs = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_MAX_MESSAGE_SIZE", |v| parse_range(v, 256, 16 << 20)) {
        config.max_message_size = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_ONLINE_WINDOW_SECS", |v| parse_range(v, 1, 86_400)) {
        config.online_window_secs = v;
    }
    if let Some(v) = parsed(&read, "PARLEY_DELIVER_UNSAVED", parse_bool) {
        config.deliver_unsaved_messages = v;
    }
}

fn parsed<T>(
    read: &impl Fn(&str) -> Option<String>,
    name: &str,
    parse: impl Fn(&str) -> Option<T>,
) -> Option<T> {
    let raw = read(name)?;
    let value = parse(&raw);
    if value.is_none() {
        warn!(key = name, value = %raw, "invalid env override, ignoring");
    }
    value
}

/// Accepts (case-insensitive) `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert_eq!(config.outbound_queue_capacity, 256);
        assert_eq!(config.history_default_limit, 50);
        assert!(config.deliver_unsaved_messages);
        config.validate().unwrap();
    }

    #[test]
    fn deep_merge_overrides_and_skips_nulls() {
        let merged = deep_merge(
            json!({"port": 8080, "host": "0.0.0.0", "nested": {"a": 1, "b": 2}}),
            json!({"port": 9000, "host": null, "nested": {"b": 3}}),
        );
        assert_eq!(merged, json!({"port": 9000, "host": "0.0.0.0", "nested": {"a": 1, "b": 3}}));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let config = load_config(None).unwrap();
        assert_eq!(config.route_queue_capacity, ServerConfig::default().route_queue_capacity);
    }

    #[test]
    fn load_from_file_merges_partial_settings() {
        let dir = std::env::temp_dir().join(format!("parley-config-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("parley.json");
        std::fs::write(&path, r#"{"outbound_queue_capacity": 8, "deliver_unsaved_messages": false}"#)
            .unwrap();

        let config = load_config(Some(&path)).unwrap();
        assert_eq!(config.outbound_queue_capacity, 8);
        assert!(!config.deliver_unsaved_messages);
        assert_eq!(config.heartbeat_interval_secs, 30);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn invalid_json_file_is_an_error() {
        let dir = std::env::temp_dir().join(format!("parley-config-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("parley.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(load_config(Some(&path)), Err(ConfigError::Json(_))));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn env_overrides_apply_and_invalid_values_are_ignored() {
        let mut config = ServerConfig::default();
        apply_env_overrides(
            &mut config,
            env(&[
                ("PARLEY_PORT", "9100"),
                ("PARLEY_OUTBOUND_QUEUE", "0"),
                ("PARLEY_DELIVER_UNSAVED", "off"),
                ("PARLEY_HOST", ""),
            ]),
        );
        assert_eq!(config.port, 9100);
        assert_eq!(config.outbound_queue_capacity, 256);
        assert!(!config.deliver_unsaved_messages);
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn validate_rejects_timeout_below_heartbeat() {
        let config = ServerConfig {
            heartbeat_interval_secs: 30,
            client_timeout_secs: 30,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue(_))));
    }

    #[test]
    fn parse_helpers() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("maybe"), None);
        assert_eq!(parse_range::<u64>("42", 1, 100), Some(42));
        assert_eq!(parse_range::<u64>("420", 1, 100), None);
        assert_eq!(parse_range::<u64>("abc", 1, 100), None);
    }
}

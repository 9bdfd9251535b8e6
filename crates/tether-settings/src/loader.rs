//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`TetherSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `TETHER_*` environment overrides (highest priority)
//! 4. Validate the result
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::{Result, SettingsError};
use crate::types::{TetherSettings, UnknownTypePolicy};

/// Resolve the default settings file (`~/.tether/settings.json`).
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_owned());
    PathBuf::from(home).join(".tether").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<TetherSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from `path` with env var overrides.
///
/// A missing file yields defaults; an unreadable or malformed one is an error.
pub fn load_settings_from_path(path: &Path) -> Result<TetherSettings> {
    load_with_env(path, |name| std::env::var(name).ok())
}

/// Load settings from `path`, reading overrides through `lookup`.
pub fn load_with_env<F>(path: &Path, lookup: F) -> Result<TetherSettings>
where
    F: Fn(&str) -> Option<String>,
{
    let defaults = serde_json::to_value(TetherSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let user: Value = serde_json::from_str(&content).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: TetherSettings = serde_json::from_value(merged)?;
    apply_env_overrides_from(&mut settings, lookup);
    settings.validate()?;
    Ok(settings)
}

/// Recursive deep merge of two JSON values.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply overrides from the process environment.
pub fn apply_env_overrides(settings: &mut TetherSettings) {
    apply_env_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Values that fail to parse or fall outside their range are ignored with a
/// warning; the file/default value stays.
pub fn apply_env_overrides_from<F>(settings: &mut TetherSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.usize("TETHER_WORKER_THREADS", 1, 1024) {
        settings.reactor.worker_threads = v;
    }

    if let Some(v) = env.usize("TETHER_MAX_FRAME_SIZE", 1, u32::MAX as usize) {
        settings.connection.max_frame_size = v;
    }
    if let Some(v) = env.usize("TETHER_SEND_QUEUE_CAPACITY", 1, 1_000_000) {
        settings.connection.send_queue_capacity = v;
    }
    if let Some(v) = env.policy("TETHER_UNKNOWN_TYPE_POLICY") {
        settings.connection.unknown_type_policy = v;
    }
    if let Some(v) = env.u64("TETHER_HANDLER_TIMEOUT_MS", 1, 3_600_000) {
        settings.connection.handler_timeout_ms = v;
    }

    if let Some(v) = env.string("TETHER_HOST") {
        settings.server.host.clone_from(&v);
        settings.client.host = v;
    }
    if let Some(v) = env.u16("TETHER_PORT", 0, 65535) {
        settings.server.port = v;
        settings.client.port = v;
    }
    if let Some(v) = env.usize("TETHER_MAX_CONNECTIONS", 1, 1_000_000) {
        settings.server.max_connections = v;
    }
    if let Some(v) = env.u64("TETHER_SHUTDOWN_TIMEOUT_MS", 0, 600_000) {
        settings.server.shutdown_timeout_ms = v;
    }

    if let Some(v) = env.u64("TETHER_CALL_TIMEOUT_MS", 1, 3_600_000) {
        settings.client.default_call_timeout_ms = v;
    }
    if let Some(v) = env.u32("TETHER_CONNECT_ATTEMPTS", 1, 1_000) {
        settings.client.retry.max_attempts = v;
    }
    if let Some(v) = env.bool("TETHER_RECONNECT") {
        settings.client.retry.reconnect = v;
    }

    if let Some(v) = env.string("TETHER_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

// ── Pure parsing functions ──────────────────────────────────────────────────

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

/// Parse an unknown-type policy name (`drop` or `close`, any case).
pub fn parse_policy(val: &str) -> Option<UnknownTypePolicy> {
    match val.to_lowercase().as_str() {
        "drop" => Some(UnknownTypePolicy::Drop),
        "close" => Some(UnknownTypePolicy::Close),
        _ => None,
    }
}

/// Parse an integer within an inclusive range.
pub fn parse_range<T>(val: &str, min: T, max: T) -> Option<T>
where
    T: std::str::FromStr + PartialOrd,
{
    let n: T = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, name: &str) -> Option<String> {
        (self.lookup)(name)
    }

    fn string(&self, name: &str) -> Option<String> {
        self.raw(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl Fn(&str) -> Option<T>) -> Option<T> {
        let val = self.raw(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env override, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn policy(&self, name: &str) -> Option<UnknownTypePolicy> {
        self.parsed(name, "policy", parse_policy)
    }

    fn u16(&self, name: &str, min: u16, max: u16) -> Option<u16> {
        self.parsed(name, "u16", |v| parse_range(v, min, max))
    }

    fn u32(&self, name: &str, min: u32, max: u32) -> Option<u32> {
        self.parsed(name, "u32", |v| parse_range(v, min, max))
    }

    fn u64(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        self.parsed(name, "u64", |v| parse_range(v, min, max))
    }

    fn usize(&self, name: &str, min: usize, max: usize) -> Option<usize> {
        self.parsed(name, "usize", |v| parse_range(v, min, max))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    // ── deep_merge ──────────────────────────────────────────────────

    #[test]
    fn merge_nested_override() {
        let target = serde_json::json!({"server": {"port": 9400, "host": "127.0.0.1"}});
        let source = serde_json::json!({"server": {"port": 7000}});
        let merged = deep_merge(target, source);
        assert_eq!(merged["server"]["port"], 7000);
        assert_eq!(merged["server"]["host"], "127.0.0.1");
    }

    #[test]
    fn merge_null_preserves_target() {
        let target = serde_json::json!({"a": 1, "b": 2});
        let merged = deep_merge(target, serde_json::json!({"a": null}));
        assert_eq!(merged["a"], 1);
        assert_eq!(merged["b"], 2);
    }

    #[test]
    fn merge_array_replaces() {
        let target = serde_json::json!({"items": [1, 2, 3]});
        let merged = deep_merge(target, serde_json::json!({"items": [4]}));
        assert_eq!(merged["items"], serde_json::json!([4]));
    }

    #[test]
    fn merge_primitive_replaces_object() {
        let target = serde_json::json!({"a": {"nested": true}});
        let merged = deep_merge(target, serde_json::json!({"a": 42}));
        assert_eq!(merged["a"], 42);
    }

    // ── load_with_env ───────────────────────────────────────────────

    #[test]
    fn missing_file_returns_defaults() {
        let settings = load_with_env(Path::new("/nonexistent/settings.json"), no_env).unwrap();
        assert_eq!(settings, TetherSettings::default());
    }

    #[test]
    fn partial_file_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"server": {"port": 7100}, "client": {"retry": {"maxAttempts": 3}}, "connection": {"unknownTypePolicy": "close"}}"#,
        )
        .unwrap();

        let settings = load_with_env(&path, no_env).unwrap();
        assert_eq!(settings.server.port, 7100);
        assert_eq!(settings.server.host, "127.0.0.1");
        assert_eq!(settings.client.retry.max_attempts, 3);
        assert_eq!(settings.client.retry.base_delay_ms, 100);
        assert_eq!(settings.connection.unknown_type_policy, UnknownTypePolicy::Close);
    }

    #[test]
    fn invalid_json_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            load_with_env(&path, no_env),
            Err(SettingsError::Parse { path: p, .. }) if p == path
        ));
    }

    #[test]
    fn wrong_type_in_file_is_schema_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": "ninety"}}"#).unwrap();
        assert!(matches!(load_with_env(&path, no_env), Err(SettingsError::Schema(_))));
    }

    #[test]
    fn file_failing_validation_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"connection": {"maxFrameSize": 0}}"#).unwrap();
        assert!(matches!(
            load_with_env(&path, no_env),
            Err(SettingsError::InvalidValue(_))
        ));
    }

    #[test]
    fn env_beats_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"port": 7100}}"#).unwrap();
        let env = env_of(&[("TETHER_PORT", "7200"), ("TETHER_RECONNECT", "off")]);
        let settings = load_with_env(&path, env).unwrap();
        assert_eq!(settings.server.port, 7200);
        assert_eq!(settings.client.port, 7200);
        assert!(!settings.client.retry.reconnect);
    }

    // ── apply_env_overrides_from ────────────────────────────────────

    #[test]
    fn env_overrides_apply() {
        let mut s = TetherSettings::default();
        apply_env_overrides_from(
            &mut s,
            env_of(&[
                ("TETHER_WORKER_THREADS", "3"),
                ("TETHER_MAX_FRAME_SIZE", "1024"),
                ("TETHER_UNKNOWN_TYPE_POLICY", "CLOSE"),
                ("TETHER_HOST", "0.0.0.0"),
                ("TETHER_CONNECT_ATTEMPTS", "7"),
                ("TETHER_CALL_TIMEOUT_MS", "250"),
                ("TETHER_LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(s.reactor.worker_threads, 3);
        assert_eq!(s.connection.max_frame_size, 1024);
        assert_eq!(s.connection.unknown_type_policy, UnknownTypePolicy::Close);
        assert_eq!(s.server.host, "0.0.0.0");
        assert_eq!(s.client.host, "0.0.0.0");
        assert_eq!(s.client.retry.max_attempts, 7);
        assert_eq!(s.client.default_call_timeout_ms, 250);
        assert_eq!(s.logging.level, "debug");
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let mut s = TetherSettings::default();
        apply_env_overrides_from(
            &mut s,
            env_of(&[
                ("TETHER_WORKER_THREADS", "0"),
                ("TETHER_PORT", "99999"),
                ("TETHER_UNKNOWN_TYPE_POLICY", "explode"),
                ("TETHER_RECONNECT", "maybe"),
                ("TETHER_HOST", ""),
            ]),
        );
        let defaults = TetherSettings::default();
        assert_eq!(s.reactor.worker_threads, defaults.reactor.worker_threads);
        assert_eq!(s.server.port, 9400);
        assert_eq!(s.connection.unknown_type_policy, UnknownTypePolicy::Drop);
        assert!(s.client.retry.reconnect);
        assert_eq!(s.server.host, "127.0.0.1");
    }

    #[test]
    fn invalid_env_value_logs_warning() {
        let (logs, _guard) = tether_core::logging::capture_logs();
        let mut s = TetherSettings::default();
        apply_env_overrides_from(&mut s, env_of(&[("TETHER_PORT", "nope")]));
        assert!(logs.has_event(tracing::Level::WARN, "invalid env override"));
        assert_eq!(logs.with_field("key", "TETHER_PORT").len(), 1);
    }

    // ── parsers ─────────────────────────────────────────────────────

    #[test]
    fn parse_bool_variants() {
        for val in ["true", "1", "yes", "ON"] {
            assert_eq!(parse_bool(val), Some(true), "failed for {val}");
        }
        for val in ["false", "0", "No", "off"] {
            assert_eq!(parse_bool(val), Some(false), "failed for {val}");
        }
        assert_eq!(parse_bool("2"), None);
    }

    #[test]
    fn parse_range_bounds() {
        assert_eq!(parse_range::<u16>("9090", 1, 65535), Some(9090));
        assert_eq!(parse_range::<u16>("0", 1, 65535), None);
        assert_eq!(parse_range::<u64>(" 500 ", 1, 1000), Some(500));
        assert_eq!(parse_range::<usize>("abc", 1, 10), None);
        assert_eq!(parse_range::<u32>("-1", 0, 10), None);
    }

    #[test]
    fn parse_policy_names() {
        assert_eq!(parse_policy("Drop"), Some(UnknownTypePolicy::Drop));
        assert_eq!(parse_policy("close"), Some(UnknownTypePolicy::Close));
        assert_eq!(parse_policy("kill"), None);
    }
}

//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`WardenSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over the defaults
//! 3. Apply `WARDEN_*` environment variable overrides
//!
//! CLI flags are layered on top by the binary.

use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::WardenSettings;

/// Env var naming an explicit settings file.
pub const CONFIG_ENV: &str = "WARDEN_CONFIG";

/// Resolve the settings file: `$WARDEN_CONFIG`, else `~/.warden/settings.json`.
pub fn settings_path() -> PathBuf {
    if let Some(explicit) = std::env::var(CONFIG_ENV).ok().filter(|v| !v.is_empty()) {
        return PathBuf::from(explicit);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".warden").join("settings.json")
}

/// Load settings from the default path with env var overrides.
pub fn load_settings() -> Result<WardenSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Unreadable files and invalid JSON are
/// errors.
pub fn load_settings_from_path(path: &Path) -> Result<WardenSettings> {
    let mut settings = load_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Defaults merged with the file at `path`, without env overrides.
pub fn load_file(path: &Path) -> Result<WardenSettings> {
    let defaults = serde_json::to_value(WardenSettings::default())?;

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

/// Overlay `source` onto `target` and return the result.
///
/// Nested objects merge key by key. Any other value in `source` replaces the
/// one in `target` wholesale; `null` in `source` leaves `target` as is.
pub fn deep_merge(mut target: Value, source: Value) -> Value {
    merge_into(&mut target, source);
    target
}

fn merge_into(slot: &mut Value, incoming: Value) {
    match (slot, incoming) {
        (_, Value::Null) => {}
        (Value::Object(existing), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match existing.get_mut(&key) {
                    Some(current) => merge_into(current, value),
                    None if !value.is_null() => {
                        let _ = existing.insert(key, value);
                    }
                    None => {}
                }
            }
        }
        (slot, incoming) => *slot = incoming,
    }
}

/// Apply `WARDEN_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut WardenSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides read through `lookup`.
///
/// Invalid values are logged and ignored, leaving the file/default value.
pub fn apply_overrides_from<F>(settings: &mut WardenSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let env = EnvReader { lookup };

    if let Some(v) = env.string("WARDEN_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.number("WARDEN_PORT", 1..=65535u16) {
        settings.server.port = v;
    }
    if let Some(v) = env.number("WARDEN_IDLE_TIMEOUT", 1..=604_800u64) {
        settings.server.idle_timeout_secs = v;
    }
    if let Some(v) = env.number("WARDEN_SWEEP_INTERVAL", 1..=3600u64) {
        settings.server.sweep_interval_secs = v;
    }
    if let Some(v) = env.number("WARDEN_MAX_MESSAGE_SIZE", 1024..=(1usize << 30)) {
        settings.server.max_message_size = v;
    }
    if let Some(v) = env.string("WARDEN_CLAUDE_BIN") {
        settings.engine.binary = v;
    }
    if let Some(v) = env.string("WARDEN_LOG_LEVEL") {
        settings.logging.level = v;
    }
    if let Some(v) = env.bool("WARDEN_LOG_JSON") {
        settings.logging.json = v;
    }
}

/// `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Parse a trimmed number and keep it only if it lies in `range`.
pub fn parse_in_range<T>(val: &str, range: RangeInclusive<T>) -> Option<T>
where
    T: FromStr + PartialOrd,
{
    val.trim().parse().ok().filter(|n| range.contains(n))
}

// ── Env var readers ─────────────────────────────────────────────────────────

struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn parsed<T>(&self, name: &str, kind: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
        let val = self.string(name)?;
        let result = parse(&val);
        if result.is_none() {
            warn!(key = name, value = %val, kind, "invalid env var, ignoring");
        }
        result
    }

    fn bool(&self, name: &str) -> Option<bool> {
        self.parsed(name, "bool", parse_bool)
    }

    fn number<T>(&self, name: &str, range: RangeInclusive<T>) -> Option<T>
    where
        T: FromStr + PartialOrd,
    {
        self.parsed(name, "number", |v| parse_in_range(v, range))
    }
}

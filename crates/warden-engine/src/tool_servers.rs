//! Per-workspace tool-server configuration (`.mcp.json`).

use std::path::Path;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;
use tracing::{debug, error, info};

use warden_core::{ToolServerSource, ToolServers};

/// Key holding the server table inside the configuration file.
pub const SERVERS_KEY: &str = "mcpServers";

/// `$NAME` or `${NAME}`.
static VAR_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\w+|\{[^}]*\})").expect("valid variable pattern"));

/// Reads `<workspace>/<file_name>` and returns its `mcpServers` table.
#[derive(Clone, Debug)]
pub struct McpConfigLoader {
    file_name: String,
}

impl McpConfigLoader {
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }
}

impl Default for McpConfigLoader {
    fn default() -> Self {
        Self::new(".mcp.json")
    }
}

impl ToolServerSource for McpConfigLoader {
    fn load(&self, workspace: &Path) -> ToolServers {
        let path = workspace.join(&self.file_name);
        if !path.exists() {
            debug!(path = %path.display(), "no tool-server config found");
            return ToolServers::new();
        }

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read tool-server config");
                return ToolServers::new();
            }
        };
        let config: Value = match serde_json::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to parse tool-server config");
                return ToolServers::new();
            }
        };

        let servers = match expand_env_vars(config) {
            Value::Object(mut root) => match root.remove(SERVERS_KEY) {
                Some(Value::Object(servers)) => servers,
                _ => ToolServers::new(),
            },
            _ => ToolServers::new(),
        };
        info!(count = servers.len(), path = %path.display(), "loaded tool servers");
        servers
    }
}

/// Expand `$VAR` / `${VAR}` from the process environment in every string of
/// `value`, recursing through objects and arrays.
pub fn expand_env_vars(value: Value) -> Value {
    expand_value(value, &|name: &str| std::env::var(name).ok())
}

/// [`expand_env_vars`] with an explicit variable lookup.
pub fn expand_value(value: Value, lookup: &dyn Fn(&str) -> Option<String>) -> Value {
    match value {
        Value::String(s) => Value::String(expand_str(&s, lookup)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| expand_value(v, lookup)).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, expand_value(v, lookup)))
                .collect(),
        ),
        other => other,
    }
}

/// Substitute variables in one string. Unset variables stay verbatim.
pub fn expand_str(s: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    if !s.contains('$') {
        return s.to_string();
    }
    VAR_PATTERN
        .replace_all(s, |caps: &Captures<'_>| {
            let raw = &caps[1];
            let name = raw
                .strip_prefix('{')
                .and_then(|r| r.strip_suffix('}'))
                .unwrap_or(raw);
            lookup(name).unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned()
}

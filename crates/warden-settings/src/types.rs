use serde::{Deserialize, Serialize};

/// Top-level settings for the warden process.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WardenSettings {
    pub server: ServerSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Sessions idle longer than this are evicted.
    pub idle_timeout_secs: u64,
    /// How often the idle reaper runs.
    pub sweep_interval_secs: u64,
    /// Largest accepted WebSocket message, in bytes.
    pub max_message_size: usize,
    /// Outbound frames buffered per connection before the query stalls.
    pub max_send_queue: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 31337,
            idle_timeout_secs: 900,
            sweep_interval_secs: 60,
            max_message_size: 16 * 1024 * 1024,
            max_send_queue: 256,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// `claude` executable, resolved through PATH when not absolute.
    pub binary: String,
    /// Appended to every invocation before the prompt.
    pub extra_args: Vec<String>,
    /// Per-workspace tool-server file name.
    pub tool_config_file: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: "claude".into(),
            extra_args: Vec::new(),
            tool_config_file: ".mcp.json".into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_defaults() {
        let s = ServerSettings::default();
        assert_eq!(s.host, "127.0.0.1");
        assert_eq!(s.port, 31337);
        assert_eq!(s.idle_timeout_secs, 900);
        assert_eq!(s.sweep_interval_secs, 60);
        assert_eq!(s.max_message_size, 16 * 1024 * 1024);
    }

    #[test]
    fn engine_defaults() {
        let e = EngineSettings::default();
        assert_eq!(e.binary, "claude");
        assert!(e.extra_args.is_empty());
        assert_eq!(e.tool_config_file, ".mcp.json");
    }

    #[test]
    fn partial_json_fills_defaults() {
        let s: WardenSettings = serde_json::from_str(r#"{"server":{"port":4000}}"#).unwrap();
        assert_eq!(s.server.port, 4000);
        assert_eq!(s.server.host, "127.0.0.1");
        assert_eq!(s.logging.level, "info");
    }

    #[test]
    fn serde_roundtrip() {
        let s = WardenSettings::default();
        let json = serde_json::to_string(&s).unwrap();
        let back: WardenSettings = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}

//! # warden
//!
//! Streaming proxy binary: loads settings, wires the `claude` CLI engine and
//! the `.mcp.json` loader into the server, and runs until interrupted.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::Level;

use warden_engine::{ClaudeCliEngine, McpConfigLoader};
use warden_server::{ServerConfig, WardenServer};
use warden_settings::{SettingsError, WardenSettings};
use warden_telemetry::{init_telemetry, parse_level, TelemetryConfig};

/// Session-addressable streaming proxy for the claude CLI.
#[derive(Parser, Debug)]
#[command(name = "warden", about = "Session-addressable streaming proxy for the claude CLI")]
struct Cli {
    /// Host to bind.
    #[arg(long)]
    host: Option<String>,

    /// Port to bind (0 for auto-assign).
    #[arg(long)]
    port: Option<u16>,

    /// Seconds of inactivity before a session is evicted.
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
    idle_timeout: Option<u64>,

    /// Settings file (defaults to `$WARDEN_CONFIG` or `~/.warden/settings.json`).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to the claude executable.
    #[arg(long)]
    claude_bin: Option<String>,
}

impl Cli {
    fn apply(&self, settings: &mut WardenSettings) {
        if let Some(host) = &self.host {
            settings.server.host = host.clone();
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(secs) = self.idle_timeout {
            settings.server.idle_timeout_secs = secs;
        }
        if let Some(bin) = &self.claude_bin {
            settings.engine.binary = bin.clone();
        }
    }
}

/// Defaults, then file, env and flags. A bad file falls back to defaults
/// plus env and is reported once logging is up.
fn resolve_settings(cli: &Cli) -> (WardenSettings, Option<(PathBuf, SettingsError)>) {
    let loaded = match &cli.config {
        Some(path) => warden_settings::load_settings_from_path(path),
        None => warden_settings::load_settings(),
    };
    let (mut settings, problem) = match loaded {
        Ok(s) => (s, None),
        Err(e) => {
            let path = cli.config.clone().unwrap_or_else(warden_settings::settings_path);
            let mut fallback = WardenSettings::default();
            warden_settings::apply_env_overrides(&mut fallback);
            (fallback, Some((path, e)))
        }
    };
    cli.apply(&mut settings);
    (settings, problem)
}

fn server_config(settings: &WardenSettings) -> ServerConfig {
    let s = &settings.server;
    ServerConfig {
        host: s.host.clone(),
        port: s.port,
        idle_timeout: Duration::from_secs(s.idle_timeout_secs),
        sweep_interval: Duration::from_secs(s.sweep_interval_secs.max(1)),
        max_message_size: s.max_message_size,
        max_send_queue: s.max_send_queue,
        ..ServerConfig::default()
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                let _ = sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (settings, problem) = resolve_settings(&cli);

    let log_level = parse_level(&settings.logging.level).unwrap_or(Level::INFO);
    let telemetry = init_telemetry(&TelemetryConfig {
        log_level,
        json: settings.logging.json,
        ..TelemetryConfig::default()
    });

    if let Some((path, e)) = problem {
        tracing::warn!(path = %path.display(), error = %e, "ignoring settings file, using defaults");
    }

    let engine = Arc::new(
        ClaudeCliEngine::new(settings.engine.binary.clone())
            .with_extra_args(settings.engine.extra_args.clone()),
    );
    let tool_servers = Arc::new(McpConfigLoader::new(settings.engine.tool_config_file.clone()));

    let server = WardenServer::new(server_config(&settings), engine, tool_servers, telemetry.metrics());
    let handle = server.start().await.context("failed to start server")?;

    tracing::info!(addr = %handle.local_addr(), "warden ready");

    shutdown_signal().await;
    let _ = handle.stop().await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_flags_default_to_none() {
        let cli = Cli::parse_from(["warden"]);
        assert!(cli.host.is_none());
        assert!(cli.port.is_none());
        assert!(cli.idle_timeout.is_none());
        assert!(cli.config.is_none());
        assert!(cli.claude_bin.is_none());
    }

    #[test]
    fn cli_flags_override_settings() {
        let cli = Cli::parse_from([
            "warden",
            "--host",
            "0.0.0.0",
            "--port",
            "4000",
            "--idle-timeout",
            "60",
            "--claude-bin",
            "/opt/claude",
        ]);
        let mut settings = WardenSettings::default();
        cli.apply(&mut settings);
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 4000);
        assert_eq!(settings.server.idle_timeout_secs, 60);
        assert_eq!(settings.engine.binary, "/opt/claude");
    }

    #[test]
    fn cli_rejects_zero_idle_timeout() {
        assert!(Cli::try_parse_from(["warden", "--idle-timeout", "0"]).is_err());
    }

    #[test]
    fn server_config_from_settings() {
        let mut settings = WardenSettings::default();
        settings.server.port = 0;
        settings.server.idle_timeout_secs = 30;
        let cfg = server_config(&settings);
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.idle_timeout, Duration::from_secs(30));
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.host, "127.0.0.1");
    }

    #[test]
    fn invalid_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{broken").unwrap();
        let cli = Cli::parse_from(["warden", "--config", path.to_str().unwrap(), "--port", "5000"]);

        let (settings, problem) = resolve_settings(&cli);
        assert!(problem.is_some());
        assert_eq!(settings.server.port, 5000);
        assert_eq!(settings.engine.binary, "claude");
    }

    #[test]
    fn explicit_config_file_is_layered_under_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"server": {"host": "0.0.0.0", "port": 7000}}"#).unwrap();
        let cli = Cli::parse_from(["warden", "--config", path.to_str().unwrap(), "--port", "7001"]);

        let (settings, problem) = resolve_settings(&cli);
        assert!(problem.is_none());
        assert_eq!(settings.server.host, "0.0.0.0");
        assert_eq!(settings.server.port, 7001);
    }
}

//! Layered configuration for warden: compiled defaults, an optional JSON
//! file and `WARDEN_*` environment overrides.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_file, load_settings,
    load_settings_from_path, settings_path,
};
pub use types::{EngineSettings, LoggingSettings, ServerSettings, WardenSettings};

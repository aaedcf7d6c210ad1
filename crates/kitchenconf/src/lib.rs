//! Minimal configuration loading for KitchenSync.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every KitchenSync crate.
//!
//! # Configuration Philosophy
//!
//! Configuration is split into two categories:
//!
//! - **Infrastructure** (`InfraConfig`): node identity, sockets, the schedule
//!   source and output adapters.
//!
//! - **Tuning** (`SyncTuning`): thresholds and intervals of the sync engine.
//!   Validated once at load and immutable for the life of a session.
//!
//! # Usage
//!
//! ```rust,no_run
//! use kitchenconf::KitchenConfig;
//!
//! let config = KitchenConfig::load().expect("Failed to load config");
//!
//! println!("Sync port: {}", config.infra.bind.sync_port);
//! println!("Correction threshold: {}s", config.sync.correction_threshold);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/kitchensync/config.toml` (system)
//! 2. `~/.config/kitchensync/config.toml` (user)
//! 3. `./kitchensync.toml` (local override) or the `--config` path
//! 4. Environment variables (`KITCHENSYNC_*`)
//!
//! # Example Config
//!
//! ```toml
//! [node]
//! node_id = "pi-kitchen-1"
//! role = "leader"
//!
//! [bind]
//! broadcast_addr = "192.168.1.255"
//! sync_port = 5005
//!
//! [sync]
//! correction_threshold = 0.5
//! pause_threshold = 2.0
//! loop_epsilon = 2.5
//!
//! [schedule]
//! file = "~/show/schedule.json"
//!
//! [output]
//! kind = "serial"
//! device = "/dev/ttyACM0"
//! ```

pub mod infra;
pub mod loader;
pub mod tuning;

pub use infra::{
    BindConfig, InfraConfig, NodeConfig, NodeRole, OutputConfig, OutputKind, PlaybackConfig,
    ScheduleConfig, TelemetryConfig,
};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use tuning::SyncTuning;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Schema(String),

    #[error("Invalid value for {name}: '{value}'")]
    Env { name: String, value: String },

    #[error("Invalid sync tuning: {0}")]
    InvalidTuning(String),

    #[error("loop_epsilon ({loop_epsilon}) must be greater than pause_threshold ({pause_threshold}) or corrections will read as loop restarts")]
    LoopEpsilonTooSmall {
        loop_epsilon: f64,
        pause_threshold: f64,
    },
}

/// Complete KitchenSync configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct KitchenConfig {
    /// Infrastructure sections, flattened to top-level tables.
    #[serde(flatten)]
    pub infra: InfraConfig,

    /// Engine tuning - `[sync]`.
    #[serde(default)]
    pub sync: SyncTuning,
}

impl KitchenConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/kitchensync/config.toml`
    /// 3. `~/.config/kitchensync/config.toml`
    /// 4. `./kitchensync.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./kitchensync.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    ///
    /// The result is validated; see [`KitchenConfig::validate`].
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::load_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let mut config = loader::from_table(merged)?;
        loader::apply_env_overrides(&mut config, &mut sources)?;
        config.validate()?;

        Ok((config, sources))
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.infra.node.node_id.trim().is_empty() {
            return Err(ConfigError::Schema("node.node_id must not be empty".to_string()));
        }
        if self.infra.playback.duration_seconds.is_nan() || self.infra.playback.duration_seconds <= 0.0 {
            return Err(ConfigError::Schema(format!(
                "playback.duration_seconds must be positive, got {}",
                self.infra.playback.duration_seconds
            )));
        }
        if self.infra.output.kind == OutputKind::Serial && self.infra.output.device.is_none() {
            return Err(ConfigError::Schema(
                "output.kind = \"serial\" requires output.device".to_string(),
            ));
        }
        self.sync.validate()
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let body = toml::to_string_pretty(self)
            .unwrap_or_else(|e| format!("# failed to render configuration: {}\n", e));
        format!("# KitchenSync Configuration\n\n{}", body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = KitchenConfig::default();
        assert_eq!(config.infra.bind.sync_port, 5005);
        assert_eq!(config.infra.node.role, NodeRole::Follower);
        config.validate().unwrap();
    }

    #[test]
    fn test_to_toml() {
        let config = KitchenConfig::default();
        let toml = config.to_toml();
        assert!(toml.contains("[node]"));
        assert!(toml.contains("[bind]"));
        assert!(toml.contains("[sync]"));
        assert!(toml.contains("loop_epsilon"));
    }

    #[test]
    fn test_to_toml_reloads() {
        let mut config = KitchenConfig::default();
        config.infra.node.node_id = "pi-3".to_string();
        config.sync.window_size = 12;
        let table: toml::Table = config.to_toml().parse().unwrap();
        let reloaded = loader::from_table(table).unwrap();
        assert_eq!(reloaded.infra.node.node_id, "pi-3");
        assert_eq!(reloaded.sync.window_size, 12);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[node]\nnode_id = \"pi-9\"\n\n[sync]\ncorrection_threshold = 0.3").unwrap();

        let (config, sources) = KitchenConfig::load_with_sources_from(Some(file.path())).unwrap();
        assert_eq!(config.infra.node.node_id, "pi-9");
        assert_eq!(config.sync.correction_threshold, 0.3);
        assert!(sources.files.contains(&file.path().to_path_buf()));
    }

    #[test]
    fn test_load_rejects_bad_epsilon() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[sync]\npause_threshold = 3.0\nloop_epsilon = 2.0").unwrap();

        let err = KitchenConfig::load_from(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::LoopEpsilonTooSmall { .. }));
    }

    #[test]
    fn test_missing_cli_file_is_error() {
        let err = KitchenConfig::load_from(Some(std::path::Path::new("/nonexistent/ks.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_serial_requires_device() {
        let mut config = KitchenConfig::default();
        config.infra.output.kind = OutputKind::Serial;
        assert!(config.validate().is_err());
    }
}

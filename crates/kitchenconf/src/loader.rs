//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, KitchenConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override. A CLI path that
/// does not exist is still returned so loading reports it.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/kitchensync/config.toml");
    if system.exists() {
        files.push(system);
    }

    // User config (XDG_CONFIG_HOME or ~/.config)
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("kitchensync/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("kitchensync.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Merge `overlay` into `base`. Nested tables merge key by key; any other
/// value in `overlay` replaces the one in `base`.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Deserialize a merged table; missing fields take compiled defaults.
pub fn from_table(table: toml::Table) -> Result<KitchenConfig, ConfigError> {
    let mut config: KitchenConfig = toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Schema(e.to_string()))?;

    if let Some(file) = config.infra.schedule.file.take() {
        config.infra.schedule.file = Some(expand_path(&file.to_string_lossy()));
    }
    if let Some(device) = config.infra.output.device.take() {
        config.infra.output.device = Some(expand_path(&device.to_string_lossy()));
    }

    Ok(config)
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(
    config: &mut KitchenConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    apply_env_overrides_from(config, sources, |key| env::var(key).ok())
}

/// Apply overrides read through `lookup` instead of the process environment.
pub fn apply_env_overrides_from<F>(
    config: &mut KitchenConfig,
    sources: &mut ConfigSources,
    lookup: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(name: &str, value: String) -> Result<T, ConfigError> {
        value.trim().parse().map_err(|_| ConfigError::Env {
            name: name.to_string(),
            value,
        })
    }

    if let Some(v) = lookup("KITCHENSYNC_NODE_ID") {
        config.infra.node.node_id = v;
        sources.env_overrides.push("KITCHENSYNC_NODE_ID".to_string());
    }
    if let Some(v) = lookup("KITCHENSYNC_ROLE") {
        config.infra.node.role = parsed("KITCHENSYNC_ROLE", v)?;
        sources.env_overrides.push("KITCHENSYNC_ROLE".to_string());
    }

    if let Some(v) = lookup("KITCHENSYNC_BIND_ADDR") {
        config.infra.bind.bind_addr = parsed("KITCHENSYNC_BIND_ADDR", v)?;
        sources.env_overrides.push("KITCHENSYNC_BIND_ADDR".to_string());
    }
    if let Some(v) = lookup("KITCHENSYNC_BROADCAST_ADDR") {
        config.infra.bind.broadcast_addr = parsed("KITCHENSYNC_BROADCAST_ADDR", v)?;
        sources.env_overrides.push("KITCHENSYNC_BROADCAST_ADDR".to_string());
    }
    if let Some(v) = lookup("KITCHENSYNC_SYNC_PORT") {
        config.infra.bind.sync_port = parsed("KITCHENSYNC_SYNC_PORT", v)?;
        sources.env_overrides.push("KITCHENSYNC_SYNC_PORT".to_string());
    }
    if let Some(v) = lookup("KITCHENSYNC_LEADER_CONTROL_PORT") {
        config.infra.bind.leader_control_port = parsed("KITCHENSYNC_LEADER_CONTROL_PORT", v)?;
        sources.env_overrides.push("KITCHENSYNC_LEADER_CONTROL_PORT".to_string());
    }
    if let Some(v) = lookup("KITCHENSYNC_FOLLOWER_CONTROL_PORT") {
        config.infra.bind.follower_control_port = parsed("KITCHENSYNC_FOLLOWER_CONTROL_PORT", v)?;
        sources.env_overrides.push("KITCHENSYNC_FOLLOWER_CONTROL_PORT".to_string());
    }

    if let Some(v) = lookup("KITCHENSYNC_SCHEDULE") {
        config.infra.schedule.file = Some(expand_path(&v));
        sources.env_overrides.push("KITCHENSYNC_SCHEDULE".to_string());
    }

    if let Some(v) = lookup("KITCHENSYNC_LOG_LEVEL") {
        config.infra.telemetry.log_level = v;
        sources.env_overrides.push("KITCHENSYNC_LOG_LEVEL".to_string());
    }

    Ok(())
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

//! Configuration loading from `~/.netron/config.toml` with defaults.

use netron_types::config::NetronConfig;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load runtime configuration from a TOML file, with defaults.
///
/// A missing file yields the defaults silently; an unreadable or invalid
/// file is logged and also yields the defaults.
pub fn load_config(path: Option<&Path>) -> NetronConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    if !config_path.exists() {
        info!(
            path = %config_path.display(),
            "Config file not found, using defaults"
        );
        return NetronConfig::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(contents) => match NetronConfig::from_toml(&contents) {
            Ok(config) => {
                info!(path = %config_path.display(), "Loaded configuration");
                config
            }
            Err(e) => {
                warn!(
                    error = %e,
                    path = %config_path.display(),
                    "Failed to parse config, using defaults"
                );
                NetronConfig::default()
            }
        },
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to read config file, using defaults"
            );
            NetronConfig::default()
        }
    }
}

/// Get the Netron home directory.
pub fn netron_home() -> PathBuf {
    if let Ok(home) = std::env::var("NETRON_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".netron")
}

/// Get the default config file path.
pub fn default_config_path() -> PathBuf {
    netron_home().join("config.toml")
}

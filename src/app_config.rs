//! Module for application configuration settings.
//!
//! User configurations may be specified in a configuration file. Without one,
//! every mount setting takes its default.

use std::path::{Path, PathBuf};

use dav_fs::MountConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Application configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub mount: MountConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        self.mount.validate()
    }

    /// Returns config file paths in descending priority order.
    /// On macOS, skips `dirs::config_dir()` (resolves to ~/Library/Application Support/).
    fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        #[cfg(not(target_os = "macos"))]
        if let Some(xdg) = dirs::config_dir() {
            paths.push(xdg.join("dav-fs").join("config.toml"));
        }

        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".config").join("dav-fs").join("config.toml"));
        }

        paths.push(PathBuf::from("/etc/dav-fs/config.toml"));

        paths
    }

    fn find_config_file() -> Option<PathBuf> {
        Self::config_search_paths().into_iter().find(|p| p.exists())
    }

    fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Loads the external path if given, else the first config file found,
    /// else the defaults. Errors if a config file exists but is malformed.
    pub fn load(external_config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let found = match external_config_path {
            Some(path) => Some(path.to_path_buf()),
            None => Self::find_config_file(),
        };
        let config = match found {
            Some(path) => Self::load_from_file(&path)?,
            None => {
                debug!("No configuration file found, using defaults.");
                Self::default()
            }
        };
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }
}

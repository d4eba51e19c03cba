//! Application configuration.
//!
//! Values are layered: compiled defaults, then the JSON file under the user's
//! config directory, then `VPNSHOP_*` environment variables.

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

/// Directory name used under the platform config and data directories.
pub const APP_DIR: &str = "vpnshop";
/// File name of the configuration file.
pub const CONFIG_FILE: &str = "config.json";
/// Prefix of environment overrides, e.g. `VPNSHOP_FRESHNESS_SECS=5`.
pub const ENV_PREFIX: &str = "VPNSHOP";

/// Errors raised while loading or writing configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Sources could not be merged or deserialised.
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    /// The configuration file could not be written.
    #[error("failed to write {path}: {source}")]
    Write {
        /// Target file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Defaults could not be serialised.
    #[error("failed to encode configuration: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Runtime settings for the shop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Snapshot holding the root document.
    pub data_file: PathBuf,
    /// Snapshot holding the per-location network ranges.
    pub ranges_file: PathBuf,
    /// Seconds a cached document is served without re-reading.
    pub freshness_secs: u64,
    /// Directory receiving log files.
    pub log_dir: PathBuf,
    /// Admin ids seeded into a freshly created document.
    #[serde(default)]
    pub admins: Vec<i64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR);
        Self {
            data_file: data_dir.join("bot_data.json"),
            ranges_file: data_dir.join("dns_ranges.json"),
            freshness_secs: 30,
            log_dir: data_dir.join("logs"),
            admins: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Default location of the configuration file.
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join(CONFIG_FILE)
    }

    /// Load configuration from the default location.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration using `path` as the file layer. A missing file is
    /// not an error.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let settings = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path).format(FileFormat::Json).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("admins"),
            )
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Freshness window as a duration.
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

/// Write the default configuration file if none exists yet.
pub fn ensure_default_config() -> Result<PathBuf, ConfigError> {
    let path = AppConfig::config_path();
    ensure_default_config_at(&path)?;
    Ok(path)
}

/// Write the default configuration to `path` unless it already exists.
pub fn ensure_default_config_at(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    let serialised = serde_json::to_string_pretty(&AppConfig::default())?;
    fs::write(path, serialised).map_err(|source| ConfigError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    info!(path = %path.display(), "wrote default configuration");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_file_yields_defaults() -> Result<()> {
        let dir = tempdir()?;
        let config = AppConfig::load_from(&dir.path().join("absent.json"))?;
        assert_eq!(config.freshness(), Duration::from_secs(30));
        assert_eq!(config.data_file, AppConfig::default().data_file);
        Ok(())
    }

    #[test]
    fn file_overrides_defaults() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join(CONFIG_FILE);
        fs::write(
            &path,
            serde_json::to_vec(&json!({
                "data_file": "/srv/shop/data.json",
                "freshness_secs": 5,
                "admins": [1, 2]
            }))?,
        )?;

        let config = AppConfig::load_from(&path)?;
        assert_eq!(config.data_file, PathBuf::from("/srv/shop/data.json"));
        assert_eq!(config.freshness_secs, 5);
        assert_eq!(config.admins, vec![1, 2]);
        assert_eq!(config.ranges_file, AppConfig::default().ranges_file);
        Ok(())
    }

    #[test]
    fn default_file_is_written_once() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join(CONFIG_FILE);
        ensure_default_config_at(&path)?;
        let written: AppConfig = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert_eq!(written, AppConfig::default());

        fs::write(&path, "{\"freshness_secs\": 1}")?;
        ensure_default_config_at(&path)?;
        assert_eq!(fs::read_to_string(&path)?, "{\"freshness_secs\": 1}");
        Ok(())
    }
}

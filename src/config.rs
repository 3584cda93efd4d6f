//! Application configuration, `~/.config/toybridge/config.toml`.
//!
//! Every table is optional; missing keys fall back to their defaults. The
//! file is written with defaults on first start so users have something to
//! edit.

use crate::device::SessionSettings;
use crate::link::{BackoffSettings, LinkSettings};
use crate::motion::EngineSettings;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = ".config/toybridge";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// File name of the tuning store inside the config directory
    pub tuning_file: String,
    /// Quiet time after the last tuning change before it is written
    pub debounce_ms: u64,
    /// Periodic retry for changes that failed to save
    pub autosave_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            tuning_file: "tuning.toml".to_string(),
            debounce_ms: 1000,
            autosave_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub links: LinkSettings,
    pub backoff: BackoffSettings,
    pub engine: EngineSettings,
    pub session: SessionSettings,
    pub persistence: PersistenceSettings,
}

pub fn get_home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    })
}

pub fn config_dir() -> PathBuf {
    get_home_dir().join(CONFIG_DIR)
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        config_dir().join(CONFIG_FILE)
    }

    /// Reads the config file, creating it with defaults when absent.
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;

        if !exists {
            info!("No config at {}, writing defaults", path.display());
            let config = AppConfig::default();
            config.save(path).await?;
            return Ok(config);
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))?;
        Ok(())
    }

    pub fn tuning_path(&self, dir: &Path) -> PathBuf {
        dir.join(&self.persistence.tuning_file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(
            &path,
            "[links]\ngame_url = \"ws://10.0.0.5:11451/ws\"\n\n[backoff]\nmax_ms = 5000\n",
        )
        .await
        .unwrap();

        let config = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config.links.game_url, "ws://10.0.0.5:11451/ws");
        assert_eq!(config.links.device_url, LinkSettings::default().device_url);
        assert_eq!(config.backoff.max_ms, 5000);
        assert_eq!(config.backoff.initial_ms, 1000);
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[tokio::test]
    async fn test_broken_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        tokio::fs::write(&path, "[links\n").await.unwrap();
        assert!(AppConfig::load_or_create(&path).await.is_err());
    }
}

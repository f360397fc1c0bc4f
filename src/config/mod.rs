//! Configuration management for Shipyard

pub mod schema;

pub use schema::Config;

use crate::error::{ShipyardError, ShipyardResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shipyard")
            .join("config.toml")
    }

    /// Get the default state directory path
    pub fn default_state_dir() -> PathBuf {
        dirs::state_dir()
            .or_else(dirs::data_local_dir)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shipyard")
    }

    /// Load configuration, creating default if not exists
    pub async fn load(&self) -> ShipyardResult<Config> {
        if !self.config_path.exists() {
            debug!("Config file not found, using defaults");
            return Ok(Config::default());
        }

        self.load_from_file(&self.config_path).await
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> ShipyardResult<Config> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| ShipyardError::io(format!("reading config from {}", path.display()), e))?;

        toml::from_str(&content).map_err(|e| ShipyardError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> ShipyardResult<()> {
        self.ensure_config_dir().await?;

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            ShipyardError::io(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Ensure the config directory exists
    async fn ensure_config_dir(&self) -> ShipyardResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ShipyardError::ConfigDirCreate {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk layout of the state directory
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    /// Layout rooted at an explicit directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Layout from config, falling back to the platform state directory
    pub fn from_config(config: &Config) -> Self {
        let root = config
            .general
            .state_dir
            .clone()
            .unwrap_or_else(ConfigManager::default_state_dir);
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// App records, one JSON file per app
    pub fn apps_dir(&self) -> PathBuf {
        self.root.join("apps")
    }

    /// Release history and formations per app id
    pub fn releases_dir(&self) -> PathBuf {
        self.root.join("releases")
    }

    /// Build cache entries per app id
    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    /// Content-addressed artifact store
    pub fn artifacts_dir(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    /// Scratch space for builds
    pub fn builds_dir(&self) -> PathBuf {
        self.root.join("builds")
    }

    /// Working directories of running jobs
    pub fn jobs_dir(&self) -> PathBuf {
        self.root.join("jobs")
    }

    /// Get the audit log path
    pub fn audit_log_path(&self) -> PathBuf {
        self.root.join("audit.log")
    }

    /// Ensure all state directories exist
    pub async fn ensure(&self) -> ShipyardResult<()> {
        let dirs = [
            self.root.clone(),
            self.apps_dir(),
            self.releases_dir(),
            self.cache_dir(),
            self.artifacts_dir(),
            self.builds_dir(),
            self.jobs_dir(),
        ];

        for dir in &dirs {
            fs::create_dir_all(dir).await.map_err(|e| {
                ShipyardError::io(format!("creating directory {}", dir.display()), e)
            })?;
        }

        Ok(())
    }
}

/// Write JSON atomically: temp file in the same directory, then rename
pub(crate) async fn write_json_atomic<T: serde::Serialize>(
    path: &Path,
    value: &T,
) -> ShipyardResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| ShipyardError::io(format!("creating {}", parent.display()), e))?;
    }

    let content = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
    fs::write(&tmp, content)
        .await
        .map_err(|e| ShipyardError::io(format!("writing {}", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .await
        .map_err(|e| ShipyardError::io(format!("renaming into {}", path.display()), e))?;
    Ok(())
}

/// Read a JSON file, returning `None` when it does not exist
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> ShipyardResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)
        .await
        .map_err(|e| ShipyardError::io(format!("reading {}", path.display()), e))?;
    Ok(Some(serde_json::from_str(&content)?))
}

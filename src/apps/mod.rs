//! App records and their lifecycle
//!
//! Each create mints a fresh id. Caches, releases and event channels are
//! keyed by id, so deleting and recreating an app under the same name
//! starts from a clean namespace.

use crate::config::{read_json, write_json_atomic};
use crate::error::{ShipyardError, ShipyardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use tokio::fs;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

/// A deployable application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct App {
    /// Unique per creation
    pub id: Uuid,

    /// Human-readable name, unique among live apps
    pub name: String,

    /// Environment variables applied to builds and jobs
    pub env: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            env: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Validate an app name: lowercase letters, digits and dashes
pub fn validate_name(name: &str) -> ShipyardResult<()> {
    let invalid = |reason: &str| ShipyardError::InvalidAppName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() || name.len() > 63 {
        return Err(invalid("must be 1-63 characters"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(invalid("only lowercase letters, digits and dashes are allowed"));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(invalid("cannot start or end with a dash"));
    }
    Ok(())
}

/// Registry of live apps, optionally persisted as `<name>.json`
pub struct AppRegistry {
    dir: Option<PathBuf>,
    apps: RwLock<HashMap<String, App>>,
}

impl AppRegistry {
    /// Registry without persistence
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            apps: RwLock::new(HashMap::new()),
        }
    }

    /// Open a persisted registry, loading existing records
    pub async fn open(dir: PathBuf) -> ShipyardResult<Self> {
        let mut apps = HashMap::new();

        if dir.exists() {
            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| ShipyardError::io("reading apps directory", e))?;

            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| ShipyardError::io("reading app entry", e))?
            {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    if let Some(app) = read_json::<App>(&path).await? {
                        apps.insert(app.name.clone(), app);
                    }
                }
            }
        }

        debug!("Loaded {} apps from {}", apps.len(), dir.display());
        Ok(Self {
            dir: Some(dir),
            apps: RwLock::new(apps),
        })
    }

    fn file_path(&self, name: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", name)))
    }

    async fn save(&self, app: &App) -> ShipyardResult<()> {
        if let Some(path) = self.file_path(&app.name) {
            write_json_atomic(&path, app).await?;
        }
        Ok(())
    }

    /// Create a new app
    pub async fn create(&self, name: &str) -> ShipyardResult<App> {
        validate_name(name)?;

        let mut apps = self.apps.write().await;
        if apps.contains_key(name) {
            return Err(ShipyardError::AppExists(name.to_string()));
        }

        let app = App::new(name);
        self.save(&app).await?;
        apps.insert(name.to_string(), app.clone());

        info!("Created app {} ({})", app.name, app.id);
        Ok(app)
    }

    /// Get an app by name
    pub async fn get(&self, name: &str) -> ShipyardResult<App> {
        self.apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| ShipyardError::AppNotFound(name.to_string()))
    }

    /// All apps sorted by name
    pub async fn list(&self) -> Vec<App> {
        let mut apps: Vec<App> = self.apps.read().await.values().cloned().collect();
        apps.sort_by(|a, b| a.name.cmp(&b.name));
        apps
    }

    /// Set environment variables
    pub async fn set_env(
        &self,
        name: &str,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> ShipyardResult<App> {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ShipyardError::AppNotFound(name.to_string()))?;

        let mut updated = app.clone();
        updated.env.extend(vars);
        updated.updated_at = Utc::now();
        self.save(&updated).await?;
        *app = updated.clone();

        debug!("Updated env for app {}", name);
        Ok(updated)
    }

    /// Remove environment variables
    pub async fn unset_env(&self, name: &str, keys: &[String]) -> ShipyardResult<App> {
        let mut apps = self.apps.write().await;
        let app = apps
            .get_mut(name)
            .ok_or_else(|| ShipyardError::AppNotFound(name.to_string()))?;

        let mut updated = app.clone();
        for key in keys {
            updated.env.remove(key);
        }
        updated.updated_at = Utc::now();
        self.save(&updated).await?;
        *app = updated.clone();

        Ok(updated)
    }

    /// Delete an app record
    pub async fn delete(&self, name: &str) -> ShipyardResult<App> {
        let mut apps = self.apps.write().await;
        let app = apps
            .remove(name)
            .ok_or_else(|| ShipyardError::AppNotFound(name.to_string()))?;

        if let Some(path) = self.file_path(name) {
            if path.exists() {
                fs::remove_file(&path).await.map_err(|e| {
                    ShipyardError::io(format!("deleting app file {}", path.display()), e)
                })?;
            }
        }

        info!("Deleted app {} ({})", app.name, app.id);
        Ok(app)
    }
}

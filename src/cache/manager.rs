//! Build cache entries and hit accounting
//!
//! One entry per (app, buildpack). The entry remembers the manifest
//! fingerprint it was built from; a build with the same fingerprint reuses
//! the stored layers, any other fingerprint rebuilds and overwrites.

use crate::artifact::{ArtifactRef, ArtifactStore};
use crate::cache::manifest::Fingerprint;
use crate::config::{read_json, write_json_atomic};
use crate::error::{ShipyardError, ShipyardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Identity of a cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub app_id: Uuid,
    pub buildpack: String,
    pub fingerprint: String,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.app_id, self.buildpack, self.fingerprint)
    }
}

/// Stored cache layers for one key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    /// Full fingerprint digest the layers were built from
    pub digest: String,
    /// Packed cache directory in the artifact store
    pub layers: ArtifactRef,
    pub created_at: DateTime<Utc>,
    pub refreshed_at: DateTime<Utc>,
}

/// Why a lookup did not reuse layers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MissReason {
    /// Caching turned off in config
    Disabled,
    /// First build for this app and buildpack
    NoEntry,
    /// Dependency manifests changed since the last build
    FingerprintChanged,
    /// Stored layers unreadable or key collision
    Corrupt(String),
}

impl fmt::Display for MissReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disabled => write!(f, "build cache disabled"),
            Self::NoEntry => write!(f, "no previous build layers"),
            Self::FingerprintChanged => write!(f, "dependency manifests changed"),
            Self::Corrupt(reason) => write!(f, "stored build layers unusable ({})", reason),
        }
    }
}

/// Outcome of a cache lookup
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    Hit {
        layers: ArtifactRef,
        /// Packed layer contents, already verified
        contents: Vec<u8>,
        /// Hits recorded for the app before this build
        hits: u64,
    },
    Miss(MissReason),
}

/// Result of [`BuildCacheManager::resolve`]
#[derive(Debug, Clone)]
pub struct CacheResolution {
    pub key: CacheKey,
    pub fingerprint: Fingerprint,
    pub outcome: CacheOutcome,
}

impl CacheResolution {
    pub fn is_hit(&self) -> bool {
        matches!(self.outcome, CacheOutcome::Hit { .. })
    }

    /// Transcript line for this lookup
    ///
    /// Only hits mention "cached"; pushers grep for it.
    pub fn summary(&self) -> String {
        match &self.outcome {
            CacheOutcome::Hit { hits, .. } => {
                format!("Restoring build layers (cached: {})", hits)
            }
            CacheOutcome::Miss(reason) => format!("Fresh build: {}", reason),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppCache {
    hits: u64,
    entries: HashMap<String, CacheEntry>,
}

type Slot = Arc<tokio::sync::Mutex<Option<AppCache>>>;

/// Decides cache reuse and tracks per-app hit counters
pub struct BuildCacheManager {
    store: Arc<dyn ArtifactStore>,
    dir: Option<PathBuf>,
    enabled: bool,
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl BuildCacheManager {
    /// Create a manager; `dir` persists entries as `<app-id>.json`
    pub fn new(store: Arc<dyn ArtifactStore>, dir: Option<PathBuf>, enabled: bool) -> Self {
        Self {
            store,
            dir,
            enabled,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, app_id: Uuid) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            slots
                .entry(app_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None))),
        )
    }

    fn file_path(&self, app_id: Uuid) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", app_id)))
    }

    async fn load(&self, app_id: Uuid, cache: &mut Option<AppCache>) -> ShipyardResult<()> {
        if cache.is_some() {
            return Ok(());
        }
        let loaded = match self.file_path(app_id) {
            Some(path) => read_json(&path).await?,
            None => None,
        };
        *cache = Some(loaded.unwrap_or_default());
        Ok(())
    }

    async fn persist(&self, app_id: Uuid, cache: &AppCache) -> ShipyardResult<()> {
        if let Some(path) = self.file_path(app_id) {
            write_json_atomic(&path, cache).await?;
        }
        Ok(())
    }

    /// Look up reusable layers for a build
    pub async fn resolve(
        &self,
        app_id: Uuid,
        buildpack: &str,
        fingerprint: &Fingerprint,
    ) -> ShipyardResult<CacheResolution> {
        let key = CacheKey {
            app_id,
            buildpack: buildpack.to_string(),
            fingerprint: fingerprint.short.clone(),
        };

        if !self.enabled {
            return Ok(CacheResolution {
                key,
                fingerprint: fingerprint.clone(),
                outcome: CacheOutcome::Miss(MissReason::Disabled),
            });
        }

        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        let cache = guard.get_or_insert_with(AppCache::default);

        let outcome = match cache.entries.get(buildpack) {
            None => CacheOutcome::Miss(MissReason::NoEntry),
            Some(entry) if entry.key.fingerprint != fingerprint.short => {
                CacheOutcome::Miss(MissReason::FingerprintChanged)
            }
            Some(entry) => match self.check_entry(entry, fingerprint).await {
                Ok(contents) => CacheOutcome::Hit {
                    layers: entry.layers.clone(),
                    contents,
                    hits: cache.hits,
                },
                Err(e) => {
                    warn!("Cache entry {} unusable, rebuilding: {}", key, e);
                    CacheOutcome::Miss(MissReason::Corrupt(e.to_string()))
                }
            },
        };

        debug!("Cache lookup {}: hit={}", key, matches!(outcome, CacheOutcome::Hit { .. }));
        Ok(CacheResolution {
            key,
            fingerprint: fingerprint.clone(),
            outcome,
        })
    }

    async fn check_entry(
        &self,
        entry: &CacheEntry,
        fingerprint: &Fingerprint,
    ) -> ShipyardResult<Vec<u8>> {
        if entry.digest != fingerprint.digest {
            return Err(ShipyardError::CacheCorruption {
                key: entry.key.to_string(),
                reason: "fingerprint collision".to_string(),
            });
        }
        self.store
            .get(&entry.layers)
            .await
            .map_err(|e| ShipyardError::CacheCorruption {
                key: entry.key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Store layers produced by a completed build
    ///
    /// Always overwrites the entry, hit or miss, so layers refresh
    /// incrementally. A hit bumps the app's counter.
    pub async fn commit(
        &self,
        resolution: &CacheResolution,
        layers: Vec<u8>,
    ) -> ShipyardResult<Option<CacheEntry>> {
        if !self.enabled {
            return Ok(None);
        }

        let app_id = resolution.key.app_id;
        let layers = self.store.put(layers).await?;

        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        let cache = guard.get_or_insert_with(AppCache::default);

        let now = Utc::now();
        let created_at = cache
            .entries
            .get(&resolution.key.buildpack)
            .filter(|e| e.key == resolution.key)
            .map(|e| e.created_at)
            .unwrap_or(now);

        let entry = CacheEntry {
            key: resolution.key.clone(),
            digest: resolution.fingerprint.digest.clone(),
            layers,
            created_at,
            refreshed_at: now,
        };
        cache
            .entries
            .insert(resolution.key.buildpack.clone(), entry.clone());
        if resolution.is_hit() {
            cache.hits += 1;
        }

        self.persist(app_id, cache).await?;
        debug!("Committed cache entry {} (hits={})", entry.key, cache.hits);
        Ok(Some(entry))
    }

    /// Current hit counter for an app
    pub async fn hits(&self, app_id: Uuid) -> ShipyardResult<u64> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        Ok(guard.as_ref().map(|c| c.hits).unwrap_or(0))
    }

    /// Stored entry for an app and buildpack
    pub async fn entry(&self, app_id: Uuid, buildpack: &str) -> ShipyardResult<Option<CacheEntry>> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        Ok(guard
            .as_ref()
            .and_then(|c| c.entries.get(buildpack).cloned()))
    }

    /// Drop every entry and the hit counter of an app
    pub async fn clear(&self, app_id: Uuid) -> ShipyardResult<()> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        *guard = Some(AppCache::default());

        if let Some(path) = self.file_path(app_id) {
            if path.exists() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| ShipyardError::io(format!("removing {}", path.display()), e))?;
            }
        }
        drop(guard);

        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.remove(&app_id);
        info!("Cleared build cache for app {}", app_id);
        Ok(())
    }
}

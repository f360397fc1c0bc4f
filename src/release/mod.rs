//! Releases and formations
//!
//! A release is an immutable snapshot of slug, environment and declared
//! process types. Each app has an append-only release history plus one
//! current formation. Scaling edits the formation in place and never
//! creates a release.

use crate::apps::App;
use crate::artifact::ArtifactRef;
use crate::build::ProcessTypes;
use crate::config::{read_json, write_json_atomic};
use crate::error::{ShipyardError, ShipyardResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};
use uuid::Uuid;

/// Process type assigned on an app's first release when it declares `web`
pub const DEFAULT_PROCESS_TYPE: &str = "web";

/// Desired instance count per process type
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Formation(BTreeMap<String, u32>);

impl Formation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `type=count` assignments
    pub fn parse<'a>(assignments: impl IntoIterator<Item = &'a str>) -> ShipyardResult<Self> {
        let mut formation = Self::new();
        for assignment in assignments {
            let (process_type, count) = assignment.split_once('=').ok_or_else(|| {
                ShipyardError::InvalidFormation(format!(
                    "{:?}: expected TYPE=COUNT",
                    assignment
                ))
            })?;
            let process_type = process_type.trim();
            if process_type.is_empty() {
                return Err(ShipyardError::InvalidFormation(format!(
                    "{:?}: missing process type",
                    assignment
                )));
            }
            let count: u32 = count.trim().parse().map_err(|_| {
                ShipyardError::InvalidFormation(format!(
                    "{:?}: count must be a non-negative integer",
                    assignment
                ))
            })?;
            formation.set(process_type, count);
        }
        Ok(formation)
    }

    pub fn get(&self, process_type: &str) -> u32 {
        self.0.get(process_type).copied().unwrap_or(0)
    }

    pub fn set(&mut self, process_type: impl Into<String>, count: u32) {
        self.0.insert(process_type.into(), count);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn process_types(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Total desired instances
    pub fn total(&self) -> u32 {
        self.0.values().sum()
    }

    /// Drop process types the release does not declare
    fn retain_declared(&mut self, processes: &ProcessTypes) {
        self.0.retain(|process_type, _| processes.contains_key(process_type));
    }

    /// Reject process types the release does not declare
    fn check_declared(&self, processes: &ProcessTypes) -> ShipyardResult<()> {
        let unknown: Vec<&str> = self
            .process_types()
            .filter(|t| !processes.contains_key(*t))
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(ShipyardError::InvalidFormation(format!(
                "unknown process type(s): {}",
                unknown.join(", ")
            )))
        }
    }
}

impl fmt::Display for Formation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "(none)");
        }
        let parts: Vec<String> = self.iter().map(|(t, n)| format!("{}={}", t, n)).collect();
        write!(f, "{}", parts.join(" "))
    }
}

/// Immutable release record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: Uuid,
    pub app_id: Uuid,
    /// 1-based, increasing per app
    pub version: u32,
    pub artifact: ArtifactRef,
    pub buildpack: String,
    pub env: BTreeMap<String, String>,
    pub processes: ProcessTypes,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Command for a declared process type
    pub fn command(&self, process_type: &str) -> Option<&str> {
        self.processes.get(process_type).map(String::as_str)
    }
}

/// A release ready to publish, with the formation it will run under
#[derive(Debug, Clone)]
pub struct ReleasePlan {
    pub release: Release,
    pub formation: Formation,
    /// Whether the default `web=1` was assigned
    pub default_formation_added: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AppReleases {
    releases: Vec<Release>,
    formation: Formation,
}

type Slot = Arc<tokio::sync::Mutex<Option<AppReleases>>>;

/// Owns release history and desired formations
pub struct ReleaseManager {
    dir: Option<PathBuf>,
    slots: Mutex<HashMap<Uuid, Slot>>,
}

impl ReleaseManager {
    /// `dir` persists history as `<app-id>.json`
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, app_id: Uuid) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(app_id).or_default())
    }

    fn path(&self, app_id: Uuid) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("{}.json", app_id)))
    }

    async fn load(&self, app_id: Uuid, state: &mut Option<AppReleases>) -> ShipyardResult<()> {
        if state.is_none() {
            let loaded = match self.path(app_id) {
                Some(path) => read_json(&path).await?,
                None => None,
            };
            *state = Some(loaded.unwrap_or_default());
        }
        Ok(())
    }

    async fn persist(&self, app_id: Uuid, state: &AppReleases) -> ShipyardResult<()> {
        if let Some(path) = self.path(app_id) {
            write_json_atomic(&path, state).await?;
        }
        Ok(())
    }

    /// Assemble the next release without making it visible
    ///
    /// Without an override, the first release that declares `web` gets
    /// `web=1`; later releases keep the current formation, minus process
    /// types the new slug no longer declares.
    pub async fn prepare(
        &self,
        app: &App,
        artifact: ArtifactRef,
        buildpack: impl Into<String>,
        processes: ProcessTypes,
        formation_override: Option<Formation>,
    ) -> ShipyardResult<ReleasePlan> {
        let slot = self.slot(app.id);
        let mut guard = slot.lock().await;
        self.load(app.id, &mut guard).await?;
        let state = guard.get_or_insert_with(AppReleases::default);

        let first = state.releases.is_empty();
        let version = state.releases.last().map_or(1, |r| r.version + 1);

        let mut default_formation_added = false;
        let formation = match formation_override {
            Some(formation) => {
                formation.check_declared(&processes)?;
                formation
            }
            None if first && processes.contains_key(DEFAULT_PROCESS_TYPE) => {
                default_formation_added = true;
                let mut formation = Formation::new();
                formation.set(DEFAULT_PROCESS_TYPE, 1);
                formation
            }
            None => {
                let mut formation = state.formation.clone();
                formation.retain_declared(&processes);
                formation
            }
        };

        let release = Release {
            id: Uuid::new_v4(),
            app_id: app.id,
            version,
            artifact,
            buildpack: buildpack.into(),
            env: app.env.clone(),
            processes,
            created_at: Utc::now(),
        };

        Ok(ReleasePlan {
            release,
            formation,
            default_formation_added,
        })
    }

    /// Make a prepared release current
    pub async fn publish(&self, plan: &ReleasePlan) -> ShipyardResult<Release> {
        let app_id = plan.release.app_id;
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        let state = guard.get_or_insert_with(AppReleases::default);

        let expected = state.releases.last().map_or(1, |r| r.version + 1);
        if plan.release.version != expected {
            return Err(ShipyardError::Internal(format!(
                "release v{} is stale (next is v{})",
                plan.release.version, expected
            )));
        }

        let mut next = AppReleases {
            releases: state.releases.clone(),
            formation: plan.formation.clone(),
        };
        next.releases.push(plan.release.clone());
        self.persist(app_id, &next).await?;
        *state = next;

        info!(
            "Published release v{} for app {} ({})",
            plan.release.version, app_id, plan.formation
        );
        Ok(plan.release.clone())
    }

    /// Most recent published release
    pub async fn latest(&self, app_id: Uuid) -> ShipyardResult<Option<Release>> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        Ok(guard.as_ref().and_then(|s| s.releases.last().cloned()))
    }

    /// Release history, oldest first
    pub async fn list(&self, app_id: Uuid) -> ShipyardResult<Vec<Release>> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        Ok(guard.as_ref().map(|s| s.releases.clone()).unwrap_or_default())
    }

    /// Current desired formation
    pub async fn formation(&self, app_id: Uuid) -> ShipyardResult<Formation> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        self.load(app_id, &mut guard).await?;
        Ok(guard.as_ref().map(|s| s.formation.clone()).unwrap_or_default())
    }

    /// Merge `changes` into the current formation
    ///
    /// Counts of zero are kept so the process type stays visible. Returns
    /// the release the formation applies to and the merged formation.
    pub async fn scale(
        &self,
        app: &App,
        changes: &Formation,
    ) -> ShipyardResult<(Release, Formation)> {
        let slot = self.slot(app.id);
        let mut guard = slot.lock().await;
        self.load(app.id, &mut guard).await?;
        let state = guard.get_or_insert_with(AppReleases::default);

        let release = state
            .releases
            .last()
            .cloned()
            .ok_or_else(|| ShipyardError::NoRelease(app.name.clone()))?;
        changes.check_declared(&release.processes)?;

        let mut formation = state.formation.clone();
        for (process_type, count) in changes.iter() {
            formation.set(process_type, count);
        }

        let next = AppReleases {
            releases: state.releases.clone(),
            formation: formation.clone(),
        };
        self.persist(app.id, &next).await?;
        *state = next;

        debug!("Scaled app {} to {}", app.name, formation);
        Ok((release, formation))
    }

    /// Forget everything about an app
    pub async fn clear(&self, app_id: Uuid) -> ShipyardResult<()> {
        let slot = self.slot(app_id);
        let mut guard = slot.lock().await;
        *guard = None;

        if let Some(path) = self.path(app_id) {
            if path.exists() {
                tokio::fs::remove_file(&path).await.map_err(|e| {
                    ShipyardError::io(format!("removing {}", path.display()), e)
                })?;
            }
        }
        drop(guard);

        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
        Ok(())
    }
}

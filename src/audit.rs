//! Deploy history
//!
//! The gateway appends one [`AuditRecord`] per completed app operation to
//! `<state-dir>/audit.log`, one JSON object per line.

use crate::apps::App;
use crate::config::{schema::Config, StateLayout};
use crate::release::Formation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

/// What happened to an app
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    AppCreated,
    AppDeleted {
        jobs_stopped: usize,
    },
    /// A push published a release
    Deployed {
        version: u32,
        artifact: String,
        formation: Formation,
        cache_hit: bool,
        /// Process types still being restarted after the push returned
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        recovering: Vec<String>,
    },
    /// A push ended without publishing
    DeployFailed {
        error: String,
    },
    Scaled {
        version: u32,
        formation: Formation,
    },
}

/// One line of the audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub app: String,
    pub app_id: Uuid,
    #[serde(flatten)]
    pub event: AuditEvent,
}

impl AuditRecord {
    pub fn new(app: &App, event: AuditEvent) -> Self {
        Self {
            timestamp: Utc::now(),
            app: app.name.clone(),
            app_id: app.id,
            event,
        }
    }
}

/// Appends records to the audit log; a no-op when auditing is off
pub struct AuditLog {
    path: Option<PathBuf>,
    /// Keeps lines from concurrent pushes whole
    writer: Mutex<()>,
}

impl AuditLog {
    pub fn new(config: &Config, layout: &StateLayout) -> Self {
        Self {
            path: config.general.audit_log.then(|| layout.audit_log_path()),
            writer: Mutex::new(()),
        }
    }

    /// Append an event for `app`
    ///
    /// Write failures are logged, never returned: an operation that already
    /// happened is not undone because its record could not be written.
    pub async fn record(&self, app: &App, event: AuditEvent) {
        let Some(path) = &self.path else {
            return;
        };

        let record = AuditRecord::new(app, event);
        let mut line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!("Failed to encode audit record for {}: {}", app.name, e);
                return;
            }
        };
        line.push('\n');

        let _writing = self.writer.lock().await;
        if let Err(e) = append(path, &line).await {
            warn!("Failed to write audit log {}: {}", path.display(), e);
        }
    }
}

async fn append(path: &Path, line: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

//! Error types for Shipyard
//!
//! All modules use `ShipyardResult<T>` as their return type.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Shipyard operations
pub type ShipyardResult<T> = Result<T, ShipyardError>;

/// All errors that can occur in the pipeline
#[derive(Error, Debug)]
pub enum ShipyardError {
    // App errors
    #[error("App not found: {0}")]
    AppNotFound(String),

    #[error("App already exists: {0}")]
    AppExists(String),

    #[error("Invalid app name {name:?}: {reason}")]
    InvalidAppName { name: String, reason: String },

    #[error("No release found for app {0}")]
    NoRelease(String),

    // Build errors
    #[error("Build failed: {0}")]
    BuildFailure(String),

    #[error("Unable to select a buildpack")]
    NoBuildpackDetected,

    #[error("Buildpack not configured: {0}")]
    UnknownBuildpack(String),

    #[error("Missing required resource binding: {0}")]
    MissingResourceBinding(String),

    #[error("Build already in progress for app {0}")]
    BuildInProgress(String),

    #[error("Build cancelled for app {0}")]
    BuildCancelled(String),

    // Cache and artifact errors
    #[error("Cache corruption for {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact {digest} failed verification: {reason}")]
    ArtifactCorrupt { digest: String, reason: String },

    // Scheduling errors
    #[error("Cannot place {process_type} job for app {app}: {reason}")]
    SchedulingFailure {
        app: String,
        process_type: String,
        reason: String,
    },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Formation for app {app} did not converge within {secs}s")]
    ConvergenceTimeout { app: String, secs: u64 },

    #[error("Invalid formation: {0}")]
    InvalidFormation(String),

    // Event stream errors
    #[error("Event subscriber for app {app} overflowed ({missed} events missed)")]
    StreamOverflow { app: String, missed: u64 },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Failed to create config directory {path}: {source}")]
    ConfigDirCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // IO errors
    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    // Process errors
    #[error("Command failed: {command}")]
    CommandFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    User(String),
}

impl ShipyardError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a command failed error
    pub fn command_failed(command: impl Into<String>, source: std::io::Error) -> Self {
        Self::CommandFailed {
            command: command.into(),
            source,
        }
    }

    /// Check if error is retryable
    ///
    /// Build failures are deterministic per push and never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::SchedulingFailure { .. } | Self::BuildInProgress(_)
        )
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::NoBuildpackDetected => {
                Some("Set BUILDPACK_URL with: shipyard env <app> set BUILDPACK_URL=<url>")
            }
            Self::MissingResourceBinding(_) => {
                Some("Provision the resource and set its variable with: shipyard env <app> set")
            }
            Self::BuildInProgress(_) => Some("Wait for the running push to finish, then retry"),
            Self::NoRelease(_) => Some("Push the app first: shipyard push <app>"),
            Self::AppNotFound(_) => Some("Create it with: shipyard create <app>"),
            _ => None,
        }
    }
}

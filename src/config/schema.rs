//! Configuration schema for Shipyard
//!
//! Configuration is stored at `~/.config/shipyard/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Build and buildpack settings
    pub build: BuildConfig,

    /// Job scheduler settings
    pub scheduler: SchedulerConfig,

    /// Formation convergence settings
    pub formation: FormationConfig,

    /// Event stream settings
    pub events: EventsConfig,

    /// Push gateway settings
    pub gateway: GatewayConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log format: "text" or "json"
    pub log_format: String,

    /// Enable audit logging
    pub audit_log: bool,

    /// Override the state directory
    pub state_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_format: "text".to_string(),
            audit_log: true,
            state_dir: None,
        }
    }
}

/// A script buildpack installed on the local filesystem
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BuildpackEntry {
    /// URL apps use in BUILDPACK_URL to select this buildpack
    pub url: String,

    /// Directory containing bin/detect and bin/compile
    pub path: PathBuf,
}

/// Build configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Reuse cache layers between builds (default: true)
    pub cache_enabled: bool,

    /// Buildpack used when an app sets no BUILDPACK_URL
    pub default_buildpack_url: Option<String>,

    /// Script buildpacks tried in order during detection
    pub buildpacks: Vec<BuildpackEntry>,

    /// Maximum time a buildpack compile may run
    pub compile_timeout_secs: u64,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            default_buildpack_url: None,
            buildpacks: vec![],
            compile_timeout_secs: 900,
        }
    }
}

/// Job scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum active jobs per app before placement fails
    pub max_jobs_per_app: u32,

    /// How long a process must stay alive in `starting` before it is `up`
    pub start_grace_ms: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a job
    pub stop_timeout_secs: u64,

    /// First port handed out to web processes via PORT
    pub port_base: u16,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_jobs_per_app: 32,
            start_grace_ms: 500,
            stop_timeout_secs: 10,
            port_base: 5000,
        }
    }
}

/// Formation controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FormationConfig {
    /// Give up converging a formation after this long
    pub converge_timeout_secs: u64,

    /// First retry delay after a failed reconcile pass
    pub retry_initial_ms: u64,

    /// Upper bound on the retry delay
    pub retry_max_ms: u64,
}

impl Default for FormationConfig {
    fn default() -> Self {
        Self {
            converge_timeout_secs: 60,
            retry_initial_ms: 250,
            retry_max_ms: 5000,
        }
    }
}

/// What happens to a subscriber that falls behind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OverflowPolicy {
    /// Lose the oldest buffered events and keep going
    #[default]
    DropOldest,
    /// End the subscription with an overflow error
    Disconnect,
}

/// Event stream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Buffered events per subscriber
    pub subscriber_buffer: usize,

    /// Policy applied when a subscriber's buffer overflows
    pub overflow: OverflowPolicy,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
            overflow: OverflowPolicy::DropOldest,
        }
    }
}

/// What a push does when another push for the same app is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Fail fast with "build in progress"
    #[default]
    Reject,
    /// Wait for the running push to finish
    Queue,
}

/// Push gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Behavior for concurrent pushes to one app
    pub on_busy: BusyPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = Config::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(toml.contains("[general]"));
        assert!(toml.contains("[scheduler]"));
    }

    #[test]
    fn config_deserializes_empty() {
        let config: Config = toml::from_str("").unwrap();
        assert!(config.build.cache_enabled);
        assert_eq!(config.events.overflow, OverflowPolicy::DropOldest);
    }

    #[test]
    fn config_deserializes_partial() {
        let toml = r#"
            [events]
            overflow = "disconnect"

            [gateway]
            on_busy = "queue"

            [[build.buildpacks]]
            url = "https://example.com/buildpack-go"
            path = "/opt/buildpacks/go"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.events.overflow, OverflowPolicy::Disconnect);
        assert_eq!(config.events.subscriber_buffer, 256); // default preserved
        assert_eq!(config.gateway.on_busy, BusyPolicy::Queue);
        assert_eq!(config.build.buildpacks.len(), 1);
        assert_eq!(
            config.build.buildpacks[0].path,
            PathBuf::from("/opt/buildpacks/go")
        );
    }
}

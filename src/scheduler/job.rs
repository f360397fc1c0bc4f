//! Job records and their state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle state of a job
///
/// ```text
/// pending -> starting -> up -> stopping -> down
///               |        |
///               +--------+--> crashed
/// ```
///
/// `starting -> stopping` covers a stop requested before the job is up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Starting,
    Up,
    Stopping,
    Down,
    Crashed,
}

impl JobState {
    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Starting)
                | (Pending, Down)
                | (Starting, Up)
                | (Starting, Stopping)
                | (Starting, Crashed)
                | (Up, Stopping)
                | (Up, Crashed)
                | (Stopping, Down)
        )
    }

    /// Counts toward a formation's running instances
    pub fn is_active(self) -> bool {
        matches!(self, JobState::Pending | JobState::Starting | JobState::Up)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Down | JobState::Crashed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Starting => "starting",
            JobState::Up => "up",
            JobState::Stopping => "stopping",
            JobState::Down => "down",
            JobState::Crashed => "crashed",
        };
        write!(f, "{}", s)
    }
}

/// A single instance of one process type
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub app_id: Uuid,
    pub release_id: Uuid,
    pub process_type: String,
    pub state: JobState,
    /// Port assigned through PORT, web processes only
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    /// A stop was requested but the job has not reached `stopping` yet
    #[serde(default)]
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn short_id(&self) -> String {
        short_id(self.id)
    }
}

/// First eight hex digits of a job id, for display and `PS`
pub fn short_id(id: Uuid) -> String {
    let mut short = id.simple().to_string();
    short.truncate(8);
    short
}

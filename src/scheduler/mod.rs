//! Job scheduling and supervision

pub mod job;
pub mod runtime;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;

pub use job::{short_id, Job, JobState};
pub use runtime::{JobCommand, JobHandle, JobRuntime, JobSpec, ProcessRuntime};
pub use service::{JobScheduler, RUN_PROCESS_TYPE};

//! Job scheduler
//!
//! Owns every job record. Each job is driven by its own task through the
//! state machine in [`JobState`]; callers only request starts and stops.
//! Every transition publishes its event before the new state is committed,
//! both under the job table lock, so the event order matches the commit
//! order and a reader never sees a state whose event was not published.

use crate::apps::App;
use crate::config::schema::SchedulerConfig;
use crate::error::{ShipyardError, ShipyardResult};
use crate::events::EventStream;
use crate::release::Release;
use crate::scheduler::job::{Job, JobState};
use crate::scheduler::runtime::{JobCommand, JobHandle, JobRuntime, JobSpec};
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Process type that receives a PORT
const WEB_PROCESS_TYPE: &str = "web";

/// Finished jobs kept per app for `ps`
const MAX_FINISHED_JOBS: usize = 20;

/// Process type recorded for one-off runs
pub const RUN_PROCESS_TYPE: &str = "run";

struct JobEntry {
    job: Job,
    /// Cancelled to request a stop
    stop: CancellationToken,
    /// Cancelled by the driver once the job is terminal
    finished: CancellationToken,
}

struct Inner {
    runtime: Arc<dyn JobRuntime>,
    events: Arc<EventStream>,
    config: SchedulerConfig,
    jobs: Mutex<HashMap<Uuid, JobEntry>>,
}

/// How a driver wait ended
enum Wake {
    Exited(ShipyardResult<Option<i32>>),
    Ready,
    StopRequested,
}

impl Inner {
    /// Move a job to `next`, publishing its event first
    ///
    /// Returns false if the job is gone or the transition is illegal.
    fn transition(&self, job_id: Uuid, next: JobState) -> bool {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = jobs.get_mut(&job_id) else {
            return false;
        };

        let job = &mut entry.job;
        if !job.state.can_transition_to(next) {
            warn!("Ignoring illegal transition {} -> {} for job {}", job.state, next, job_id);
            return false;
        }

        self.events
            .publish(job.app_id, job.id, job.release_id, &job.process_type, next);
        job.state = next;
        job.updated_at = Utc::now();
        debug!("Job {} ({}) is {}", job.short_id(), job.process_type, next);

        if next.is_terminal() {
            let app_id = job.app_id;
            prune_finished(&mut jobs, app_id);
        }
        true
    }

    fn update(&self, job_id: Uuid, f: impl FnOnce(&mut Job)) {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = jobs.get_mut(&job_id) {
            f(&mut entry.job);
        }
    }

    /// Crash a job, recording how its process ended
    fn crash(&self, job_id: Uuid, exit: Option<i32>) {
        self.update(job_id, |job| job.exit_code = exit);
        self.transition(job_id, JobState::Crashed);
    }

    /// Terminate, then kill after the stop timeout
    async fn shut_down(&self, job_id: Uuid, handle: &mut Box<dyn JobHandle>) {
        if let Err(e) = handle.terminate() {
            warn!("Failed to signal job {}: {}", job_id, e);
        }

        let timeout = Duration::from_secs(self.config.stop_timeout_secs);
        let exit = match tokio::time::timeout(timeout, handle.wait()).await {
            Ok(exit) => exit,
            Err(_) => {
                warn!("Job {} ignored SIGTERM for {}s, killing", job_id, timeout.as_secs());
                if let Err(e) = handle.kill() {
                    warn!("Failed to kill job {}: {}", job_id, e);
                }
                handle.wait().await
            }
        };
        if let Ok(code) = exit {
            self.update(job_id, |job| job.exit_code = code);
        }
    }

    /// Drive one job from pending to a terminal state
    async fn drive(self: Arc<Self>, job_id: Uuid, spec: JobSpec, stop: CancellationToken) {
        if stop.is_cancelled() {
            self.transition(job_id, JobState::Down);
            return;
        }
        if !self.transition(job_id, JobState::Starting) {
            return;
        }

        let launched = tokio::select! {
            launched = self.runtime.spawn(&spec) => launched,
            _ = stop.cancelled() => {
                debug!("Job {} stopped while launching", job_id);
                self.transition(job_id, JobState::Stopping);
                self.transition(job_id, JobState::Down);
                return;
            }
        };
        let mut handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Job {} failed to launch: {}", job_id, e);
                self.crash(job_id, None);
                return;
            }
        };
        let pid = handle.pid();
        self.update(job_id, |job| job.pid = pid);

        let grace = Duration::from_millis(self.config.start_grace_ms);
        let wake = tokio::select! {
            exit = handle.wait() => Wake::Exited(exit),
            _ = tokio::time::sleep(grace) => Wake::Ready,
            _ = stop.cancelled() => Wake::StopRequested,
        };
        match wake {
            Wake::Exited(exit) => {
                warn!("Job {} exited while starting", job_id);
                self.crash(job_id, exit.ok().flatten());
                return;
            }
            Wake::StopRequested => {
                self.transition(job_id, JobState::Stopping);
                self.shut_down(job_id, &mut handle).await;
                self.transition(job_id, JobState::Down);
                return;
            }
            Wake::Ready => {
                self.transition(job_id, JobState::Up);
            }
        }

        let wake = tokio::select! {
            exit = handle.wait() => Wake::Exited(exit),
            _ = stop.cancelled() => Wake::StopRequested,
        };
        match wake {
            Wake::Exited(Ok(Some(0))) => {
                info!("Job {} exited cleanly", job_id);
                self.update(job_id, |job| job.exit_code = Some(0));
                self.transition(job_id, JobState::Stopping);
                self.transition(job_id, JobState::Down);
            }
            Wake::Exited(exit) => {
                warn!("Job {} crashed: {:?}", job_id, exit);
                self.crash(job_id, exit.ok().flatten());
            }
            Wake::StopRequested | Wake::Ready => {
                self.transition(job_id, JobState::Stopping);
                self.shut_down(job_id, &mut handle).await;
                self.transition(job_id, JobState::Down);
            }
        }
    }
}

fn prune_finished(jobs: &mut HashMap<Uuid, JobEntry>, app_id: Uuid) {
    let mut finished: Vec<(chrono::DateTime<Utc>, Uuid)> = jobs
        .values()
        .filter(|e| e.job.app_id == app_id && e.job.state.is_terminal())
        .map(|e| (e.job.updated_at, e.job.id))
        .collect();
    if finished.len() <= MAX_FINISHED_JOBS {
        return;
    }
    finished.sort();
    let excess = finished.len() - MAX_FINISHED_JOBS;
    for (_, id) in finished.into_iter().take(excess) {
        jobs.remove(&id);
    }
}

/// Starts and stops jobs, reporting every transition to the event stream
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        runtime: Arc<dyn JobRuntime>,
        events: Arc<EventStream>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                runtime,
                events,
                config,
                jobs: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn runtime_name(&self) -> &'static str {
        self.inner.runtime.runtime_name()
    }

    /// Lowest free port at or above the base, across all apps
    fn allocate_port(&self, jobs: &HashMap<Uuid, JobEntry>) -> u16 {
        let used: BTreeSet<u16> = jobs
            .values()
            .filter(|e| !e.job.state.is_terminal())
            .filter_map(|e| e.job.port)
            .collect();
        let mut port = self.inner.config.port_base;
        while used.contains(&port) {
            port = port.saturating_add(1);
        }
        port
    }

    /// Enqueue a pending job and return its id without waiting for it
    pub fn start(&self, app: &App, release: &Release, process_type: &str) -> ShipyardResult<Uuid> {
        let failure = |reason: String| ShipyardError::SchedulingFailure {
            app: app.name.clone(),
            process_type: process_type.to_string(),
            reason,
        };

        let command = release.command(process_type).ok_or_else(|| {
            failure(format!("release v{} does not declare it", release.version))
        })?;

        let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let active = jobs
            .values()
            .filter(|e| e.job.app_id == app.id && !e.job.state.is_terminal())
            .count();
        if active >= self.inner.config.max_jobs_per_app as usize {
            return Err(failure(format!(
                "app already has {} jobs (limit {})",
                active, self.inner.config.max_jobs_per_app
            )));
        }

        let port = (process_type == WEB_PROCESS_TYPE).then(|| self.allocate_port(&jobs));
        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4(),
            app_id: app.id,
            release_id: release.id,
            process_type: process_type.to_string(),
            state: JobState::Pending,
            port,
            pid: None,
            exit_code: None,
            stop_requested: false,
            created_at: now,
            updated_at: now,
        };
        let spec = JobSpec {
            job_id: job.id,
            app_name: app.name.clone(),
            process_type: process_type.to_string(),
            artifact: release.artifact.clone(),
            command: JobCommand::Shell(command.to_string()),
            env: release.env.clone(),
            port,
        };

        let job_id = job.id;
        let stop = CancellationToken::new();
        let finished = CancellationToken::new();

        self.inner
            .events
            .publish(app.id, job_id, release.id, process_type, JobState::Pending);
        jobs.insert(
            job_id,
            JobEntry {
                job,
                stop: stop.clone(),
                finished: finished.clone(),
            },
        );
        drop(jobs);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.drive(job_id, spec, stop).await;
            finished.cancel();
        });

        debug!("Scheduled {} job {} for {}", process_type, job_id, app.name);
        Ok(job_id)
    }

    /// Request a job stop; no-op once the job is stopping or finished
    pub fn stop(&self, job_id: Uuid) -> ShipyardResult<()> {
        let mut jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = jobs
            .get_mut(&job_id)
            .ok_or_else(|| ShipyardError::JobNotFound(job_id.to_string()))?;
        if entry.job.state.is_active() {
            entry.job.stop_requested = true;
            entry.stop.cancel();
        }
        Ok(())
    }

    /// Wait until a job reaches a terminal state
    pub async fn wait_finished(&self, job_id: Uuid) {
        let finished = {
            let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.get(&job_id).map(|e| e.finished.clone())
        };
        if let Some(finished) = finished {
            finished.cancelled().await;
        }
    }

    /// Stop every job of an app and wait for them to finish
    pub async fn stop_app(&self, app_id: Uuid) -> usize {
        let waits: Vec<CancellationToken> = {
            let jobs = self.inner.jobs.lock().unwrap_or_else(PoisonError::into_inner);
            jobs.values()
                .filter(|e| e.job.app_id == app_id && !e.job.state.is_terminal())
                .map(|e| {
                    e.stop.cancel();
                    e.finished.clone()
                })
                .collect()
        };

        let count = waits.len();
        for finished in waits {
            finished.cancelled().await;
        }
        if count > 0 {
            info!("Stopped {} jobs for app {}", count, app_id);
        }
        count
    }

    /// Drop all records for an app; call after [`Self::stop_app`]
    pub fn forget_app(&self, app_id: Uuid) {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, e| e.job.app_id != app_id);
    }

    pub fn get(&self, job_id: Uuid) -> Option<Job> {
        self.inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .map(|e| e.job.clone())
    }

    /// All known jobs of an app, oldest first
    pub fn snapshot(&self, app_id: Uuid) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .inner
            .jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|e| e.job.app_id == app_id)
            .map(|e| e.job.clone())
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        jobs
    }

    /// Run a one-off command against a release, outside the job table
    pub async fn run_once(
        &self,
        app: &App,
        release: &Release,
        command: Vec<String>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<i32> {
        if command.is_empty() {
            return Err(ShipyardError::User("no command given".to_string()));
        }

        let spec = JobSpec {
            job_id: Uuid::new_v4(),
            app_name: app.name.clone(),
            process_type: RUN_PROCESS_TYPE.to_string(),
            artifact: release.artifact.clone(),
            command: JobCommand::Argv(command),
            env: release.env.clone(),
            port: None,
        };
        self.inner.runtime.run_once(&spec, on_output).await
    }
}

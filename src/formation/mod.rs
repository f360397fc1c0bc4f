//! Formation controller
//!
//! Reconciles a release's desired formation against the scheduler's jobs.
//! The controller never touches job state; it asks the scheduler to start
//! or stop jobs and watches the event stream for the outcome.

use crate::apps::App;
use crate::config::schema::FormationConfig;
use crate::error::{ShipyardError, ShipyardResult};
use crate::events::{EventFilter, EventStream};
use crate::release::{Formation, Release};
use crate::scheduler::{Job, JobScheduler, JobState};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Upper bound between reconcile passes when no event arrives
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Jobs to start and stop to reach a formation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormationDiff {
    /// One entry per instance to start
    pub start: Vec<String>,
    pub stop: Vec<Uuid>,
}

impl FormationDiff {
    pub fn is_empty(&self) -> bool {
        self.start.is_empty() && self.stop.is_empty()
    }
}

/// Compute the diff between desired counts and active jobs
///
/// Pending, starting and up jobs of `release` count toward the formation.
/// Active jobs of any other release, or of a process type scaled to zero,
/// are stopped. Excess jobs are stopped youngest first. Jobs already asked
/// to stop are neither counted nor stopped again.
pub fn plan(release: &Release, desired: &Formation, jobs: &[Job]) -> FormationDiff {
    let mut diff = FormationDiff::default();
    let active: Vec<&Job> = jobs
        .iter()
        .filter(|j| j.app_id == release.app_id && j.state.is_active() && !j.stop_requested)
        .collect();

    for job in &active {
        if job.release_id != release.id || desired.get(&job.process_type) == 0 {
            diff.stop.push(job.id);
        }
    }

    for (process_type, want) in desired.iter() {
        let mut current: Vec<&&Job> = active
            .iter()
            .filter(|j| j.release_id == release.id && j.process_type == process_type)
            .collect();
        let have = current.len() as u32;

        if have < want {
            for _ in have..want {
                diff.start.push(process_type.to_string());
            }
        } else if have > want && want > 0 {
            current.sort_by_key(|j| std::cmp::Reverse(j.created_at));
            diff.stop
                .extend(current.iter().take((have - want) as usize).map(|j| j.id));
        }
    }

    diff
}

/// Process types left short once nothing is in flight
///
/// Returns `None` while any job is pending, starting or stopping, while an
/// unwanted job is still up, or while a process type is short without a
/// failed attempt in `failing`. An empty list means the formation is met
/// exactly.
fn settled(
    release: &Release,
    desired: &Formation,
    jobs: &[Job],
    failing: &HashSet<String>,
) -> Option<Vec<String>> {
    let mut up: HashMap<&str, u32> = HashMap::new();
    for job in jobs.iter().filter(|j| j.app_id == release.app_id) {
        let wanted = job.release_id == release.id && desired.get(&job.process_type) > 0;
        match job.state {
            JobState::Up if wanted => *up.entry(job.process_type.as_str()).or_default() += 1,
            state if state.is_terminal() => {}
            _ => return None,
        }
    }

    let mut short = Vec::new();
    for (process_type, want) in desired.iter() {
        let have = up.get(process_type).copied().unwrap_or(0);
        if have > want || (have < want && !failing.contains(process_type)) {
            return None;
        }
        if have < want {
            short.push(process_type.to_string());
        }
    }
    Some(short)
}

/// Outcome of one reconcile pass
#[derive(Debug, Default)]
pub struct Reconciliation {
    pub diff: FormationDiff,
    pub started: Vec<Uuid>,
    pub stopped: Vec<Uuid>,
    /// Starts the scheduler refused
    pub failed: Vec<ShipyardError>,
}

/// Drives an app's jobs toward its formation
#[derive(Clone)]
pub struct FormationController {
    scheduler: JobScheduler,
    events: Arc<EventStream>,
    config: FormationConfig,
}

impl FormationController {
    pub fn new(scheduler: JobScheduler, events: Arc<EventStream>, config: FormationConfig) -> Self {
        Self {
            scheduler,
            events,
            config,
        }
    }

    /// One reconcile pass; returns immediately after issuing requests
    ///
    /// Calling it again before any job changes state yields an empty diff.
    pub fn reconcile(&self, app: &App, release: &Release, desired: &Formation) -> Reconciliation {
        let jobs = self.scheduler.snapshot(app.id);
        let diff = plan(release, desired, &jobs);
        let mut pass = Reconciliation::default();

        for job_id in &diff.stop {
            match self.scheduler.stop(*job_id) {
                Ok(()) => pass.stopped.push(*job_id),
                // Finished and pruned in the meantime
                Err(ShipyardError::JobNotFound(_)) => {}
                Err(e) => pass.failed.push(e),
            }
        }

        for process_type in &diff.start {
            match self.scheduler.start(app, release, process_type) {
                Ok(job_id) => pass.started.push(job_id),
                Err(e) => {
                    warn!("Reconcile for {}: {}", app.name, e);
                    pass.failed.push(e);
                }
            }
        }

        if !diff.is_empty() {
            debug!(
                "Reconciled {}: {} to start, {} to stop",
                app.name,
                diff.start.len(),
                diff.stop.len()
            );
        }
        pass.diff = diff;
        pass
    }

    /// Reconcile until every desired job has been placed and settled
    ///
    /// Returns the process types still short of their count: types whose
    /// jobs crashed or could not be placed in this call. Healthy siblings
    /// are left running; [`supervise`](Self::supervise) keeps replacing the
    /// failed ones. Fails only on cancel or when jobs are still in flight
    /// at the deadline.
    pub async fn converge(
        &self,
        app: &App,
        release: &Release,
        desired: &Formation,
        cancel: &CancellationToken,
    ) -> ShipyardResult<Vec<String>> {
        let timeout = Duration::from_secs(self.config.converge_timeout_secs);
        self.drive(app, release, desired, cancel, Some(Instant::now() + timeout))
            .await
    }

    /// Keep replacing crashed jobs until the formation is met or `cancel` fires
    pub async fn supervise(
        &self,
        app: &App,
        release: &Release,
        desired: &Formation,
        cancel: &CancellationToken,
    ) {
        match self.drive(app, release, desired, cancel, None).await {
            Ok(_) => info!("Formation {} for {} recovered", desired, app.name),
            Err(ShipyardError::BuildCancelled(_)) => {
                debug!("Supervision of {} v{} ended", app.name, release.version)
            }
            Err(e) => warn!("Supervision of {} stopped: {}", app.name, e),
        }
    }

    /// Reconcile loop; settles early on failures only when a deadline is set
    ///
    /// Crashed jobs are replaced on the next pass. Passes that hit
    /// retryable failures or crashes back off exponentially.
    async fn drive(
        &self,
        app: &App,
        release: &Release,
        desired: &Formation,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> ShipyardResult<Vec<String>> {
        let initial = Duration::from_millis(self.config.retry_initial_ms.max(1));
        let max = Duration::from_millis(self.config.retry_max_ms).max(initial);
        let mut backoff = initial;
        let cap = |at: Instant| deadline.map_or(at, |d| at.min(d));

        let mut events = self.events.subscribe(app.id, EventFilter::default());
        let mut launched: HashSet<Uuid> = HashSet::new();
        let mut failing: HashSet<String> = HashSet::new();
        let never = HashSet::new();

        loop {
            let jobs = self.scheduler.snapshot(app.id);
            failing.extend(
                jobs.iter()
                    .filter(|j| j.state == JobState::Crashed && launched.contains(&j.id))
                    .map(|j| j.process_type.clone()),
            );
            let tolerated = if deadline.is_some() { &failing } else { &never };
            if let Some(short) = settled(release, desired, &jobs, tolerated) {
                if short.is_empty() {
                    info!("Formation {} for {} is up", desired, app.name);
                } else {
                    warn!(
                        "Formation {} for {} settled without {}",
                        desired,
                        app.name,
                        short.join(", ")
                    );
                }
                return Ok(short);
            }

            let pass = self.reconcile(app, release, desired);
            launched.extend(pass.started.iter().copied());
            let mut retrying = false;
            for e in &pass.failed {
                if let ShipyardError::SchedulingFailure { process_type, .. } = e {
                    failing.insert(process_type.clone());
                }
                retrying |= e.is_retryable();
            }

            // Retryable failures wait out the backoff; otherwise wake on the next event
            let wait = if retrying { backoff } else { POLL_INTERVAL };
            let wait_until = cap(Instant::now() + wait);

            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(ShipyardError::BuildCancelled(app.name.clone()));
                }
                _ = tokio::time::sleep_until(wait_until) => None,
                event = events.recv(), if !retrying => Some(event),
            };

            let mut crashed = false;
            match received {
                Some(Ok(Some(event))) => crashed = event.state == JobState::Crashed,
                Some(Ok(None)) => {
                    events = self.events.subscribe(app.id, EventFilter::default());
                }
                Some(Err(e)) => {
                    debug!("Resubscribing after {}", e);
                    events = self.events.subscribe(app.id, EventFilter::default());
                }
                None => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(ShipyardError::ConvergenceTimeout {
                    app: app.name.clone(),
                    secs: self.config.converge_timeout_secs,
                });
            }

            if crashed {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(ShipyardError::BuildCancelled(app.name.clone()));
                    }
                    _ = tokio::time::sleep_until(cap(Instant::now() + backoff)) => {}
                }
            }
            if retrying || crashed {
                backoff = backoff.saturating_mul(2).min(max);
            }
        }
    }

    /// Stop every job of an app and forget them
    pub async fn teardown(&self, app: &App) -> usize {
        let stopped = self.scheduler.stop_app(app.id).await;
        self.scheduler.forget_app(app.id);
        stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{EventsConfig, SchedulerConfig};
    use crate::scheduler::testing::{release_running, release_with, FakeRuntime, Launch};
    use chrono::Utc;

    fn job(release: &Release, process_type: &str, state: JobState) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            app_id: release.app_id,
            release_id: release.id,
            process_type: process_type.to_string(),
            state,
            port: None,
            pid: None,
            exit_code: None,
            stop_requested: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn controller(runtime: Arc<FakeRuntime>) -> (FormationController, JobScheduler) {
        let events = Arc::new(EventStream::new(&EventsConfig::default()));
        let scheduler = JobScheduler::new(
            runtime,
            Arc::clone(&events),
            SchedulerConfig {
                max_jobs_per_app: 8,
                start_grace_ms: 10,
                stop_timeout_secs: 1,
                port_base: 7000,
            },
        );
        let controller = FormationController::new(
            scheduler.clone(),
            events,
            FormationConfig {
                converge_timeout_secs: 5,
                retry_initial_ms: 10,
                retry_max_ms: 50,
            },
        );
        (controller, scheduler)
    }

    #[test]
    fn plan_starts_shortfall() {
        let app = App::new("plan");
        let release = release_with(&app, &["web", "worker"]);
        let desired = Formation::parse(["web=2", "worker=1"]).unwrap();
        let jobs = vec![job(&release, "web", JobState::Up)];

        let diff = plan(&release, &desired, &jobs);
        assert_eq!(diff.start, vec!["web".to_string(), "worker".to_string()]);
        assert!(diff.stop.is_empty());
    }

    #[test]
    fn plan_stops_excess_and_old_releases() {
        let app = App::new("plan");
        let old = release_with(&app, &["web"]);
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=1"]).unwrap();

        let stale = job(&old, "web", JobState::Up);
        let keep = job(&release, "web", JobState::Up);
        let mut extra = job(&release, "web", JobState::Starting);
        extra.created_at = keep.created_at + chrono::Duration::seconds(1);

        let diff = plan(&release, &desired, &[stale.clone(), keep, extra.clone()]);
        assert!(diff.start.is_empty());
        assert_eq!(diff.stop.len(), 2);
        assert!(diff.stop.contains(&stale.id));
        assert!(diff.stop.contains(&extra.id));
    }

    #[test]
    fn plan_replaces_crashed_and_ignores_finished() {
        let app = App::new("plan");
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=1"]).unwrap();
        let jobs = vec![
            job(&release, "web", JobState::Crashed),
            job(&release, "web", JobState::Down),
            job(&release, "web", JobState::Stopping),
        ];

        let diff = plan(&release, &desired, &jobs);
        assert_eq!(diff.start, vec!["web".to_string()]);
        assert!(diff.stop.is_empty());
    }

    #[test]
    fn plan_scale_to_zero_stops_all() {
        let app = App::new("plan");
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=0"]).unwrap();
        let jobs = vec![
            job(&release, "web", JobState::Up),
            job(&release, "web", JobState::Pending),
        ];

        let diff = plan(&release, &desired, &jobs);
        assert_eq!(diff.stop.len(), 2);
        assert!(diff.start.is_empty());
    }

    #[tokio::test]
    async fn reconcile_is_idempotent() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, _scheduler) = controller(runtime);
        let app = App::new("idem");
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=2"]).unwrap();

        let first = controller.reconcile(&app, &release, &desired);
        assert_eq!(first.started.len(), 2);
        let second = controller.reconcile(&app, &release, &desired);
        assert!(second.diff.is_empty());
    }

    #[test]
    fn plan_skips_jobs_already_stopping() {
        let app = App::new("plan");
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=0"]).unwrap();
        let mut leaving = job(&release, "web", JobState::Up);
        leaving.stop_requested = true;

        assert!(plan(&release, &desired, &[leaving]).is_empty());
    }

    #[tokio::test]
    async fn converge_brings_jobs_up_and_scales_down() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, scheduler) = controller(runtime);
        let app = App::new("converge");
        let release = release_with(&app, &["web"]);
        let cancel = CancellationToken::new();

        controller
            .converge(&app, &release, &Formation::parse(["web=2"]).unwrap(), &cancel)
            .await
            .unwrap();
        let up = scheduler
            .snapshot(app.id)
            .iter()
            .filter(|j| j.state == JobState::Up)
            .count();
        assert_eq!(up, 2);

        controller
            .converge(&app, &release, &Formation::parse(["web=0"]).unwrap(), &cancel)
            .await
            .unwrap();
        assert!(scheduler
            .snapshot(app.id)
            .iter()
            .all(|j| j.state == JobState::Down));
    }

    #[tokio::test]
    async fn converge_replaces_crashed_job() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, scheduler) = controller(Arc::clone(&runtime));
        let app = App::new("phoenix");
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=1"]).unwrap();
        let cancel = CancellationToken::new();

        controller.converge(&app, &release, &desired, &cancel).await.unwrap();
        let first = scheduler.snapshot(app.id)[0].id;
        runtime.exit(first, Some(137));
        scheduler.wait_finished(first).await;

        controller.converge(&app, &release, &desired, &cancel).await.unwrap();
        let jobs = scheduler.snapshot(app.id);
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].state, JobState::Crashed);
        assert_eq!(jobs[1].state, JobState::Up);
        assert_eq!(runtime.spawned(), 2);
    }

    #[test]
    fn settled_waits_for_jobs_in_flight() {
        let app = App::new("settle");
        let release = release_with(&app, &["web", "worker"]);
        let desired = Formation::parse(["web=1", "worker=1"]).unwrap();
        let failing = HashSet::from(["worker".to_string()]);

        let starting = vec![
            job(&release, "web", JobState::Up),
            job(&release, "worker", JobState::Starting),
        ];
        assert_eq!(settled(&release, &desired, &starting, &failing), None);

        let crashed = vec![
            job(&release, "web", JobState::Up),
            job(&release, "worker", JobState::Crashed),
        ];
        assert_eq!(
            settled(&release, &desired, &crashed, &failing),
            Some(vec!["worker".to_string()])
        );
        // A short type with no failed attempt is not settled
        assert_eq!(settled(&release, &desired, &crashed, &HashSet::new()), None);
    }

    #[test]
    fn settled_requires_old_release_gone() {
        let app = App::new("settle");
        let old = release_with(&app, &["web"]);
        let release = release_with(&app, &["web"]);
        let desired = Formation::parse(["web=1"]).unwrap();

        let jobs = vec![job(&old, "web", JobState::Up), job(&release, "web", JobState::Up)];
        assert_eq!(settled(&release, &desired, &jobs, &HashSet::new()), None);

        let jobs = vec![job(&old, "web", JobState::Down), job(&release, "web", JobState::Up)];
        assert_eq!(settled(&release, &desired, &jobs, &HashSet::new()), Some(vec![]));
    }

    #[tokio::test]
    async fn crashing_worker_does_not_fail_web() {
        let runtime = Arc::new(FakeRuntime::default().on("exit 1", Launch::Fail));
        let (controller, scheduler) = controller(Arc::clone(&runtime));
        let app = App::new("isolated");
        let release = release_running(&app, &[("web", "sleep 60"), ("worker", "exit 1")]);
        let desired = Formation::parse(["web=1", "worker=1"]).unwrap();

        let short = controller
            .converge(&app, &release, &desired, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(short, vec!["worker".to_string()]);

        let jobs = scheduler.snapshot(app.id);
        let web: Vec<&Job> = jobs.iter().filter(|j| j.process_type == "web").collect();
        assert_eq!(web.len(), 1);
        assert_eq!(web[0].state, JobState::Up);
    }

    #[tokio::test]
    async fn converge_settles_when_every_start_fails() {
        let runtime = Arc::new(FakeRuntime::failing());
        let (controller, _scheduler) = controller(runtime);
        let app = App::new("doomed");
        let release = release_with(&app, &["web"]);

        let short = controller
            .converge(
                &app,
                &release,
                &Formation::parse(["web=1"]).unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(short, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn placement_failure_is_reported_not_fatal() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, scheduler) = controller(runtime);
        let app = App::new("crowded");
        let release = release_with(&app, &["web", "worker"]);
        // One more than the per-app limit of 8
        let desired = Formation::parse(["web=1", "worker=8"]).unwrap();

        let short = controller
            .converge(&app, &release, &desired, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(short, vec!["worker".to_string()]);
        let up = scheduler
            .snapshot(app.id)
            .iter()
            .filter(|j| j.state == JobState::Up)
            .count();
        assert_eq!(up, 8);
    }

    #[tokio::test]
    async fn converge_times_out_while_launch_hangs() {
        let runtime = Arc::new(FakeRuntime::default().on("sleep 60", Launch::Hang));
        let (mut controller, scheduler) = controller(runtime);
        controller.config.converge_timeout_secs = 1;
        let app = App::new("hung");
        let release = release_with(&app, &["web"]);

        let err = controller
            .converge(
                &app,
                &release,
                &Formation::parse(["web=1"]).unwrap(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::ConvergenceTimeout { secs: 1, .. }));
        assert_eq!(controller.teardown(&app).await, 1);
        assert!(scheduler.snapshot(app.id).is_empty());
    }

    #[tokio::test]
    async fn supervise_keeps_restarting_until_cancelled() {
        let runtime = Arc::new(FakeRuntime::default().on("exit 1", Launch::Fail));
        let (controller, _scheduler) = controller(Arc::clone(&runtime));
        let app = App::new("flaky");
        let release = release_running(&app, &[("worker", "exit 1")]);
        let desired = Formation::parse(["worker=1"]).unwrap();
        let cancel = CancellationToken::new();

        let task = {
            let (controller, app, cancel) = (controller.clone(), app.clone(), cancel.clone());
            tokio::spawn(async move { controller.supervise(&app, &release, &desired, &cancel).await })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while runtime.attempts() < 3 {
            assert!(Instant::now() < deadline, "supervisor stopped restarting");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn supervise_returns_once_formation_is_met() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, scheduler) = controller(runtime);
        let app = App::new("steady");
        let release = release_with(&app, &["web"]);

        controller
            .supervise(
                &app,
                &release,
                &Formation::parse(["web=2"]).unwrap(),
                &CancellationToken::new(),
            )
            .await;
        let up = scheduler
            .snapshot(app.id)
            .iter()
            .filter(|j| j.state == JobState::Up)
            .count();
        assert_eq!(up, 2);
    }

    #[tokio::test]
    async fn converge_honors_cancel() {
        let runtime = Arc::new(FakeRuntime::failing());
        let (controller, _scheduler) = controller(runtime);
        let app = App::new("cancelled");
        let release = release_with(&app, &["web"]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = controller
            .converge(&app, &release, &Formation::parse(["web=1"]).unwrap(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::BuildCancelled(_)));
    }

    #[tokio::test]
    async fn empty_formation_converges_immediately() {
        let runtime = Arc::new(FakeRuntime::default());
        let (controller, _scheduler) = controller(runtime);
        let app = App::new("empty-release");
        let release = release_with(&app, &[]);

        controller
            .converge(&app, &release, &Formation::new(), &CancellationToken::new())
            .await
            .unwrap();
    }
}

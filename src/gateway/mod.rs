//! Push gateway
//!
//! Entry point for pushes and the other app operations. A push runs
//! build, release and deploy in order under the app's lock and reports
//! progress to a [`Transcript`]. A release becomes visible once every job
//! of its formation has been placed and settled. Build and release
//! failures leave the previous release current. Jobs that crash or cannot
//! be placed do not fail the push; a background supervisor keeps
//! replacing them until the next push, scale or delete of the app.

pub mod locks;

pub use locks::AppLocks;

use crate::apps::{App, AppRegistry};
use crate::artifact::{format_bytes, ArtifactStore, FsArtifactStore};
use crate::audit::{AuditEvent, AuditLog};
use crate::build::{BuildpackRegistry, Builder, SourceTree};
use crate::cache::BuildCacheManager;
use crate::config::schema::{BusyPolicy, Config};
use crate::config::StateLayout;
use crate::error::{ShipyardError, ShipyardResult};
use crate::events::{EventFilter, EventStream, Subscription};
use crate::formation::FormationController;
use crate::release::{Formation, Release, ReleaseManager};
use crate::scheduler::{Job, JobRuntime, JobScheduler, ProcessRuntime};
use crate::transcript::Transcript;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Result of a successful push
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub release: Release,
    pub formation: Formation,
    pub cache_hit: bool,
    /// Process types short of their count, still being restarted
    pub recovering: Vec<String>,
}

/// Background pass replacing an app's failed jobs
struct Supervisor {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Orchestrates builder, release manager and formation controller
pub struct PushGateway {
    on_busy: BusyPolicy,
    apps: AppRegistry,
    cache: Arc<BuildCacheManager>,
    builder: Builder,
    releases: ReleaseManager,
    scheduler: JobScheduler,
    controller: FormationController,
    events: Arc<EventStream>,
    locks: AppLocks,
    in_flight: Mutex<HashMap<Uuid, CancellationToken>>,
    supervisors: Mutex<HashMap<Uuid, Supervisor>>,
    shutdown: CancellationToken,
    audit: AuditLog,
}

impl PushGateway {
    /// Open the gateway over a state directory, running jobs as local processes
    pub async fn open(config: &Config, layout: &StateLayout) -> ShipyardResult<Self> {
        let store: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(layout.artifacts_dir()));
        let runtime = Arc::new(ProcessRuntime::new(layout.jobs_dir(), Arc::clone(&store)));
        Self::with_runtime(config, layout, store, runtime).await
    }

    /// Open the gateway with an explicit store and job runtime
    pub async fn with_runtime(
        config: &Config,
        layout: &StateLayout,
        store: Arc<dyn ArtifactStore>,
        runtime: Arc<dyn JobRuntime>,
    ) -> ShipyardResult<Self> {
        layout.ensure().await?;

        let apps = AppRegistry::open(layout.apps_dir()).await?;
        let cache = Arc::new(BuildCacheManager::new(
            Arc::clone(&store),
            Some(layout.cache_dir()),
            config.build.cache_enabled,
        ));
        let builder = Builder::new(
            Arc::clone(&cache),
            Arc::clone(&store),
            BuildpackRegistry::from_config(&config.build),
            layout.builds_dir(),
            Duration::from_secs(config.build.compile_timeout_secs),
        );
        let events = Arc::new(EventStream::new(&config.events));
        let scheduler = JobScheduler::new(runtime, Arc::clone(&events), config.scheduler.clone());
        let controller = FormationController::new(
            scheduler.clone(),
            Arc::clone(&events),
            config.formation.clone(),
        );

        Ok(Self {
            on_busy: config.gateway.on_busy,
            apps,
            cache,
            builder,
            releases: ReleaseManager::new(Some(layout.releases_dir())),
            scheduler,
            controller,
            events,
            locks: AppLocks::new(),
            in_flight: Mutex::new(HashMap::new()),
            supervisors: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            audit: AuditLog::new(config, layout),
        })
    }

    /// Register a cancellable operation for an app
    fn begin(&self, app_id: Uuid) -> CancellationToken {
        let token = self.shutdown.child_token();
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app_id, token.clone());
        token
    }

    fn finish(&self, app_id: Uuid) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
    }

    fn cancel_in_flight(&self, app_id: Uuid) {
        if let Some(token) = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&app_id)
        {
            token.cancel();
        }
    }

    /// Keep replacing failed jobs of `release` in the background
    fn supervise(&self, app: &App, release: &Release, formation: &Formation) {
        let cancel = self.shutdown.child_token();
        let task = {
            let controller = self.controller.clone();
            let (app, release, formation) = (app.clone(), release.clone(), formation.clone());
            let cancel = cancel.clone();
            tokio::spawn(async move {
                controller.supervise(&app, &release, &formation, &cancel).await;
            })
        };

        let replaced = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(app.id, Supervisor { cancel, task });
        if let Some(old) = replaced {
            old.cancel.cancel();
        }
        debug!("Supervising {} v{}", app.name, release.version);
    }

    /// Cancel an app's supervisor and wait until it has stopped issuing starts
    async fn stop_supervising(&self, app_id: Uuid) {
        let supervisor = self
            .supervisors
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&app_id);
        if let Some(supervisor) = supervisor {
            supervisor.cancel.cancel();
            if let Err(e) = supervisor.task.await {
                warn!("Supervisor for app {} ended abnormally: {}", app_id, e);
            }
        }
    }

    /// Re-read an app after waiting for its lock
    async fn still_current(&self, app: &App) -> ShipyardResult<App> {
        let current = self.apps.get(&app.name).await?;
        if current.id != app.id {
            return Err(ShipyardError::AppNotFound(app.name.clone()));
        }
        Ok(current)
    }

    pub async fn create_app(&self, name: &str) -> ShipyardResult<App> {
        let app = self.apps.create(name).await?;
        self.audit.record(&app, AuditEvent::AppCreated).await;
        Ok(app)
    }

    /// Delete an app, cancelling any push in flight and stopping its jobs
    pub async fn delete_app(&self, name: &str) -> ShipyardResult<()> {
        let app = self.apps.get(name).await?;
        self.cancel_in_flight(app.id);

        let guard = self.locks.acquire(app.id).await;
        self.stop_supervising(app.id).await;
        let stopped = self.controller.teardown(&app).await;
        self.cache.clear(app.id).await?;
        self.releases.clear(app.id).await?;
        self.events.close(app.id);
        self.apps.delete(name).await?;
        drop(guard);
        self.locks.remove(app.id);

        info!("Deleted app {} ({} jobs stopped)", name, stopped);
        self.audit
            .record(
                &app,
                AuditEvent::AppDeleted {
                    jobs_stopped: stopped,
                },
            )
            .await;
        Ok(())
    }

    pub async fn app(&self, name: &str) -> ShipyardResult<App> {
        self.apps.get(name).await
    }

    pub async fn list_apps(&self) -> Vec<App> {
        self.apps.list().await
    }

    /// Set env vars; they apply from the next push
    pub async fn set_env(&self, name: &str, vars: Vec<(String, String)>) -> ShipyardResult<App> {
        self.apps.set_env(name, vars).await
    }

    pub async fn unset_env(&self, name: &str, keys: &[String]) -> ShipyardResult<App> {
        self.apps.unset_env(name, keys).await
    }

    /// Build, release and deploy `source` for an app
    pub async fn push(
        &self,
        name: &str,
        source: &Path,
        transcript: &Transcript,
    ) -> ShipyardResult<PushOutcome> {
        let app = self.apps.get(name).await?;

        let _guard = match self.on_busy {
            BusyPolicy::Reject => self
                .locks
                .try_acquire(app.id)
                .ok_or_else(|| ShipyardError::BuildInProgress(app.name.clone()))?,
            BusyPolicy::Queue => match self.locks.try_acquire(app.id) {
                Some(guard) => guard,
                None => {
                    transcript.step("Waiting for the running push to finish...");
                    self.locks.acquire(app.id).await
                }
            },
        };
        let app = self.still_current(&app).await?;

        let cancel = self.begin(app.id);
        let result = self.run_pipeline(&app, source, &cancel, transcript).await;
        self.finish(app.id);

        let event = match &result {
            Ok(outcome) => AuditEvent::Deployed {
                version: outcome.release.version,
                artifact: outcome.release.artifact.to_string(),
                formation: outcome.formation.clone(),
                cache_hit: outcome.cache_hit,
                recovering: outcome.recovering.clone(),
            },
            Err(e) => AuditEvent::DeployFailed {
                error: e.to_string(),
            },
        };
        self.audit.record(&app, event).await;
        result
    }

    async fn run_pipeline(
        &self,
        app: &App,
        source: &Path,
        cancel: &CancellationToken,
        transcript: &Transcript,
    ) -> ShipyardResult<PushOutcome> {
        let tree = SourceTree::open(source)?;
        self.stop_supervising(app.id).await;
        transcript.step(format!("Building {}...", app.name));

        let build = self.builder.build(app, &tree, cancel, transcript).await?;
        transcript.step(format!(
            "Compiled slug size is {}",
            format_bytes(build.artifact.size)
        ));

        transcript.step("Creating release...");
        let previous = self.releases.latest(app.id).await?;
        let plan = self
            .releases
            .prepare(
                app,
                build.artifact.clone(),
                build.buildpack.clone(),
                build.processes.clone(),
                None,
            )
            .await?;
        if plan.default_formation_added {
            transcript.notice("Added default web=1 formation");
        }

        transcript.step(format!(
            "Deploying v{} ({})",
            plan.release.version, plan.formation
        ));
        let deployed = match self
            .controller
            .converge(app, &plan.release, &plan.formation, cancel)
            .await
        {
            Ok(short) => self.releases.publish(&plan).await.map(|release| (release, short)),
            Err(e) => Err(e),
        };
        let (release, recovering) = match deployed {
            Ok(deployed) => deployed,
            // Delete or shutdown owns the jobs from here
            Err(e @ ShipyardError::BuildCancelled(_)) => return Err(e),
            Err(e) => {
                self.roll_back(app, previous.as_ref(), cancel, transcript).await;
                return Err(e);
            }
        };

        if !recovering.is_empty() {
            let short: Vec<String> = recovering
                .iter()
                .map(|t| format!("{}={}", t, plan.formation.get(t)))
                .collect();
            transcript.notice(format!(
                "{} not up yet, restarting in the background",
                short.join(" ")
            ));
            self.supervise(app, &release, &plan.formation);
        }

        transcript.notice("Application deployed");
        Ok(PushOutcome {
            release,
            formation: plan.formation,
            cache_hit: build.cache.is_hit(),
            recovering,
        })
    }

    /// Return jobs to the previous release, or stop them all
    ///
    /// Runs under the push's `cancel`, so a delete arriving mid-rollback
    /// stops it from starting jobs again.
    async fn roll_back(
        &self,
        app: &App,
        previous: Option<&Release>,
        cancel: &CancellationToken,
        transcript: &Transcript,
    ) {
        let Some(previous) = previous else {
            self.controller.teardown(app).await;
            return;
        };

        transcript.step(format!("Rolling back to v{}", previous.version));
        let formation = match self.releases.formation(app.id).await {
            Ok(formation) => formation,
            Err(e) => {
                warn!("Rollback for {}: {}", app.name, e);
                self.controller.teardown(app).await;
                return;
            }
        };

        match self
            .controller
            .converge(app, previous, &formation, cancel)
            .await
        {
            Ok(short) if short.is_empty() => {}
            Ok(_) => self.supervise(app, previous, &formation),
            Err(e) => warn!("Rollback for {} did not converge: {}", app.name, e),
        }
    }

    /// Run a one-off command against the latest release
    pub async fn run(
        &self,
        name: &str,
        command: Vec<String>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<i32> {
        let app = self.apps.get(name).await?;
        let release = self
            .releases
            .latest(app.id)
            .await?
            .ok_or_else(|| ShipyardError::NoRelease(app.name.clone()))?;
        self.scheduler
            .run_once(&app, &release, command, on_output)
            .await
    }

    /// Change desired counts and converge; never rebuilds
    ///
    /// Process types that fail to come up are left to a background
    /// supervisor, as after a push.
    pub async fn scale(&self, name: &str, changes: &Formation) -> ShipyardResult<(Release, Formation)> {
        let app = self.apps.get(name).await?;
        let _guard = self.locks.acquire(app.id).await;
        let app = self.still_current(&app).await?;
        self.stop_supervising(app.id).await;

        let (release, formation) = self.releases.scale(&app, changes).await?;
        self.audit
            .record(
                &app,
                AuditEvent::Scaled {
                    version: release.version,
                    formation: formation.clone(),
                },
            )
            .await;

        let cancel = self.begin(app.id);
        let result = self
            .controller
            .converge(&app, &release, &formation, &cancel)
            .await;
        self.finish(app.id);
        if !result?.is_empty() {
            self.supervise(&app, &release, &formation);
        }

        Ok((release, formation))
    }

    /// Jobs of an app known to this process
    pub async fn ps(&self, name: &str) -> ShipyardResult<Vec<Job>> {
        let app = self.apps.get(name).await?;
        Ok(self.scheduler.snapshot(app.id))
    }

    pub async fn releases(&self, name: &str) -> ShipyardResult<Vec<Release>> {
        let app = self.apps.get(name).await?;
        self.releases.list(app.id).await
    }

    pub async fn formation(&self, name: &str) -> ShipyardResult<Formation> {
        let app = self.apps.get(name).await?;
        self.releases.formation(app.id).await
    }

    /// Watch an app's job events from now on
    pub async fn subscribe(&self, name: &str, filter: EventFilter) -> ShipyardResult<Subscription> {
        let app = self.apps.get(name).await?;
        Ok(self.events.subscribe(app.id, filter))
    }

    pub fn runtime_name(&self) -> &'static str {
        self.scheduler.runtime_name()
    }

    /// Cancel in-flight builds and deploys; running jobs are left alone
    pub fn interrupt(&self) {
        self.shutdown.cancel();
    }

    /// Cancel in-flight work and supervisors, then stop every job
    pub async fn shutdown(&self) {
        self.interrupt();
        for app in self.apps.list().await {
            self.stop_supervising(app.id).await;
            self.controller.teardown(&app).await;
        }
    }
}

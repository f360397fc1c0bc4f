//! In-memory runtime for scheduler and formation tests

use crate::apps::App;
use crate::artifact::ArtifactRef;
use crate::error::{ShipyardError, ShipyardResult};
use crate::release::Release;
use crate::scheduler::runtime::{JobCommand, JobHandle, JobRuntime, JobSpec};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

type ExitSender = Arc<watch::Sender<Option<Option<i32>>>>;

/// How a launch of a given command behaves
#[derive(Debug, Clone, Copy)]
pub(crate) enum Launch {
    /// Spawn fails, so the job crashes while starting
    Fail,
    /// Spawn never completes, so the job stays starting
    Hang,
}

/// Jobs run until told to exit or terminated
#[derive(Default)]
pub(crate) struct FakeRuntime {
    fail_spawn: bool,
    launches: HashMap<String, Launch>,
    attempts: AtomicUsize,
    exits: Mutex<HashMap<Uuid, ExitSender>>,
}

impl FakeRuntime {
    pub(crate) fn failing() -> Self {
        Self {
            fail_spawn: true,
            ..Self::default()
        }
    }

    /// Give jobs running the shell line `command` a launch behaviour
    pub(crate) fn on(mut self, command: &str, launch: Launch) -> Self {
        self.launches.insert(command.to_string(), launch);
        self
    }

    /// Spawns attempted, including failed ones
    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Make a running job exit with `code`
    pub(crate) fn exit(&self, job_id: Uuid, code: Option<i32>) {
        if let Some(tx) = self.exits.lock().unwrap().get(&job_id) {
            tx.send_replace(Some(code));
        }
    }

    pub(crate) fn spawned(&self) -> usize {
        self.exits.lock().unwrap().len()
    }
}

struct FakeHandle {
    tx: ExitSender,
    rx: watch::Receiver<Option<Option<i32>>>,
}

#[async_trait]
impl JobHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    async fn wait(&mut self) -> ShipyardResult<Option<i32>> {
        let exit = *self
            .rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| ShipyardError::Internal("fake job sender dropped".into()))?;
        Ok(exit.flatten())
    }

    fn terminate(&mut self) -> ShipyardResult<()> {
        self.tx.send_replace(Some(None));
        Ok(())
    }

    fn kill(&mut self) -> ShipyardResult<()> {
        self.terminate()
    }
}

#[async_trait]
impl JobRuntime for FakeRuntime {
    async fn spawn(&self, spec: &JobSpec) -> ShipyardResult<Box<dyn JobHandle>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let launch = match &spec.command {
            JobCommand::Shell(line) => self.launches.get(line).copied(),
            JobCommand::Argv(_) => None,
        };
        match launch {
            _ if self.fail_spawn => return Err(ShipyardError::Internal("no capacity".into())),
            Some(Launch::Fail) => {
                return Err(ShipyardError::Internal(format!("{:?} failed", spec.command)))
            }
            Some(Launch::Hang) => std::future::pending::<()>().await,
            None => {}
        }
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);
        self.exits.lock().unwrap().insert(spec.job_id, Arc::clone(&tx));
        Ok(Box::new(FakeHandle { tx, rx }))
    }

    async fn run_once(
        &self,
        spec: &JobSpec,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<i32> {
        on_output(format!("ran {:?}", spec.command));
        Ok(0)
    }

    fn runtime_name(&self) -> &'static str {
        "fake"
    }
}

/// A release declaring `types`, each running `sleep 60`
pub(crate) fn release_with(app: &App, types: &[&str]) -> Release {
    let processes: Vec<(&str, &str)> = types.iter().map(|t| (*t, "sleep 60")).collect();
    release_running(app, &processes)
}

/// A release declaring each `(process type, command)` pair
pub(crate) fn release_running(app: &App, processes: &[(&str, &str)]) -> Release {
    Release {
        id: Uuid::new_v4(),
        app_id: app.id,
        version: 1,
        artifact: ArtifactRef::for_bytes(b"slug"),
        buildpack: "test".to_string(),
        env: app.env.clone(),
        processes: processes
            .iter()
            .map(|(t, command)| (t.to_string(), command.to_string()))
            .collect(),
        created_at: Utc::now(),
    }
}

//! Job runtime abstraction
//!
//! The scheduler owns job state; a runtime only knows how to launch a
//! slug and signal the resulting process.

use crate::artifact::{unpack_into, ArtifactRef, ArtifactStore};
use crate::error::{ShipyardError, ShipyardResult};
use crate::exec::stream_child_output;
use crate::scheduler::job::short_id;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tracing::{debug, warn};
use uuid::Uuid;

/// What a job executes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobCommand {
    /// A Procfile command line, run through `sh -c`
    Shell(String),
    /// An argument vector, run directly
    Argv(Vec<String>),
}

impl JobCommand {
    fn display(&self) -> String {
        match self {
            JobCommand::Shell(line) => line.clone(),
            JobCommand::Argv(args) => args.join(" "),
        }
    }
}

/// Everything needed to launch one job
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub job_id: Uuid,
    pub app_name: String,
    pub process_type: String,
    pub artifact: ArtifactRef,
    pub command: JobCommand,
    pub env: BTreeMap<String, String>,
    pub port: Option<u16>,
}

/// A launched job process
#[async_trait]
pub trait JobHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for exit; `None` when terminated by a signal
    async fn wait(&mut self) -> ShipyardResult<Option<i32>>;

    /// Ask the process to shut down
    fn terminate(&mut self) -> ShipyardResult<()>;

    /// Kill the process without waiting for it to shut down
    fn kill(&mut self) -> ShipyardResult<()>;
}

/// Launches jobs from slugs
#[async_trait]
pub trait JobRuntime: Send + Sync {
    /// Start a long-running job
    async fn spawn(&self, spec: &JobSpec) -> ShipyardResult<Box<dyn JobHandle>>;

    /// Run a job to completion, streaming its output; returns the exit code
    async fn run_once(
        &self,
        spec: &JobSpec,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<i32>;

    /// Human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}

/// Runs jobs as local processes in per-job unpacked slug directories
pub struct ProcessRuntime {
    root: PathBuf,
    store: Arc<dyn ArtifactStore>,
}

impl ProcessRuntime {
    pub fn new(root: impl Into<PathBuf>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            root: root.into(),
            store,
        }
    }

    fn job_dir(&self, job_id: Uuid) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn log_path(&self, job_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.log", job_id))
    }

    async fn prepare(&self, spec: &JobSpec) -> ShipyardResult<PathBuf> {
        let dir = self.job_dir(spec.job_id);
        let slug = self.store.get(&spec.artifact).await?;
        let dest = dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&dest)
                .map_err(|e| ShipyardError::io(format!("creating {}", dest.display()), e))?;
            unpack_into(&slug, &dest)
        })
        .await
        .map_err(|e| ShipyardError::Internal(format!("unpack task failed: {}", e)))??;
        Ok(dir)
    }

    fn command(&self, spec: &JobSpec, dir: &Path) -> ShipyardResult<Command> {
        let mut cmd = match &spec.command {
            JobCommand::Shell(line) => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c").arg(line);
                cmd
            }
            JobCommand::Argv(args) => {
                let (program, rest) = args
                    .split_first()
                    .ok_or_else(|| ShipyardError::User("no command given".to_string()))?;
                let mut cmd = Command::new(program);
                cmd.args(rest);
                cmd
            }
        };

        cmd.current_dir(dir)
            .envs(&spec.env)
            .env("HOME", dir)
            .env("PS", format!("{}.{}", spec.process_type, short_id(spec.job_id)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(port) = spec.port {
            cmd.env("PORT", port.to_string());
        }
        Ok(cmd)
    }
}

/// Handle over a local child process; its directory and log go with it
struct ProcessHandle {
    child: Child,
    dir: PathBuf,
    log: PathBuf,
}

#[async_trait]
impl JobHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> ShipyardResult<Option<i32>> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| ShipyardError::io("waiting for job process", e))?;
        Ok(status.code())
    }

    fn terminate(&mut self) -> ShipyardResult<()> {
        let Some(pid) = self.child.id() else {
            return Ok(());
        };

        #[cfg(unix)]
        {
            // SAFETY: kill(2) has no memory effects; pid came from our own child
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                return Err(ShipyardError::io(
                    format!("signalling job process {}", pid),
                    std::io::Error::last_os_error(),
                ));
            }
            Ok(())
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            self.kill()
        }
    }

    fn kill(&mut self) -> ShipyardResult<()> {
        if self.child.id().is_none() {
            return Ok(());
        }
        self.child
            .start_kill()
            .map_err(|e| ShipyardError::io("killing job process", e))
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.dir) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove job directory {}: {}", self.dir.display(), e);
            }
        }
        if let Err(e) = std::fs::remove_file(&self.log) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove job log {}: {}", self.log.display(), e);
            }
        }
    }
}

#[async_trait]
impl JobRuntime for ProcessRuntime {
    async fn spawn(&self, spec: &JobSpec) -> ShipyardResult<Box<dyn JobHandle>> {
        let dir = self.prepare(spec).await?;

        let log_path = self.log_path(spec.job_id);
        let log = std::fs::File::create(&log_path)
            .map_err(|e| ShipyardError::io(format!("creating {}", log_path.display()), e))?;
        let log_err = log
            .try_clone()
            .map_err(|e| ShipyardError::io("duplicating job log handle", e))?;

        let mut cmd = self.command(spec, &dir)?;
        cmd.stdout(Stdio::from(log)).stderr(Stdio::from(log_err));

        debug!(
            "Spawning {} job {} for {}: {}",
            spec.process_type,
            spec.job_id,
            spec.app_name,
            spec.command.display()
        );
        let child = cmd
            .spawn()
            .map_err(|e| ShipyardError::command_failed(spec.command.display(), e))?;

        Ok(Box::new(ProcessHandle {
            child,
            dir,
            log: log_path,
        }))
    }

    async fn run_once(
        &self,
        spec: &JobSpec,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<i32> {
        let dir = self.prepare(spec).await?;

        let mut cmd = self.command(spec, &dir)?;
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!("Running one-off for {}: {}", spec.app_name, spec.command.display());

        let mut child = cmd
            .spawn()
            .map_err(|e| ShipyardError::command_failed(spec.command.display(), e))?;

        stream_child_output(&mut child, on_output).await;
        let status = child
            .wait()
            .await
            .map_err(|e| ShipyardError::io("waiting for one-off process", e))?;

        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            warn!("Failed to remove job directory {}: {}", dir.display(), e);
        }

        // Signal deaths follow the shell convention of 128 + signal
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Ok(128 + signal);
            }
        }
        Ok(status.code().unwrap_or(1))
    }

    fn runtime_name(&self) -> &'static str {
        "local process"
    }
}

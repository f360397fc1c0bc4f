//! Buildpack abstraction
//!
//! Buildpacks are external tools: `bin/detect <build-dir>` decides whether
//! a tree is theirs, `bin/compile <build-dir> <cache-dir> <env-dir>` turns
//! it into a runnable slug. The pipeline only sees success or failure.

use crate::config::schema::BuildConfig;
use crate::error::{ShipyardError, ShipyardResult};
use crate::exec::stream_child_output;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::debug;

/// Buildpack that runs the pushed tree's own `bin/compile`
pub const INLINE_BUILDPACK_URL: &str = "https://github.com/kr/heroku-buildpack-inline";

/// App env var selecting a buildpack explicitly
pub const BUILDPACK_URL_VAR: &str = "BUILDPACK_URL";

/// Directories handed to a compile
#[derive(Debug)]
pub struct CompileContext<'a> {
    pub build_dir: &'a Path,
    pub cache_dir: &'a Path,
    pub env_dir: &'a Path,
}

/// External build tool
#[async_trait]
pub trait Buildpack: Send + Sync {
    /// URL identifying this buildpack; also the cache key component
    fn url(&self) -> &str;

    /// Human-readable name for transcripts
    fn name(&self) -> &str;

    /// Whether this buildpack can build the tree
    async fn detect(&self, build_dir: &Path) -> ShipyardResult<bool>;

    /// Compile the tree in place
    async fn compile(
        &self,
        ctx: &CompileContext<'_>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<()>;
}

/// Run a buildpack script, streaming its output
async fn run_script(
    script: &Path,
    args: &[&Path],
    cwd: &Path,
    on_output: &(dyn Fn(String) + Send + Sync),
) -> ShipyardResult<()> {
    debug!("Executing: {} {:?}", script.display(), args);

    let mut child = Command::new(script)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ShipyardError::command_failed(script.display().to_string(), e))?;

    stream_child_output(&mut child, on_output).await;
    let status = child
        .wait()
        .await
        .map_err(|e| ShipyardError::command_failed(script.display().to_string(), e))?;

    if status.success() {
        Ok(())
    } else {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| script.display().to_string());
        Err(ShipyardError::BuildFailure(match status.code() {
            Some(code) => format!("{} exited with status {}", name, code),
            None => format!("{} terminated by signal", name),
        }))
    }
}

/// Buildpack installed as a directory with `bin/detect` and `bin/compile`
pub struct ScriptBuildpack {
    url: String,
    name: String,
    dir: PathBuf,
}

impl ScriptBuildpack {
    pub fn new(url: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let url = url.into();
        let dir = dir.into();
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| url.clone());
        Self { url, name, dir }
    }
}

#[async_trait]
impl Buildpack for ScriptBuildpack {
    fn url(&self) -> &str {
        &self.url
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn detect(&self, build_dir: &Path) -> ShipyardResult<bool> {
        let script = self.dir.join("bin/detect");
        if !script.is_file() {
            return Ok(false);
        }

        let status = Command::new(&script)
            .arg(build_dir)
            .current_dir(build_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| ShipyardError::command_failed(script.display().to_string(), e))?;
        Ok(status.success())
    }

    async fn compile(
        &self,
        ctx: &CompileContext<'_>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<()> {
        let script = self.dir.join("bin/compile");
        run_script(
            &script,
            &[ctx.build_dir, ctx.cache_dir, ctx.env_dir],
            ctx.build_dir,
            on_output,
        )
        .await
    }
}

/// Runs `bin/compile` shipped inside the pushed tree, if it has one
pub struct InlineBuildpack;

#[async_trait]
impl Buildpack for InlineBuildpack {
    fn url(&self) -> &str {
        INLINE_BUILDPACK_URL
    }

    fn name(&self) -> &str {
        "inline"
    }

    async fn detect(&self, build_dir: &Path) -> ShipyardResult<bool> {
        Ok(build_dir.join("bin/compile").is_file())
    }

    async fn compile(
        &self,
        ctx: &CompileContext<'_>,
        on_output: &(dyn Fn(String) + Send + Sync),
    ) -> ShipyardResult<()> {
        let script = ctx.build_dir.join("bin/compile");
        if !script.is_file() {
            debug!("Inline buildpack: no bin/compile, nothing to do");
            return Ok(());
        }
        run_script(
            &script,
            &[ctx.build_dir, ctx.cache_dir, ctx.env_dir],
            ctx.build_dir,
            on_output,
        )
        .await
    }
}

/// Strip fragments, `.git` suffixes and trailing slashes
fn normalize_url(url: &str) -> &str {
    let url = url.split('#').next().unwrap_or(url);
    let url = url.trim_end_matches('/');
    url.strip_suffix(".git").unwrap_or(url)
}

/// Known buildpacks in detection order
pub struct BuildpackRegistry {
    buildpacks: Vec<Arc<dyn Buildpack>>,
    default_url: Option<String>,
}

impl BuildpackRegistry {
    pub fn new(buildpacks: Vec<Arc<dyn Buildpack>>, default_url: Option<String>) -> Self {
        Self {
            buildpacks,
            default_url,
        }
    }

    /// Configured script buildpacks followed by the inline buildpack
    pub fn from_config(config: &BuildConfig) -> Self {
        let mut buildpacks: Vec<Arc<dyn Buildpack>> = config
            .buildpacks
            .iter()
            .map(|entry| {
                Arc::new(ScriptBuildpack::new(entry.url.clone(), entry.path.clone()))
                    as Arc<dyn Buildpack>
            })
            .collect();
        buildpacks.push(Arc::new(InlineBuildpack));
        Self::new(buildpacks, config.default_buildpack_url.clone())
    }

    /// Find a buildpack by URL
    pub fn by_url(&self, url: &str) -> Option<Arc<dyn Buildpack>> {
        let wanted = normalize_url(url);
        self.buildpacks
            .iter()
            .find(|bp| normalize_url(bp.url()) == wanted)
            .cloned()
    }

    /// Pick the buildpack for a build
    ///
    /// `BUILDPACK_URL` wins, then the configured default, then the first
    /// buildpack whose detect accepts the tree.
    pub async fn select(
        &self,
        env: &BTreeMap<String, String>,
        build_dir: &Path,
    ) -> ShipyardResult<Arc<dyn Buildpack>> {
        let explicit = env
            .get(BUILDPACK_URL_VAR)
            .or(self.default_url.as_ref());
        if let Some(url) = explicit {
            return self
                .by_url(url)
                .ok_or_else(|| ShipyardError::UnknownBuildpack(url.clone()));
        }

        for buildpack in &self.buildpacks {
            if buildpack.detect(build_dir).await? {
                debug!("Detected buildpack {}", buildpack.name());
                return Ok(Arc::clone(buildpack));
            }
        }

        Err(ShipyardError::NoBuildpackDetected)
    }
}

//! Builder: source tree + cache layers + buildpack -> slug

use crate::apps::App;
use crate::artifact::{pack_dir, unpack_into, ArtifactRef, ArtifactStore};
use crate::build::buildpack::{BuildpackRegistry, CompileContext};
use crate::build::procfile::{self, ProcessTypes};
use crate::build::source::{AppManifest, SourceTree};
use crate::cache::{detect_manifests, BuildCacheManager, CacheOutcome, CacheResolution, Fingerprint};
use crate::error::{ShipyardError, ShipyardResult};
use crate::transcript::Transcript;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A successful build
#[derive(Debug, Clone)]
pub struct BuildOutput {
    /// The packed slug
    pub artifact: ArtifactRef,
    /// URL of the buildpack that compiled it
    pub buildpack: String,
    /// Process types declared by the slug's Procfile
    pub processes: ProcessTypes,
    /// How the build cache was used
    pub cache: CacheResolution,
}

/// Runs buildpacks against pushed source
pub struct Builder {
    cache: Arc<BuildCacheManager>,
    store: Arc<dyn ArtifactStore>,
    registry: BuildpackRegistry,
    work_dir: PathBuf,
    compile_timeout: Duration,
}

async fn blocking<T, F>(f: F) -> ShipyardResult<T>
where
    F: FnOnce() -> ShipyardResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ShipyardError::Internal(format!("blocking task failed: {}", e)))?
}

/// Write one file per variable, the layout buildpacks expect in ENV_DIR
async fn write_env_dir(env_dir: &Path, env: &BTreeMap<String, String>) -> ShipyardResult<()> {
    for (key, value) in env {
        if key.is_empty() || key.contains('/') || key.starts_with('.') {
            continue;
        }
        let path = env_dir.join(key);
        tokio::fs::write(&path, value)
            .await
            .map_err(|e| ShipyardError::io(format!("writing env var {}", key), e))?;
    }
    Ok(())
}

impl Builder {
    pub fn new(
        cache: Arc<BuildCacheManager>,
        store: Arc<dyn ArtifactStore>,
        registry: BuildpackRegistry,
        work_dir: PathBuf,
        compile_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            store,
            registry,
            work_dir,
            compile_timeout,
        }
    }

    /// Build a slug from `source`
    ///
    /// Failures are returned as-is and never retried. Nothing is stored or
    /// cached if `cancel` fires before the compile finishes.
    pub async fn build(
        &self,
        app: &App,
        source: &SourceTree,
        cancel: &CancellationToken,
        transcript: &Transcript,
    ) -> ShipyardResult<BuildOutput> {
        let cancelled = || ShipyardError::BuildCancelled(app.name.clone());

        tokio::fs::create_dir_all(&self.work_dir)
            .await
            .map_err(|e| ShipyardError::io(format!("creating {}", self.work_dir.display()), e))?;
        let scratch = tempfile::Builder::new()
            .prefix(&format!("{}-", app.name))
            .tempdir_in(&self.work_dir)
            .map_err(|e| ShipyardError::io("creating build directory", e))?;

        let build_dir = scratch.path().join("app");
        let cache_dir = scratch.path().join("cache");
        let env_dir = scratch.path().join("env");
        for dir in [&cache_dir, &env_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| ShipyardError::io(format!("creating {}", dir.display()), e))?;
        }

        let src = source.clone();
        let dest = build_dir.clone();
        let copied = blocking(move || src.copy_into(&dest)).await?;
        debug!("Copied {} files into {}", copied, build_dir.display());

        let manifest_dir = build_dir.clone();
        if let Some(manifest) = blocking(move || AppManifest::load(&manifest_dir)).await? {
            let missing = manifest.missing_bindings(&app.env);
            if !missing.is_empty() {
                return Err(ShipyardError::MissingResourceBinding(missing.join(", ")));
            }
        }

        let buildpack = self.registry.select(&app.env, &build_dir).await?;
        transcript.step(format!("{} app detected", buildpack.name()));

        let fingerprint_dir = build_dir.clone();
        let fingerprint = blocking(move || {
            detect_manifests(&fingerprint_dir).map(|m| Fingerprint::of_manifests(&m))
        })
        .await?;
        let resolution = self
            .cache
            .resolve(app.id, buildpack.url(), &fingerprint)
            .await?;
        transcript.step(resolution.summary());

        if let CacheOutcome::Hit { contents, .. } = &resolution.outcome {
            let contents = contents.clone();
            let dest = cache_dir.clone();
            blocking(move || unpack_into(&contents, &dest)).await?;
        }

        write_env_dir(&env_dir, &app.env).await?;

        let ctx = CompileContext {
            build_dir: &build_dir,
            cache_dir: &cache_dir,
            env_dir: &env_dir,
        };
        let on_output = |line: String| transcript.output(line);
        let compiled = tokio::select! {
            _ = cancel.cancelled() => Err(cancelled()),
            result = tokio::time::timeout(self.compile_timeout, buildpack.compile(&ctx, &on_output)) => {
                result.unwrap_or_else(|_| {
                    Err(ShipyardError::BuildFailure(format!(
                        "compile timed out after {}s",
                        self.compile_timeout.as_secs()
                    )))
                })
            }
        };
        compiled?;

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let slug_dir = build_dir.clone();
        let (slug, processes) = blocking(move || {
            let processes = procfile::load(&slug_dir)?;
            Ok((pack_dir(&slug_dir)?, processes))
        })
        .await?;
        let layers_dir = cache_dir.clone();
        let layers = blocking(move || pack_dir(&layers_dir)).await?;

        if cancel.is_cancelled() {
            return Err(cancelled());
        }

        let artifact = self.store.put(slug).await?;
        self.cache.commit(&resolution, layers).await?;

        info!(
            "Built {} with {} -> {} ({} bytes)",
            app.name,
            buildpack.name(),
            artifact.short(),
            artifact.size
        );

        Ok(BuildOutput {
            artifact,
            buildpack: buildpack.url().to_string(),
            processes,
            cache: resolution,
        })
    }
}

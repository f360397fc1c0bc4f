//! Pushed source trees and the optional app.json manifest

use crate::error::{ShipyardError, ShipyardResult};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A checked-out source tree received from a push
#[derive(Debug, Clone)]
pub struct SourceTree {
    root: PathBuf,
}

impl SourceTree {
    /// Open a source tree rooted at a directory
    pub fn open(root: impl Into<PathBuf>) -> ShipyardResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(ShipyardError::PathNotFound(root));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Copy the tree into `dest`, skipping VCS metadata
    ///
    /// Blocking; call from `spawn_blocking`.
    pub fn copy_into(&self, dest: &Path) -> ShipyardResult<u64> {
        let mut copied = 0;
        let walker = WalkDir::new(&self.root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.file_name() != ".git");

        for entry in walker {
            let entry = entry.map_err(|e| {
                ShipyardError::io(
                    format!("walking {}", self.root.display()),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
                )
            })?;
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| ShipyardError::Internal(e.to_string()))?;
            let target = dest.join(rel);
            let file_type = entry.file_type();

            if file_type.is_dir() {
                fs::create_dir_all(&target)
                    .map_err(|e| ShipyardError::io(format!("creating {}", target.display()), e))?;
            } else if file_type.is_symlink() {
                copy_symlink(entry.path(), &target)?;
            } else {
                fs::copy(entry.path(), &target)
                    .map_err(|e| ShipyardError::io(format!("copying {}", rel.display()), e))?;
                copied += 1;
            }
        }

        Ok(copied)
    }
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> ShipyardResult<()> {
    let link = fs::read_link(src)
        .map_err(|e| ShipyardError::io(format!("readlink {}", src.display()), e))?;
    std::os::unix::fs::symlink(&link, target)
        .map_err(|e| ShipyardError::io(format!("symlink {}", target.display()), e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> ShipyardResult<()> {
    fs::copy(src, target)
        .map(|_| ())
        .map_err(|e| ShipyardError::io(format!("copying {}", src.display()), e))
}

/// An env entry in app.json
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvRequirement {
    /// Plain default value
    Value(String),
    /// Detailed declaration
    Spec {
        #[serde(default)]
        description: Option<String>,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        required: Option<bool>,
    },
}

impl EnvRequirement {
    /// Required unless it carries a default or says `required: false`
    pub fn is_required(&self) -> bool {
        match self {
            Self::Value(_) => false,
            Self::Spec {
                value, required, ..
            } => required.unwrap_or(value.is_none()),
        }
    }
}

/// The subset of app.json the pipeline reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppManifest {
    #[serde(default)]
    pub env: BTreeMap<String, EnvRequirement>,
}

impl AppManifest {
    /// Load `app.json` from a tree, if present
    pub fn load(dir: &Path) -> ShipyardResult<Option<Self>> {
        let path = dir.join("app.json");
        if !path.is_file() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .map_err(|e| ShipyardError::io(format!("reading {}", path.display()), e))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    /// Required variables absent from `env`
    pub fn missing_bindings(&self, env: &BTreeMap<String, String>) -> Vec<String> {
        self.env
            .iter()
            .filter(|(name, req)| req.is_required() && !env.contains_key(*name))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

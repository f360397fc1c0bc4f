//! Dependency manifest detection and fingerprinting
//!
//! Detects package manager lockfiles in a source tree and derives a
//! content fingerprint from them. Same manifests = same fingerprint, so a
//! build can reuse the cache layers of the previous build.

use crate::error::{ShipyardError, ShipyardResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Supported package ecosystems
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    /// npm (package-lock.json, npm-shrinkwrap.json)
    Npm,
    /// Yarn (yarn.lock)
    Yarn,
    /// Cargo/Rust (Cargo.lock)
    Cargo,
    /// pip/Python (requirements.txt, Pipfile.lock)
    Pip,
    /// Go modules (go.sum)
    Go,
    /// Bundler/Ruby (Gemfile.lock)
    Bundler,
    /// Composer/PHP (composer.lock)
    Composer,
    /// Maven/Java (pom.xml)
    Maven,
}

impl Ecosystem {
    /// Get the manifest patterns for this ecosystem
    fn manifest_patterns(&self) -> &'static [&'static str] {
        match self {
            Self::Npm => &["package-lock.json", "npm-shrinkwrap.json"],
            Self::Yarn => &["yarn.lock"],
            Self::Cargo => &["Cargo.lock"],
            Self::Pip => &["requirements.txt", "Pipfile.lock"],
            Self::Go => &["go.sum"],
            Self::Bundler => &["Gemfile.lock"],
            Self::Composer => &["composer.lock"],
            Self::Maven => &["pom.xml"],
        }
    }

    /// All ecosystems in detection priority order
    fn all() -> &'static [Self] {
        &[
            Self::Npm,
            Self::Yarn,
            Self::Cargo,
            Self::Pip,
            Self::Go,
            Self::Bundler,
            Self::Composer,
            Self::Maven,
        ]
    }
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Npm => "npm",
            Self::Yarn => "yarn",
            Self::Cargo => "cargo",
            Self::Pip => "pip",
            Self::Go => "go",
            Self::Bundler => "bundler",
            Self::Composer => "composer",
            Self::Maven => "maven",
        };
        write!(f, "{}", name)
    }
}

/// A dependency manifest found in a source tree
#[derive(Debug, Clone)]
pub struct ManifestFile {
    /// The ecosystem this manifest belongs to
    pub ecosystem: Ecosystem,
    /// Path relative to the source root
    pub path: PathBuf,
    /// Raw file contents
    pub contents: Vec<u8>,
}

/// Content fingerprint of a set of dependency manifests
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    /// First 12 hex chars, used as the cache key
    pub short: String,
    /// Full SHA256, used to detect key collisions
    pub digest: String,
}

impl Fingerprint {
    /// Fingerprint named byte slices
    ///
    /// Pure function of its input. An empty input yields a stable
    /// fingerprint, so trees without manifests still cache.
    pub fn of<'a>(parts: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        let mut hasher = Sha256::new();
        for (name, contents) in parts {
            hasher.update(name.as_bytes());
            hasher.update([0u8]);
            hasher.update((contents.len() as u64).to_le_bytes());
            hasher.update(contents);
        }
        let digest = hex::encode(hasher.finalize());

        Self {
            short: digest[..12].to_string(),
            digest,
        }
    }

    /// Fingerprint detected manifests
    pub fn of_manifests(manifests: &[ManifestFile]) -> Self {
        let names: Vec<String> = manifests
            .iter()
            .map(|m| m.path.to_string_lossy().into_owned())
            .collect();
        Self::of(
            names
                .iter()
                .zip(manifests)
                .map(|(name, m)| (name.as_str(), m.contents.as_slice())),
        )
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short)
    }
}

/// Detect all dependency manifests at the root of a source tree
pub fn detect_manifests(source_dir: &Path) -> ShipyardResult<Vec<ManifestFile>> {
    let mut manifests = Vec::new();

    for ecosystem in Ecosystem::all() {
        for pattern in ecosystem.manifest_patterns() {
            let path = source_dir.join(pattern);
            if path.is_file() {
                debug!("Found {} manifest: {}", ecosystem, path.display());

                let contents = fs::read(&path).map_err(|e| ShipyardError::Io {
                    context: format!("reading manifest {}", path.display()),
                    source: e,
                })?;
                manifests.push(ManifestFile {
                    ecosystem: *ecosystem,
                    path: PathBuf::from(pattern),
                    contents,
                });

                // Only use first matching manifest per ecosystem
                break;
            }
        }
    }

    debug!("Detected {} manifests", manifests.len());
    Ok(manifests)
}

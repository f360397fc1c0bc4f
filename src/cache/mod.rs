//! Build cache
//!
//! Content-addressed reuse of buildpack cache layers, keyed by
//! (app, buildpack, manifest fingerprint).
//!
//! # Lookup Outcomes
//!
//! | Outcome | Transcript | Description |
//! |---------|------------|-------------|
//! | Hit | `cached: N` | Same fingerprint, layers restored before compile |
//! | Miss | no "cached" | First build, changed manifests, or unreadable layers |
//!
//! A hit increments the app's counter when the build commits; deleting
//! the app clears its entries and counter.

pub mod manager;
pub mod manifest;

pub use manager::{BuildCacheManager, CacheEntry, CacheKey, CacheOutcome, CacheResolution, MissReason};
pub use manifest::{detect_manifests, Ecosystem, Fingerprint, ManifestFile};

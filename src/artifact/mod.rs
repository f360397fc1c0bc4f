//! Content-addressed artifact storage
//!
//! Slugs and cache layers are stored as immutable blobs keyed by the
//! SHA256 of their contents. Writing the same bytes twice is a no-op, so
//! concurrent builds of different apps can share the store safely.

pub mod archive;
pub mod store;

pub use archive::{pack_dir, unpack_into};
pub use store::{ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore};

/// Format bytes as human-readable size (e.g., "1.5 MB")
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

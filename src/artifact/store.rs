//! Artifact store backends

use crate::error::{ShipyardError, ShipyardResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::fs;
use tracing::debug;

/// Reference to an immutable blob in the store
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactRef {
    /// Hex SHA256 of the blob
    pub digest: String,
    /// Blob size in bytes
    pub size: u64,
}

impl ArtifactRef {
    /// Compute the reference for a blob
    pub fn for_bytes(bytes: &[u8]) -> Self {
        Self {
            digest: hex::encode(Sha256::digest(bytes)),
            size: bytes.len() as u64,
        }
    }

    /// First 12 hex chars, for display
    pub fn short(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }

    /// Check that `bytes` are the blob this reference names
    pub fn verify(&self, bytes: &[u8]) -> ShipyardResult<()> {
        let actual = Self::for_bytes(bytes);
        if actual.digest != self.digest {
            return Err(ShipyardError::ArtifactCorrupt {
                digest: self.digest.clone(),
                reason: format!("content hashes to {}", actual.short()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.digest)
    }
}

/// Abstract content-addressed blob storage
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store a blob and return its reference
    async fn put(&self, bytes: Vec<u8>) -> ShipyardResult<ArtifactRef>;

    /// Fetch a blob, verifying its digest
    async fn get(&self, artifact: &ArtifactRef) -> ShipyardResult<Vec<u8>>;

    /// Whether the blob is present
    async fn contains(&self, artifact: &ArtifactRef) -> ShipyardResult<bool>;
}

/// Filesystem store laid out as `objects/<aa>/<digest>`
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, digest: &str) -> PathBuf {
        let prefix = &digest[..2.min(digest.len())];
        self.root.join("objects").join(prefix).join(digest)
    }

    fn tmp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    async fn ensure_parent(path: &Path) -> ShipyardResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ShipyardError::io(format!("creating {}", parent.display()), e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> ShipyardResult<ArtifactRef> {
        let artifact = ArtifactRef::for_bytes(&bytes);
        let path = self.object_path(&artifact.digest);

        if path.exists() {
            debug!("Artifact {} already stored", artifact.short());
            return Ok(artifact);
        }

        // Unique temp name per writer; rename is atomic and identical
        // content makes the last rename win harmlessly.
        let tmp = self
            .tmp_dir()
            .join(format!("{}-{}", artifact.digest, uuid::Uuid::new_v4().simple()));
        Self::ensure_parent(&tmp).await?;
        Self::ensure_parent(&path).await?;

        fs::write(&tmp, &bytes)
            .await
            .map_err(|e| ShipyardError::io(format!("writing {}", tmp.display()), e))?;
        fs::rename(&tmp, &path)
            .await
            .map_err(|e| ShipyardError::io(format!("storing artifact {}", artifact.short()), e))?;

        debug!("Stored artifact {} ({} bytes)", artifact.short(), artifact.size);
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> ShipyardResult<Vec<u8>> {
        let path = self.object_path(&artifact.digest);
        if !path.exists() {
            return Err(ShipyardError::ArtifactNotFound(artifact.to_string()));
        }

        let bytes = fs::read(&path)
            .await
            .map_err(|e| ShipyardError::io(format!("reading artifact {}", artifact.short()), e))?;
        artifact.verify(&bytes)?;
        Ok(bytes)
    }

    async fn contains(&self, artifact: &ArtifactRef) -> ShipyardResult<bool> {
        Ok(self.object_path(&artifact.digest).exists())
    }
}

/// In-memory store, used when no state directory is configured
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<HashMap<String, Arc<Vec<u8>>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored blob in place, bypassing content addressing
    #[cfg(test)]
    pub(crate) fn tamper(&self, digest: &str, bytes: Vec<u8>) {
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        objects.insert(digest.to_string(), Arc::new(bytes));
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, bytes: Vec<u8>) -> ShipyardResult<ArtifactRef> {
        let artifact = ArtifactRef::for_bytes(&bytes);
        let mut objects = self
            .objects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        objects
            .entry(artifact.digest.clone())
            .or_insert_with(|| Arc::new(bytes));
        Ok(artifact)
    }

    async fn get(&self, artifact: &ArtifactRef) -> ShipyardResult<Vec<u8>> {
        let blob = {
            let objects = self
                .objects
                .read()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            objects.get(&artifact.digest).cloned()
        };

        let blob = blob.ok_or_else(|| ShipyardError::ArtifactNotFound(artifact.to_string()))?;
        artifact.verify(&blob)?;
        Ok(blob.as_ref().clone())
    }

    async fn contains(&self, artifact: &ArtifactRef) -> ShipyardResult<bool> {
        let objects = self
            .objects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Ok(objects.contains_key(&artifact.digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn ref_is_deterministic() {
        let a = ArtifactRef::for_bytes(b"slug");
        let b = ArtifactRef::for_bytes(b"slug");
        assert_eq!(a, b);
        assert_eq!(a.size, 4);
        assert_eq!(a.short().len(), 12);
        assert!(a.to_string().starts_with("sha256:"));
    }

    #[tokio::test]
    async fn fs_store_put_get() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());

        let artifact = store.put(b"hello".to_vec()).await.unwrap();
        assert!(store.contains(&artifact).await.unwrap());
        assert_eq!(store.get(&artifact).await.unwrap(), b"hello");

        // Same content, same reference
        let again = store.put(b"hello".to_vec()).await.unwrap();
        assert_eq!(artifact, again);
    }

    #[tokio::test]
    async fn fs_store_concurrent_identical_writes() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FsArtifactStore::new(dir.path()));

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let store = Arc::clone(&store);
                tokio::spawn(async move { store.put(vec![7u8; 4096]).await })
            })
            .collect();

        let mut refs = vec![];
        for writer in writers {
            refs.push(writer.await.unwrap().unwrap());
        }
        assert!(refs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(store.get(&refs[0]).await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn fs_store_detects_corruption() {
        let dir = TempDir::new().unwrap();
        let store = FsArtifactStore::new(dir.path());
        let artifact = store.put(b"original".to_vec()).await.unwrap();

        std::fs::write(store.object_path(&artifact.digest), b"tampered").unwrap();

        let err = store.get(&artifact).await.unwrap_err();
        assert!(matches!(err, ShipyardError::ArtifactCorrupt { .. }));
    }

    #[tokio::test]
    async fn memory_store_missing() {
        let store = MemoryArtifactStore::new();
        let artifact = ArtifactRef::for_bytes(b"never stored");
        assert!(!store.contains(&artifact).await.unwrap());
        assert!(matches!(
            store.get(&artifact).await.unwrap_err(),
            ShipyardError::ArtifactNotFound(_)
        ));
    }
}

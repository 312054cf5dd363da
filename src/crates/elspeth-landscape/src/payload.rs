//! Content-addressable payload storage
//!
//! Row and aggregate payloads that would bloat the audit database are
//! externalized here and referenced by SHA-256 content hash. The store is
//! an audit boundary: bytes written via [`PayloadStore::put`] must read back
//! byte-identically, and corruption must surface as
//! [`PayloadError::Integrity`] rather than silently flow into downstream
//! tooling.
//!
//! Two backends:
//!
//! - [`FsPayloadStore`] - sharded files under a base directory, written via
//!   temp-file-and-rename, hash-verified on every read.
//! - [`InMemoryPayloadStore`] - test backend.
//!
//! Content addressing makes concurrent `put` of identical bytes naturally
//! idempotent; concurrent `put` of different content under the same hash is
//! impossible by construction.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::canonical::hash_bytes;
use crate::error::PayloadError;

/// Content-addressed blob store.
#[async_trait]
pub trait PayloadStore: Send + Sync {
    /// Stores bytes idempotently and returns their SHA-256 hex digest.
    async fn put(&self, bytes: &[u8]) -> Result<String, PayloadError>;

    /// Retrieves bytes by hash, verifying integrity.
    async fn get(&self, hash: &str) -> Result<Vec<u8>, PayloadError>;

    /// Whether a blob exists under this hash.
    async fn exists(&self, hash: &str) -> Result<bool, PayloadError>;

    /// Deletes a blob; returns whether it existed.
    async fn delete(&self, hash: &str) -> Result<bool, PayloadError>;
}

fn validate_hash(hash: &str) -> Result<(), PayloadError> {
    if hash.len() == 64 && hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(PayloadError::InvalidHash(hash.to_string()))
    }
}

/// Filesystem-backed payload store.
///
/// Blobs live at `<base>/<hash[0..2]>/<hash>`; the two-character shard keeps
/// directory fanout bounded. Writes go through a temp file in the shard
/// directory followed by an atomic rename.
pub struct FsPayloadStore {
    base_path: PathBuf,
}

impl FsPayloadStore {
    /// Opens a store rooted at `base_path`, creating it if needed.
    pub async fn open(base_path: impl Into<PathBuf>) -> Result<Self, PayloadError> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        self.base_path.join(&hash[0..2]).join(hash)
    }
}

#[async_trait]
impl PayloadStore for FsPayloadStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, PayloadError> {
        let hash = hash_bytes(bytes);
        let path = self.blob_path(&hash);
        if tokio::fs::try_exists(&path).await? {
            return Ok(hash);
        }
        let shard = path.parent().expect("blob path always has a shard parent");
        tokio::fs::create_dir_all(shard).await?;
        let tmp = shard.join(format!(".{hash}.tmp"));
        {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(bytes).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp, &path).await?;
        tracing::debug!(hash = %hash, size = bytes.len(), "payload stored");
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>, PayloadError> {
        validate_hash(hash)?;
        let path = self.blob_path(hash);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(PayloadError::NotFound(hash.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let actual = hash_bytes(&bytes);
        if actual != hash {
            return Err(PayloadError::Integrity {
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(bytes)
    }

    async fn exists(&self, hash: &str) -> Result<bool, PayloadError> {
        validate_hash(hash)?;
        Ok(tokio::fs::try_exists(self.blob_path(hash)).await?)
    }

    async fn delete(&self, hash: &str) -> Result<bool, PayloadError> {
        validate_hash(hash)?;
        match tokio::fs::remove_file(self.blob_path(hash)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory payload store for tests and audit-off runs.
#[derive(Default)]
pub struct InMemoryPayloadStore {
    blobs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl InMemoryPayloadStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Overwrites stored bytes without rehashing. Test-only corruption
    /// hook for exercising integrity failures.
    pub async fn corrupt(&self, hash: &str, bytes: Vec<u8>) {
        self.blobs.write().await.insert(hash.to_string(), bytes);
    }
}

#[async_trait]
impl PayloadStore for InMemoryPayloadStore {
    async fn put(&self, bytes: &[u8]) -> Result<String, PayloadError> {
        let hash = hash_bytes(bytes);
        self.blobs
            .write()
            .await
            .entry(hash.clone())
            .or_insert_with(|| bytes.to_vec());
        Ok(hash)
    }

    async fn get(&self, hash: &str) -> Result<Vec<u8>, PayloadError> {
        validate_hash(hash)?;
        let blobs = self.blobs.read().await;
        let bytes = blobs
            .get(hash)
            .ok_or_else(|| PayloadError::NotFound(hash.to_string()))?;
        let actual = hash_bytes(bytes);
        if actual != hash {
            return Err(PayloadError::Integrity {
                hash: hash.to_string(),
                actual,
            });
        }
        Ok(bytes.clone())
    }

    async fn exists(&self, hash: &str) -> Result<bool, PayloadError> {
        validate_hash(hash)?;
        Ok(self.blobs.read().await.contains_key(hash))
    }

    async fn delete(&self, hash: &str) -> Result<bool, PayloadError> {
        validate_hash(hash)?;
        Ok(self.blobs.write().await.remove(hash).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = InMemoryPayloadStore::new();
        let hash = store.put(b"hello world").await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), b"hello world");
        assert!(store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_put_idempotent() {
        let store = InMemoryPayloadStore::new();
        let h1 = store.put(b"same bytes").await.unwrap();
        let h2 = store.put(b"same bytes").await.unwrap();
        assert_eq!(h1, h2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_integrity_failure() {
        let store = InMemoryPayloadStore::new();
        let hash = store.put(b"original").await.unwrap();
        store.corrupt(&hash, b"tampered".to_vec()).await;
        assert!(matches!(
            store.get(&hash).await,
            Err(PayloadError::Integrity { .. })
        ));
    }

    #[tokio::test]
    async fn test_memory_delete() {
        let store = InMemoryPayloadStore::new();
        let hash = store.put(b"bytes").await.unwrap();
        assert!(store.delete(&hash).await.unwrap());
        assert!(!store.delete(&hash).await.unwrap());
        assert!(matches!(
            store.get(&hash).await,
            Err(PayloadError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_hash_rejected() {
        let store = InMemoryPayloadStore::new();
        assert!(matches!(
            store.get("not-a-hash").await,
            Err(PayloadError::InvalidHash(_))
        ));
    }

    #[tokio::test]
    async fn test_fs_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::open(dir.path()).await.unwrap();
        let hash = store.put(b"persisted payload").await.unwrap();
        assert_eq!(store.get(&hash).await.unwrap(), b"persisted payload");
        assert!(store.exists(&hash).await.unwrap());
        assert!(store.delete(&hash).await.unwrap());
        assert!(!store.exists(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_put_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::open(dir.path()).await.unwrap();
        let h1 = store.put(b"blob").await.unwrap();
        let h2 = store.put(b"blob").await.unwrap();
        assert_eq!(h1, h2);
    }

    #[tokio::test]
    async fn test_fs_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsPayloadStore::open(dir.path()).await.unwrap();
        let hash = store.put(b"good bytes").await.unwrap();
        let path = dir.path().join(&hash[0..2]).join(&hash);
        std::fs::write(&path, b"bad bytes").unwrap();
        assert!(matches!(
            store.get(&hash).await,
            Err(PayloadError::Integrity { .. })
        ));
    }
}

//! Blob gateway for input PDFs and OCR intermediate outputs.

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;

/// Object store abstraction.
///
/// Paths are bucket-relative (`uploads/{session}/{job}.pdf`,
/// `vision/{job}/…`). Deletes are idempotent: deleting a missing blob is
/// not an error.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<()>;

    /// `None` when the blob does not exist.
    async fn get(&self, path: &str) -> Result<Option<Bytes>>;

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.get(path).await?.is_some())
    }

    async fn delete(&self, path: &str) -> Result<()>;

    /// Paths under `prefix`, lexicographically sorted (shard order).
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory blob store for tests and development.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.read().unwrap().len()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<()> {
        self.blobs
            .write()
            .unwrap()
            .insert(path.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        Ok(self.blobs.read().unwrap().get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.blobs.write().unwrap().remove(path);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .blobs
            .read()
            .unwrap()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// Local-disk blob store for development.
///
/// Not suitable for multi-instance deployments; a bucket-backed gateway
/// slots behind the same trait there.
pub struct LocalDiskBlobStore {
    root: PathBuf,
}

impl LocalDiskBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> Result<PathBuf> {
        // Blob paths are server-generated, but refuse traversal anyway.
        if path.split('/').any(|seg| seg == "..") {
            anyhow::bail!("invalid blob path: {path}");
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl BlobStore for LocalDiskBlobStore {
    async fn put(&self, path: &str, bytes: Bytes) -> Result<()> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&full, &bytes)
            .await
            .with_context(|| format!("writing {}", full.display()))?;
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Option<Bytes>> {
        let full = self.resolve(path)?;
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("reading {}", full.display())),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("deleting {}", full.display())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.resolve(prefix.trim_end_matches('/'))?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                let name = entry.file_name().to_string_lossy().to_string();
                paths.push(format!("{}/{}", prefix.trim_end_matches('/'), name));
            }
        }
        paths.sort();
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_store_round_trip() {
        let store = MemoryBlobStore::new();
        store
            .put("uploads/s/j.pdf", Bytes::from_static(b"%PDF"))
            .await
            .unwrap();
        assert!(store.exists("uploads/s/j.pdf").await.unwrap());
        assert_eq!(
            store.get("uploads/s/j.pdf").await.unwrap().unwrap(),
            Bytes::from_static(b"%PDF")
        );

        store.delete("uploads/s/j.pdf").await.unwrap();
        assert!(!store.exists("uploads/s/j.pdf").await.unwrap());
        // Idempotent delete.
        store.delete("uploads/s/j.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn memory_store_lists_in_shard_order() {
        let store = MemoryBlobStore::new();
        for name in ["vision/j/output-2.json", "vision/j/output-1.json", "other"] {
            store.put(name, Bytes::new()).await.unwrap();
        }
        assert_eq!(
            store.list("vision/j/").await.unwrap(),
            vec!["vision/j/output-1.json", "vision/j/output-2.json"]
        );
    }

    #[tokio::test]
    async fn disk_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskBlobStore::new(dir.path());

        store
            .put("uploads/s/j.pdf", Bytes::from_static(b"%PDF"))
            .await
            .unwrap();
        assert!(store.exists("uploads/s/j.pdf").await.unwrap());
        assert_eq!(store.list("uploads/s").await.unwrap().len(), 1);

        store.delete("uploads/s/j.pdf").await.unwrap();
        assert_eq!(store.get("uploads/s/j.pdf").await.unwrap(), None);
        store.delete("uploads/s/j.pdf").await.unwrap();
    }

    #[tokio::test]
    async fn disk_store_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskBlobStore::new(dir.path());
        assert!(store.get("../etc/passwd").await.is_err());
    }
}

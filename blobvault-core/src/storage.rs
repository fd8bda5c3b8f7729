//! Storage boundary for blob bytes and index files.
//!
//! The core only ever asks a backend to load, store and delete opaque byte
//! strings. Retries and timeouts belong to backend implementations.

use crate::error::{Result, VaultError};
use crate::hash::Hash;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;

#[async_trait]
pub trait BlobBackend: Send + Sync + 'static {
    /// Read `length` bytes stored at `path`.
    async fn load_blob(&self, path: &str, length: u64) -> Result<Bytes>;

    /// Persist a blob and return the path it was stored under.
    async fn store_blob(&self, hash: &Hash, data: Bytes) -> Result<String>;

    async fn delete_blob(&self, path: &str) -> Result<()>;

    /// Persist a named index file (hash index, backup sets).
    async fn store_index(&self, name: &str, data: Bytes) -> Result<()>;

    async fn load_index(&self, name: &str) -> Result<Option<Bytes>>;

    fn name(&self) -> &str;
}

/// Blobs under `blobs/{first 2 hex}/{hex hash}`, index files under `index/`.
pub struct DiskBackend {
    base_path: PathBuf,
}

impl DiskBackend {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("blobs"))?;
        std::fs::create_dir_all(base_path.join("index"))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn blob_relative_path(hash: &Hash) -> String {
        let hex = hash.to_hex();
        format!("blobs/{}/{}", &hex[..2], hex)
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let safe = path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !safe || relative.is_empty() {
            return Err(VaultError::InvalidRequest(format!(
                "invalid storage path: {}",
                relative
            )));
        }
        Ok(self.base_path.join(path))
    }

    fn index_path(&self, name: &str) -> Result<PathBuf> {
        self.resolve(&format!("index/{}", name))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut temp_name = path.as_os_str().to_owned();
        temp_name.push(".tmp");
        let temp_path = PathBuf::from(temp_name);
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobBackend for DiskBackend {
    async fn load_blob(&self, path: &str, length: u64) -> Result<Bytes> {
        let full = self.resolve(path)?;
        let data = fs::read(&full).await.map_err(|e| {
            VaultError::StorageIo(format!("failed to read blob {}: {}", path, e))
        })?;
        if data.len() as u64 != length {
            return Err(VaultError::StorageIo(format!(
                "blob {} has {} bytes, expected {}",
                path,
                data.len(),
                length
            )));
        }
        Ok(Bytes::from(data))
    }

    async fn store_blob(&self, hash: &Hash, data: Bytes) -> Result<String> {
        let relative = Self::blob_relative_path(hash);
        let full = self.resolve(&relative)?;

        Self::write_atomic(&full, &data).await.map_err(|e| {
            VaultError::StorageIo(format!("failed to write blob {}: {}", relative, e))
        })?;

        tracing::debug!("Stored blob {} ({} bytes)", hash.short(), data.len());
        Ok(relative)
    }

    async fn delete_blob(&self, path: &str) -> Result<()> {
        let full = self.resolve(path)?;
        match fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::StorageIo(format!(
                "failed to delete blob {}: {}",
                path, e
            ))),
        }
    }

    async fn store_index(&self, name: &str, data: Bytes) -> Result<()> {
        let full = self.index_path(name)?;
        Self::write_atomic(&full, &data).await
    }

    async fn load_index(&self, name: &str) -> Result<Option<Bytes>> {
        let full = self.index_path(name)?;
        match fs::read(&full).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        "disk"
    }
}

/// In-process backend. Counts physical writes and deletes so callers can
/// observe deduplication.
#[derive(Default)]
pub struct MemoryBackend {
    blobs: Mutex<HashMap<String, Bytes>>,
    indexes: Mutex<HashMap<String, Bytes>>,
    writes: AtomicUsize,
    deletes: AtomicUsize,
    fail_deletes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn blob_count(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn contains_path(&self, path: &str) -> bool {
        self.blobs.lock().contains_key(path)
    }

    /// Make every later delete fail, to exercise non-fatal GC deletes.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BlobBackend for MemoryBackend {
    async fn load_blob(&self, path: &str, length: u64) -> Result<Bytes> {
        let data = self
            .blobs
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| VaultError::StorageIo(format!("no blob stored at {}", path)))?;
        if data.len() as u64 != length {
            return Err(VaultError::StorageIo(format!(
                "blob {} has {} bytes, expected {}",
                path,
                data.len(),
                length
            )));
        }
        Ok(data)
    }

    async fn store_blob(&self, hash: &Hash, data: Bytes) -> Result<String> {
        let path = hash.to_hex();
        self.blobs.lock().insert(path.clone(), data);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(path)
    }

    async fn delete_blob(&self, path: &str) -> Result<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(VaultError::StorageIo(format!("delete refused for {}", path)));
        }
        self.blobs.lock().remove(path);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn store_index(&self, name: &str, data: Bytes) -> Result<()> {
        self.indexes.lock().insert(name.to_string(), data);
        Ok(())
    }

    async fn load_index(&self, name: &str) -> Result<Option<Bytes>> {
        Ok(self.indexes.lock().get(name).cloned())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

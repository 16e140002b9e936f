use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use vmcatalog_storage::error::{StorageError, StorageResult};
use vmcatalog_storage::traits::StorageBackend;

/// Wraps a backend and counts mutating calls.
#[allow(dead_code)]
pub struct CountingBackend {
    inner: Arc<dyn StorageBackend>,
    pub pushes: AtomicUsize,
    pub deletes: AtomicUsize,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pushes: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
        })
    }

    pub fn push_count(&self) -> usize {
        self.pushes.load(Ordering::SeqCst)
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn provider_root_path(&self) -> String {
        self.inner.provider_root_path()
    }

    fn provider_meta(&self) -> BTreeMap<String, String> {
        self.inner.provider_meta()
    }

    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        self.inner.file_exists(dir, name).await
    }

    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        self.inner.folder_exists(dir, name).await
    }

    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String> {
        self.inner.file_checksum(dir, name).await
    }

    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64> {
        self.inner.file_size(dir, name).await
    }

    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        self.inner.push_file(local_dir, dir, name).await
    }

    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()> {
        self.inner.pull_file(dir, name, destination).await
    }

    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes> {
        self.inner.pull_file_to_memory(dir, name).await
    }

    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_file(dir, name).await
    }

    async fn create_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.inner.create_folder(dir, name).await
    }

    async fn delete_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_folder(dir, name).await
    }
}

/// Backend whose every call fails with an I/O error.
#[allow(dead_code)]
pub struct FailingBackend;

fn fail<T>() -> StorageResult<T> {
    Err(StorageError::Io(std::io::Error::other("backend unavailable")))
}

#[async_trait]
impl StorageBackend for FailingBackend {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn provider_root_path(&self) -> String {
        "/".to_string()
    }

    fn provider_meta(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    async fn file_exists(&self, _dir: &str, _name: &str) -> StorageResult<bool> {
        fail()
    }

    async fn folder_exists(&self, _dir: &str, _name: &str) -> StorageResult<bool> {
        fail()
    }

    async fn file_checksum(&self, _dir: &str, _name: &str) -> StorageResult<String> {
        fail()
    }

    async fn file_size(&self, _dir: &str, _name: &str) -> StorageResult<u64> {
        fail()
    }

    async fn push_file(&self, _local_dir: &Path, _dir: &str, _name: &str) -> StorageResult<()> {
        fail()
    }

    async fn pull_file(&self, _dir: &str, _name: &str, _destination: &Path) -> StorageResult<()> {
        fail()
    }

    async fn pull_file_to_memory(&self, _dir: &str, _name: &str) -> StorageResult<Bytes> {
        fail()
    }

    async fn delete_file(&self, _dir: &str, _name: &str) -> StorageResult<()> {
        fail()
    }

    async fn create_folder(&self, _dir: &str, _name: &str) -> StorageResult<()> {
        fail()
    }

    async fn delete_folder(&self, _dir: &str, _name: &str) -> StorageResult<()> {
        fail()
    }
}

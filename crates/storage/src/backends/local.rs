//! Local filesystem catalog backend.

use crate::error::{StorageError, StorageResult, join_error};
use crate::traits::{
    BackendProbe, CheckOutcome, ProgressSender, ProgressSink, StorageBackend, object_key,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument};
use uuid::Uuid;
use vmcatalog_core::Provider;

pub const PROVIDER_NAME: &str = "local-storage";

/// Copy buffer size (1 MiB).
const COPY_BUFFER_SIZE: usize = 1024 * 1024;

/// Catalog stored in a directory tree.
#[derive(Debug)]
pub struct LocalBackend {
    root: PathBuf,
    progress: ProgressSink,
}

impl LocalBackend {
    /// Create the backend, creating `root` if needed.
    pub async fn new(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            progress: ProgressSink::default(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `dir/name` under the root, rejecting anything that escapes it.
    ///
    /// `dir` may already carry the absolute root as a prefix.
    async fn resolve(&self, dir: &str, name: &str) -> StorageResult<PathBuf> {
        let dir = match Path::new(dir).strip_prefix(&self.root) {
            Ok(rest) => rest.to_string_lossy().to_string(),
            Err(_) => dir.to_string(),
        };
        let key = object_key(&dir, name);
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || resolve_sync(&root, &key))
            .await
            .map_err(join_error)?
    }

    async fn copy_with_progress(&self, src: &Path, dest: &Path, label: &str) -> StorageResult<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut input = fs::File::open(src).await.map_err(|e| not_found(e, src))?;
        let total = input.metadata().await?.len();

        // Write next to the destination, then rename into place.
        let temp_path = dest.with_file_name(format!(
            "{}.tmp.{}",
            dest.file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            Uuid::new_v4()
        ));
        let result = async {
            let mut output = fs::File::create(&temp_path).await?;
            let mut buf = vec![0u8; COPY_BUFFER_SIZE];
            let mut done = 0u64;
            loop {
                let n = input.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                output.write_all(&buf[..n]).await?;
                done += n as u64;
                self.progress.report(label, done, total);
            }
            output.sync_all().await?;
            fs::rename(&temp_path, dest).await?;
            Ok::<_, StorageError>(())
        }
        .await;

        if result.is_err() {
            let _ = fs::remove_file(&temp_path).await;
        }
        result
    }
}

/// Validate `key` and map it under `root`.
///
/// Symlinks that resolve outside the root are rejected, including through
/// the nearest existing ancestor of a path that does not exist yet.
fn resolve_sync(root: &Path, key: &str) -> StorageResult<PathBuf> {
    if key.contains("..") || key.starts_with('\\') {
        return Err(StorageError::InvalidKey(format!(
            "path traversal not allowed: {key}"
        )));
    }
    if Path::new(key)
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(format!(
            "contains unsafe path component: {key}"
        )));
    }

    let path = root.join(key);
    let root_canonical = root.canonicalize()?;

    let mut probe = Some(path.as_path());
    while let Some(candidate) = probe {
        match std::fs::symlink_metadata(candidate) {
            Ok(_) => {
                let canonical = candidate.canonicalize().map_err(|_| {
                    StorageError::InvalidKey(format!("dangling symlink in path: {key}"))
                })?;
                if !canonical.starts_with(&root_canonical) {
                    return Err(StorageError::InvalidKey(format!(
                        "resolved path escapes catalog root: {key}"
                    )));
                }
                return Ok(path);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                probe = candidate.parent();
            }
            Err(e) => return Err(StorageError::Io(e)),
        }
    }
    Ok(path)
}

fn not_found(e: std::io::Error, path: &Path) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(path.display().to_string())
    } else {
        StorageError::Io(e)
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn provider_root_path(&self) -> String {
        self.root.display().to_string()
    }

    fn provider_meta(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("provider".to_string(), PROVIDER_NAME.to_string()),
            ("catalog_path".to_string(), self.root.display().to_string()),
        ])
    }

    fn set_progress_channel(&self, sender: ProgressSender) {
        self.progress.set(sender);
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        let path = self.resolve(dir, name).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        let path = self.resolve(dir, name).await?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_dir()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String> {
        let path = self.resolve(dir, name).await?;
        if !fs::try_exists(&path).await? {
            return Err(StorageError::NotFound(object_key(dir, name)));
        }
        let checksum = tokio::task::spawn_blocking(move || vmcatalog_core::file_checksum(&path))
            .await
            .map_err(join_error)??;
        Ok(checksum)
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64> {
        let path = self.resolve(dir, name).await?;
        let meta = fs::metadata(&path).await.map_err(|e| not_found(e, &path))?;
        Ok(meta.len())
    }

    #[instrument(skip(self, local_dir), fields(backend = "local"))]
    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()> {
        let dest = self.resolve(dir, name).await?;
        self.copy_with_progress(&local_dir.join(name), &dest, name)
            .await?;
        debug!(dest = %dest.display(), "pushed file");
        Ok(())
    }

    #[instrument(skip(self, destination), fields(backend = "local"))]
    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()> {
        let src = self.resolve(dir, name).await?;
        self.copy_with_progress(&src, &destination.join(name), name)
            .await
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes> {
        let path = self.resolve(dir, name).await?;
        let data = fs::read(&path).await.map_err(|e| not_found(e, &path))?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()> {
        let path = self.resolve(dir, name).await?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn create_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        let path = self.resolve(dir, name).await?;
        fs::create_dir_all(&path).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "local"))]
    async fn delete_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        let path = self.resolve(dir, name).await?;
        if path == self.root {
            return Err(StorageError::InvalidPath(
                "refusing to delete the catalog root".to_string(),
            ));
        }
        match fs::remove_dir_all(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}

/// Claims `provider=local-storage` connections.
///
/// The root comes from the `catalog_path` meta key, else `default_root`.
/// Relative roots are anchored under `default_root`.
#[derive(Clone, Debug)]
pub struct LocalProbe {
    default_root: PathBuf,
}

impl LocalProbe {
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        Self {
            default_root: default_root.into(),
        }
    }
}

#[async_trait]
impl BackendProbe for LocalProbe {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn check(&self, connection: &Provider) -> StorageResult<CheckOutcome> {
        if !connection.kind.eq_ignore_ascii_case(PROVIDER_NAME) {
            return Ok(CheckOutcome::NotMatched);
        }
        let root = match connection.get_meta("catalog_path") {
            Some(path) if !path.is_empty() => {
                let path = PathBuf::from(path);
                if path.is_absolute() {
                    path
                } else {
                    self.default_root.join(path)
                }
            }
            _ => self.default_root.clone(),
        };
        let backend = LocalBackend::new(root).await?;
        Ok(CheckOutcome::Matched(Arc::new(backend)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn write(dir: &Path, name: &str, data: &[u8]) {
        fs::create_dir_all(dir).await.unwrap();
        fs::write(dir.join(name), data).await.unwrap();
    }

    #[tokio::test]
    async fn push_pull_roundtrip() {
        let root = tempfile::tempdir().unwrap();
        let work = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).await.unwrap();

        write(work.path(), "img.pdpack", b"pack-bytes").await;
        backend
            .push_file(work.path(), "/ubuntu", "img.pdpack")
            .await
            .unwrap();
        assert!(backend.file_exists("ubuntu", "img.pdpack").await.unwrap());
        assert!(backend.folder_exists("/", "ubuntu").await.unwrap());
        assert_eq!(backend.file_size("ubuntu", "img.pdpack").await.unwrap(), 10);

        let out = work.path().join("out");
        fs::create_dir_all(&out).await.unwrap();
        backend.pull_file("ubuntu", "img.pdpack", &out).await.unwrap();
        assert_eq!(fs::read(out.join("img.pdpack")).await.unwrap(), b"pack-bytes");
    }

    #[tokio::test]
    async fn absolute_dir_under_root_is_accepted() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).await.unwrap();
        let dir = root.path().join("debian");
        backend
            .create_folder(&dir.display().to_string(), "")
            .await
            .unwrap();
        assert!(root.path().join("debian").is_dir());
    }

    #[tokio::test]
    async fn traversal_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).await.unwrap();
        assert!(backend.file_exists("..", "etc").await.is_err());
        assert!(backend.file_exists("a/../../b", "c").await.is_err());
        assert!(backend.delete_folder("/", "").await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlink_escape_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::os::unix::fs::symlink(outside.path(), root.path().join("link")).unwrap();
        let backend = LocalBackend::new(root.path()).await.unwrap();
        let err = backend.file_exists("link/sub", "x").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(root.path()).await.unwrap();
        backend.delete_file("nope", "missing.meta").await.unwrap();
        backend.delete_folder("", "nope").await.unwrap();
    }

    #[tokio::test]
    async fn checksum_is_sha256() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("c"), "f", b"hello world").await;
        let backend = LocalBackend::new(root.path()).await.unwrap();
        assert_eq!(
            backend.file_checksum("c", "f").await.unwrap(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert!(matches!(
            backend.file_checksum("c", "missing").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn probe_matches_only_local_connections() {
        let root = tempfile::tempdir().unwrap();
        let probe = LocalProbe::new(root.path());

        let other = Provider::parse("provider=aws-s3;bucket=b").unwrap();
        assert!(matches!(
            probe.check(&other).await.unwrap(),
            CheckOutcome::NotMatched
        ));

        let local = Provider::parse("provider=Local-Storage;catalog_path=nested").unwrap();
        match probe.check(&local).await.unwrap() {
            CheckOutcome::Matched(backend) => {
                assert_eq!(
                    backend.provider_root_path(),
                    root.path().join("nested").display().to_string()
                );
                assert!(!backend.can_stream());
            }
            CheckOutcome::NotMatched => panic!("expected match"),
        }
    }
}

//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc::UnboundedSender;
use vmcatalog_core::Provider;

/// Progress of a single transfer, for UI feedback only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferProgress {
    pub file_name: String,
    pub percent: u8,
}

/// Receiver side is drained by the caller; nothing in the crate waits on it.
pub type ProgressSender = UnboundedSender<TransferProgress>;

/// Optional progress channel shared by a backend's transfers.
#[derive(Debug, Default)]
pub struct ProgressSink {
    sender: RwLock<Option<ProgressSender>>,
}

impl ProgressSink {
    pub fn set(&self, sender: ProgressSender) {
        if let Ok(mut slot) = self.sender.write() {
            *slot = Some(sender);
        }
    }

    /// Report `done` of `total` bytes. Closed receivers are ignored.
    pub fn report(&self, file_name: &str, done: u64, total: u64) {
        let Ok(slot) = self.sender.read() else {
            return;
        };
        if let Some(sender) = slot.as_ref() {
            let percent = if total == 0 {
                100
            } else {
                ((done.min(total) * 100) / total) as u8
            };
            let _ = sender.send(TransferProgress {
                file_name: file_name.to_string(),
                percent,
            });
        }
    }
}

/// Remote storage for catalog packs and metadata files.
///
/// Locations are a `dir` relative to the provider root plus a file or
/// folder `name`. A leading `/` on `dir` is ignored.
#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Provider name this backend answers to (e.g. `local-storage`).
    fn name(&self) -> &'static str;

    /// Whether `pull_file_and_decompress` avoids a second on-disk copy.
    fn can_stream(&self) -> bool {
        false
    }

    /// Display form of the provider root.
    fn provider_root_path(&self) -> String;

    /// Provider identification, enough to rebuild the connection string.
    fn provider_meta(&self) -> BTreeMap<String, String>;

    fn set_progress_channel(&self, _sender: ProgressSender) {}

    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool>;

    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool>;

    /// Hex SHA-256 of the stored file when known, else the backend's native digest.
    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String>;

    /// Size in bytes.
    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64>;

    /// Upload `local_dir/name` to `dir/name`.
    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()>;

    /// Download `dir/name` into `destination/name`.
    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()>;

    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes>;

    /// Download and unpack `dir/name` straight into `destination`.
    async fn pull_file_and_decompress(
        &self,
        _dir: &str,
        _name: &str,
        _destination: &Path,
    ) -> StorageResult<()> {
        Err(crate::StorageError::Unsupported {
            backend: self.name(),
            operation: "pull_file_and_decompress",
        })
    }

    /// Delete a file. Missing files are not an error.
    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()>;

    async fn create_folder(&self, dir: &str, name: &str) -> StorageResult<()>;

    /// Delete a folder and everything below it. Missing folders are not an error.
    async fn delete_folder(&self, dir: &str, name: &str) -> StorageResult<()>;
}

/// Result of offering a connection to a backend.
pub enum CheckOutcome {
    Matched(Arc<dyn StorageBackend>),
    NotMatched,
}

impl std::fmt::Debug for CheckOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Matched(backend) => write!(f, "Matched({})", backend.name()),
            Self::NotMatched => write!(f, "NotMatched"),
        }
    }
}

/// Builds a configured backend when a connection names it.
///
/// A connection for another provider is `NotMatched`, never an error;
/// errors mean the connection names this provider but is unusable.
#[async_trait]
pub trait BackendProbe: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    async fn check(&self, connection: &Provider) -> StorageResult<CheckOutcome>;
}

/// Join `dir` and `name` into a slash-separated key without leading `/`.
pub(crate) fn object_key(dir: &str, name: &str) -> String {
    let dir = dir.trim_matches('/');
    let name = name.trim_matches('/');
    match (dir.is_empty(), name.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => dir.to_string(),
        (false, false) => format!("{dir}/{name}"),
    }
}

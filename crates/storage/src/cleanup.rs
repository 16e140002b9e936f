//! Compensating-action log for multi-step operations.
//!
//! Every side effect an operation produces (a temp file, an uploaded pack,
//! a freshly created remote folder) is staged here with its undo step.
//! Steps confirmed durable are removed again; whatever is left when the
//! operation ends is executed by [`CleanupService::clean`].

use crate::error::StorageError;
use crate::traits::StorageBackend;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// A single staged undo step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CleanupOperation {
    /// Remove a local file or directory tree.
    Local { path: PathBuf, is_dir: bool },
    /// Remove a file or folder through the bound backend.
    Remote {
        dir: String,
        name: String,
        is_dir: bool,
    },
    /// Reserved for undoing remote API calls. Executing it does nothing.
    RestApiCall { url: String, method: String },
}

impl fmt::Display for CleanupOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local { path, .. } => write!(f, "local {}", path.display()),
            Self::Remote { dir, name, .. } => write!(f, "remote {dir}/{name}"),
            Self::RestApiCall { url, method } => write!(f, "rest {method} {url}"),
        }
    }
}

/// A step that failed during [`CleanupService::clean`].
#[derive(Debug, thiserror::Error)]
#[error("cleanup of {operation} failed: {error}")]
pub struct CleanupFailure {
    pub operation: CleanupOperation,
    #[source]
    pub error: StorageError,
}

/// Every step that failed in one cleanup run.
#[derive(Debug, thiserror::Error)]
#[error("{} cleanup step(s) failed", .0.len())]
pub struct CleanupErrors(pub Vec<CleanupFailure>);

impl CleanupErrors {
    pub fn messages(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

#[derive(Default)]
pub struct CleanupService {
    operations: Vec<CleanupOperation>,
    backend: Option<Arc<dyn StorageBackend>>,
}

impl fmt::Debug for CleanupService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CleanupService")
            .field("operations", &self.operations)
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .finish()
    }
}

impl CleanupService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(backend: Arc<dyn StorageBackend>) -> Self {
        Self {
            operations: Vec::new(),
            backend: Some(backend),
        }
    }

    /// Bind the backend used for remote steps.
    pub fn set_backend(&mut self, backend: Arc<dyn StorageBackend>) {
        self.backend = Some(backend);
    }

    pub fn add_local_file(&mut self, path: impl Into<PathBuf>) {
        self.push(CleanupOperation::Local {
            path: path.into(),
            is_dir: false,
        });
    }

    pub fn add_local_folder(&mut self, path: impl Into<PathBuf>) {
        self.push(CleanupOperation::Local {
            path: path.into(),
            is_dir: true,
        });
    }

    pub fn add_remote_file(&mut self, dir: &str, name: &str) {
        self.push(CleanupOperation::Remote {
            dir: dir.to_string(),
            name: name.to_string(),
            is_dir: false,
        });
    }

    pub fn add_remote_folder(&mut self, dir: &str, name: &str) {
        self.push(CleanupOperation::Remote {
            dir: dir.to_string(),
            name: name.to_string(),
            is_dir: true,
        });
    }

    pub fn add_rest_api_call(&mut self, url: &str, method: &str) {
        self.push(CleanupOperation::RestApiCall {
            url: url.to_string(),
            method: method.to_string(),
        });
    }

    /// Cancel every staged step for a local path.
    pub fn remove_local(&mut self, path: &Path) {
        self.operations
            .retain(|op| !matches!(op, CleanupOperation::Local { path: p, .. } if p == path));
    }

    /// Cancel every staged step for a remote location.
    pub fn remove_remote(&mut self, dir: &str, name: &str) {
        self.operations.retain(|op| {
            !matches!(op, CleanupOperation::Remote { dir: d, name: n, .. } if d == dir && n == name)
        });
    }

    pub fn operations(&self) -> &[CleanupOperation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Execute every staged step, newest first.
    ///
    /// A failing step does not stop the rest. A missing target counts as
    /// already clean. The log is empty afterwards whatever the outcome.
    pub async fn clean(&mut self) -> Result<(), CleanupErrors> {
        let mut failures = Vec::new();
        while let Some(operation) = self.operations.pop() {
            if let Err(error) = self.execute(&operation).await {
                warn!(step = %operation, error = %error, "cleanup step failed");
                failures.push(CleanupFailure { operation, error });
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(CleanupErrors(failures))
        }
    }

    fn push(&mut self, operation: CleanupOperation) {
        if !self.operations.contains(&operation) {
            debug!(step = %operation, "staged cleanup step");
            self.operations.push(operation);
        }
    }

    async fn execute(&self, operation: &CleanupOperation) -> Result<(), StorageError> {
        match operation {
            CleanupOperation::Local { path, is_dir } => {
                let result = if *is_dir {
                    tokio::fs::remove_dir_all(path).await
                } else {
                    tokio::fs::remove_file(path).await
                };
                match result {
                    Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
                    _ => Ok(()),
                }
            }
            CleanupOperation::Remote { dir, name, is_dir } => {
                let backend = self
                    .backend
                    .as_ref()
                    .ok_or_else(|| StorageError::NoBackend(format!("{dir}/{name}")))?;
                let result = if *is_dir {
                    backend.delete_folder(dir, name).await
                } else {
                    backend.delete_file(dir, name).await
                };
                match result {
                    Err(StorageError::NotFound(_)) => Ok(()),
                    other => other,
                }
            }
            CleanupOperation::RestApiCall { .. } => Ok(()),
        }
    }
}

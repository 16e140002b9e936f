//! Catalog error types.

use vmcatalog_metadata::MetadataError;
use vmcatalog_storage::{CleanupErrors, StorageError};

/// Catalog operation errors.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transfer failed: {0}")]
    Transfer(#[from] StorageError),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("not enough disk space: {0}")]
    FatalCapacity(String),

    #[error("cleanup failed: {}", .0.join("; "))]
    Cleanup(Vec<String>),

    #[error("{source}; cleanup also failed: {}", .cleanup.join("; "))]
    WithCleanupFailures {
        #[source]
        source: Box<CatalogError>,
        cleanup: Vec<String>,
    },

    #[error("remote catalog returned {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("hypervisor error: {0}")]
    Hypervisor(String),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),

    #[error("core error: {0}")]
    Core(#[from] vmcatalog_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CatalogError {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote {
            status: e.status().map(|s| s.as_u16()).unwrap_or(502),
            message: e.to_string(),
        }
    }
}

impl CatalogError {
    /// Get the error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound(_) => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Transfer(_) => "transfer_error",
            Self::Integrity(_) => "integrity_error",
            Self::FatalCapacity(_) => "insufficient_space",
            Self::Cleanup(_) => "cleanup_error",
            Self::WithCleanupFailures { source, .. } => source.code(),
            Self::Remote { .. } => "remote_error",
            Self::Hypervisor(_) => "hypervisor_error",
            Self::Metadata(_) => "metadata_error",
            Self::Core(_) => "core_error",
            Self::Io(_) => "io_error",
            Self::Json(_) => "json_error",
        }
    }

    /// HTTP-style status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) | Self::Integrity(_) => 400,
            Self::NotFound(_) => 404,
            Self::Conflict(_) => 409,
            Self::Transfer(StorageError::NotFound(_)) => 404,
            Self::Transfer(_) | Self::FatalCapacity(_) | Self::Hypervisor(_) => 500,
            Self::Cleanup(_) => 500,
            Self::WithCleanupFailures { source, .. } => source.status_code(),
            Self::Remote { status, .. } => *status,
            Self::Metadata(MetadataError::NotFound(_)) => 404,
            Self::Metadata(MetadataError::AlreadyExists(_)) => 409,
            Self::Metadata(_) => 500,
            Self::Core(_) => 400,
            Self::Io(_) | Self::Json(_) => 500,
        }
    }

    /// Attach cleanup failures to this error. No-op without failures.
    pub fn with_cleanup(self, cleanup: Option<CleanupErrors>) -> Self {
        match cleanup {
            Some(errors) if !errors.0.is_empty() => Self::WithCleanupFailures {
                source: Box::new(self),
                cleanup: errors.messages(),
            },
            _ => self,
        }
    }
}

impl From<CleanupErrors> for CatalogError {
    fn from(errors: CleanupErrors) -> Self {
        Self::Cleanup(errors.messages())
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;

pub(crate) fn join_error(e: tokio::task::JoinError) -> CatalogError {
    CatalogError::Io(std::io::Error::other(format!("spawn_blocking failed: {e}")))
}

//! Storage backends for VM catalog packs.
//!
//! This crate provides:
//! - The `StorageBackend` trait and the probe registry that picks a backend
//!   from a connection string
//! - Backends: local filesystem, S3-compatible and Azure Blob Storage
//! - The pack archive codec (tar, optionally gzip compressed)
//! - The cleanup log used to roll back partially applied operations

pub mod archive;
pub mod backends;
pub mod cleanup;
pub mod error;
pub mod registry;
pub mod traits;

pub use backends::{AzureBlobBackend, LocalBackend, S3Backend};
pub use cleanup::{CleanupErrors, CleanupFailure, CleanupOperation, CleanupService};
pub use error::{StorageError, StorageResult};
pub use registry::BackendRegistry;
pub use traits::{
    BackendProbe, CheckOutcome, ProgressSender, ProgressSink, StorageBackend, TransferProgress,
};

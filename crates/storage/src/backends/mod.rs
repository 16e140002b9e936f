//! Storage backend implementations.

pub mod azure;
pub mod local;
pub mod s3;

pub use azure::{AzureBlobBackend, AzureProbe};
pub use local::{LocalBackend, LocalProbe};
pub use s3::{S3Backend, S3Probe};

//! Core domain types shared by every vmcatalog crate.
//!
//! - Provider connection strings and backend selection
//! - Catalog manifests and their deterministic naming rules
//! - SHA-256 checksums
//! - Configuration

pub mod config;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod provider;

pub use error::{Error, Result};
pub use hash::{ContentHash, checksums_match, file_checksum};
pub use manifest::{CacheType, CachedManifests, ContentItem, Manifest, VmType};
pub use provider::Provider;

/// Bytes per megabyte, the unit used for manifest and cache sizes.
pub const MB: i64 = 1024 * 1024;

/// Convert a byte count to whole megabytes, rounding up.
pub fn bytes_to_mb(bytes: u64) -> i64 {
    let mb = bytes.div_ceil(MB as u64);
    i64::try_from(mb).unwrap_or(i64::MAX)
}

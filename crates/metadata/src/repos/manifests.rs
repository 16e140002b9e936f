//! Manifest repository.

use crate::error::MetadataResult;
use async_trait::async_trait;
use time::OffsetDateTime;
use vmcatalog_core::Manifest;

/// Repository for catalog manifests.
#[async_trait]
pub trait ManifestRepo: Send + Sync {
    /// Insert a new manifest. Fails with `AlreadyExists` on a duplicate id
    /// or a duplicate catalog/version/architecture identity.
    async fn create_manifest(&self, manifest: &Manifest) -> MetadataResult<()>;

    /// Replace an existing manifest document.
    async fn update_manifest(&self, manifest: &Manifest) -> MetadataResult<()>;

    async fn get_manifest(&self, id: &str) -> MetadataResult<Option<Manifest>>;

    /// Manifests of a catalog, matched case-insensitively. `None` filters
    /// match every version or architecture.
    async fn find_manifests(
        &self,
        catalog_id: &str,
        version: Option<&str>,
        architecture: Option<&str>,
    ) -> MetadataResult<Vec<Manifest>>;

    async fn list_manifests(&self) -> MetadataResult<Vec<Manifest>>;

    /// Delete by id. Returns whether a row was removed.
    async fn delete_manifest(&self, id: &str) -> MetadataResult<bool>;

    /// Bump the download counter and record who pulled it.
    async fn record_download(
        &self,
        id: &str,
        user: &str,
        at: OffsetDateTime,
    ) -> MetadataResult<()>;
}

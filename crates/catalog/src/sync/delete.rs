use super::{CatalogService, catalog_dir, require, split_remote};
use crate::error::{CatalogError, CatalogResult};
use std::collections::HashSet;
use tracing::{info, instrument, warn};
use vmcatalog_core::Manifest;
use vmcatalog_storage::CleanupService;

/// Remove published manifests. Missing version or architecture select all.
#[derive(Clone, Debug, Default)]
pub struct DeleteRequest {
    pub catalog_id: String,
    pub version: Option<String>,
    pub architecture: Option<String>,
}

impl CatalogService {
    /// Delete the matching manifests from their backends and the store.
    ///
    /// Every manifest is attempted. The catalog folder goes too once no
    /// remaining manifest lives in it. Returns the removed manifests.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id))]
    pub async fn delete(&self, request: &DeleteRequest) -> CatalogResult<Vec<Manifest>> {
        require(&request.catalog_id, "catalog_id")?;
        let version = request.version.as_deref().filter(|v| !v.trim().is_empty());
        let architecture = request
            .architecture
            .as_deref()
            .filter(|a| !a.trim().is_empty());

        let targets = self
            .find_existing(&request.catalog_id, version, architecture)
            .await?;
        if targets.is_empty() {
            return Err(CatalogError::NotFound(format!(
                "no catalog manifest found for {}",
                request.catalog_id
            )));
        }
        let own = catalog_dir(&request.catalog_id);
        let own_emptied = self.own_folder_emptied(&own, &targets).await?;

        let mut failures = Vec::new();
        let mut removed = Vec::new();
        for manifest in targets {
            let remove_folder = own_emptied && same_folder(&manifest.path, &own);
            match self.delete_one(&manifest, remove_folder).await {
                Ok(()) => removed.push(manifest),
                Err(err) => {
                    warn!(id = %manifest.id, error = %err, "could not delete manifest");
                    failures.push(format!("{}: {err}", manifest.name));
                }
            }
        }

        if !failures.is_empty() {
            return Err(CatalogError::Cleanup(failures));
        }
        info!(count = removed.len(), "deleted catalog manifests");
        Ok(removed)
    }

    /// Whether the catalog's own folder is unused once `targets` are gone.
    ///
    /// Shared folders that imported packs live in never qualify.
    async fn own_folder_emptied(&self, own: &str, targets: &[Manifest]) -> CatalogResult<bool> {
        if !targets.iter().any(|m| same_folder(&m.path, own)) {
            return Ok(false);
        }
        let doomed: HashSet<&str> = targets.iter().map(|m| m.id.as_str()).collect();
        let survivors = self.store.list_manifests().await?;
        Ok(!survivors
            .iter()
            .any(|m| !doomed.contains(m.id.as_str()) && same_folder(&m.path, own)))
    }

    async fn delete_one(&self, manifest: &Manifest, remove_folder: bool) -> CatalogResult<()> {
        let provider = manifest.provider.as_ref().ok_or_else(|| {
            CatalogError::Validation(format!("manifest {} has no provider", manifest.name))
        })?;
        let backend = self.resolve_backend(provider).await?;

        // Executed newest first: files, then the folder.
        let mut cleanup = CleanupService::with_backend(backend);
        if remove_folder && !manifest.path.trim_matches('/').is_empty() {
            let (parent, folder) = split_remote(&manifest.path);
            cleanup.add_remote_folder(&parent, &folder);
        }
        cleanup.add_remote_file(&manifest.path, &manifest.pack_file);
        cleanup.add_remote_file(&manifest.path, &manifest.metadata_file);
        cleanup.clean().await?;

        self.store.delete_manifest(&manifest.id).await?;
        self.notifier
            .info(&format!("Deleted catalog manifest {}", manifest.name));
        Ok(())
    }
}

fn same_folder(a: &str, b: &str) -> bool {
    a.trim_matches('/') == b.trim_matches('/')
}

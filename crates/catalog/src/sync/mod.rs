//! Manifest synchronization between local VM folders, storage backends,
//! the metadata store and the hypervisor.
//!
//! Every operation binds its own [`CleanupService`] to the backend it
//! resolved. Temp files are staged for deletion as they are created and
//! remote artifacts are staged as undo steps; the undo steps are cancelled
//! once the operation has committed, and the log is executed before the
//! operation returns either way.

mod delete;
mod import;
mod pull;
mod push;

pub use delete::DeleteRequest;
pub use import::{ImportRequest, ImportVmRequest};
pub use pull::{PullRequest, PullResponse};
pub use push::{PushMetadataRequest, PushRequest};

use crate::cache::CacheService;
use crate::error::{CatalogError, CatalogResult};
use crate::hypervisor::Hypervisor;
use crate::notifier::Notifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;
use vmcatalog_core::{Manifest, Provider};
use vmcatalog_metadata::MetadataError;
use vmcatalog_metadata::MetadataStore;
use vmcatalog_metadata::models::{ClaimRow, RoleRow};
use vmcatalog_storage::{BackendRegistry, CleanupService, StorageBackend};

/// Entry point for push, pull, import and delete.
pub struct CatalogService {
    registry: BackendRegistry,
    store: Arc<dyn MetadataStore>,
    cache: CacheService,
    hypervisor: Arc<dyn Hypervisor>,
    notifier: Arc<dyn Notifier>,
    temp_dir: PathBuf,
}

impl CatalogService {
    pub fn new(
        registry: BackendRegistry,
        store: Arc<dyn MetadataStore>,
        cache: CacheService,
        hypervisor: Arc<dyn Hypervisor>,
        notifier: Arc<dyn Notifier>,
        temp_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            registry,
            store,
            cache,
            hypervisor,
            notifier,
            temp_dir: temp_dir.into(),
        }
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    /// First registered backend that claims `provider`.
    async fn resolve_backend(&self, provider: &Provider) -> CatalogResult<Arc<dyn StorageBackend>> {
        self.registry.resolve(provider).await?.ok_or_else(|| {
            CatalogError::Validation(format!(
                "no storage backend matched provider {:?} (known: {})",
                provider.kind,
                self.registry.names().join(", ")
            ))
        })
    }

    /// Fresh scratch directory under the temp dir, staged for deletion.
    async fn work_dir(&self, operation: &str, cleanup: &mut CleanupService) -> CatalogResult<PathBuf> {
        let dir = self
            .temp_dir
            .join(format!("{operation}-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&dir).await?;
        cleanup.add_local_folder(&dir);
        Ok(dir)
    }

    /// Create every role and claim the manifest requires that is not known yet.
    async fn ensure_access_rows(&self, manifest: &Manifest) -> CatalogResult<()> {
        for role in manifest.required_roles.iter().filter(|r| !r.trim().is_empty()) {
            if self.store.get_role_by_name(role).await?.is_none() {
                self.notifier.info(&format!("Creating role {role}"));
                ignore_existing(self.store.create_role(&RoleRow::new(role)).await)?;
            }
        }
        for claim in manifest.required_claims.iter().filter(|c| !c.trim().is_empty()) {
            if self.store.get_claim_by_name(claim).await?.is_none() {
                self.notifier.info(&format!("Creating claim {claim}"));
                ignore_existing(self.store.create_claim(&ClaimRow::new(claim)).await)?;
            }
        }
        Ok(())
    }

    /// Manifests stored for an identity. The architecture is normalized first.
    async fn find_existing(
        &self,
        catalog_id: &str,
        version: Option<&str>,
        architecture: Option<&str>,
    ) -> CatalogResult<Vec<Manifest>> {
        let architecture = architecture.map(vmcatalog_core::manifest::normalize_architecture);
        Ok(self
            .store
            .find_manifests(catalog_id, version, architecture.as_deref())
            .await?)
    }
}

/// Execute the cleanup log and fold its failures into the outcome.
///
/// Failures after a successful operation only concern temp files and are
/// logged.
async fn finish<T>(cleanup: &mut CleanupService, result: CatalogResult<T>) -> CatalogResult<T> {
    match result {
        Ok(value) => {
            if let Err(errors) = cleanup.clean().await {
                warn!(failed = errors.0.len(), "could not remove temporary files");
            }
            Ok(value)
        }
        Err(err) => Err(err.with_cleanup(cleanup.clean().await.err())),
    }
}

fn ignore_existing(result: Result<(), MetadataError>) -> CatalogResult<()> {
    match result {
        Ok(()) | Err(MetadataError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remote folder of a catalog: `/<catalog_id>` in lowercase.
fn catalog_dir(catalog_id: &str) -> String {
    format!("/{}", catalog_id.trim().to_lowercase())
}

/// Split a remote path into its parent folder and last component.
fn split_remote(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((parent, name)) => {
            let parent = if parent.is_empty() { "/" } else { parent };
            (parent.to_string(), name.to_string())
        }
        None => ("/".to_string(), trimmed.to_string()),
    }
}

fn require(value: &str, field: &str) -> CatalogResult<()> {
    if value.trim().is_empty() {
        return Err(CatalogError::Validation(format!("{field} is required")));
    }
    Ok(())
}

async fn read_manifest(path: &Path) -> CatalogResult<Manifest> {
    let data = tokio::fs::read(path).await?;
    Ok(Manifest::from_metadata_json(&data)?)
}

async fn write_manifest(manifest: &Manifest, path: &Path) -> CatalogResult<()> {
    tokio::fs::write(path, manifest.to_metadata_json()?).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_remote_paths() {
        assert_eq!(
            split_remote("/ubuntu/images/a.pdpack"),
            ("/ubuntu/images".to_string(), "a.pdpack".to_string())
        );
        assert_eq!(split_remote("/ubuntu"), ("/".to_string(), "ubuntu".to_string()));
        assert_eq!(split_remote("ubuntu/"), ("/".to_string(), "ubuntu".to_string()));
    }

    #[test]
    fn catalog_dir_is_lowercase() {
        assert_eq!(catalog_dir(" Ubuntu "), "/ubuntu");
    }

    #[test]
    fn require_rejects_blank() {
        assert!(require("  ", "catalog_id").is_err());
        assert!(require("x", "catalog_id").is_ok());
    }
}

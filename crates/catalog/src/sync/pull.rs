use super::{CatalogService, finish, require};
use crate::cache::CacheRequest;
use crate::error::{CatalogError, CatalogResult, join_error};
use crate::fsutil::{copy_tree, path_exists};
use crate::hypervisor::RegisterVmRequest;
use crate::remote_api::RemoteCatalogClient;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use vmcatalog_core::manifest::{LATEST_TAG, METADATA_EXTENSION, normalize_architecture};
use vmcatalog_core::{CacheType, ContentItem, Manifest, Provider};
use vmcatalog_storage::{CleanupService, StorageBackend, archive};

/// Materialize a published manifest as a registered local VM.
#[derive(Clone, Debug, Default)]
pub struct PullRequest {
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    pub machine_name: String,
    /// Existing folder the VM bundle is created in.
    pub path: PathBuf,
    /// Remote catalog to resolve the manifest from. The local store is
    /// used when absent or not remote.
    pub connection: Option<String>,
    pub owner: Option<String>,
}

impl PullRequest {
    fn validate(&self) -> CatalogResult<()> {
        require(&self.catalog_id, "catalog_id")?;
        require(&self.architecture, "architecture")?;
        require(&self.machine_name, "machine_name")?;
        if self.path.as_os_str().is_empty() {
            return Err(CatalogError::Validation("path is required".to_string()));
        }
        Ok(())
    }

    fn version(&self) -> &str {
        if self.version.trim().is_empty() {
            LATEST_TAG
        } else {
            &self.version
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct PullResponse {
    pub manifest: Manifest,
    pub machine_id: String,
    pub machine_name: String,
    pub local_path: PathBuf,
    pub from_cache: bool,
}

impl CatalogService {
    /// Download a manifest's pack into a fresh VM folder and register it.
    ///
    /// The folder is removed again if any step fails.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id, machine = %request.machine_name))]
    pub async fn pull(&self, request: &PullRequest) -> CatalogResult<PullResponse> {
        request.validate()?;
        if let Some(vm) = self.hypervisor.get_vm(&request.machine_name).await? {
            return Err(CatalogError::Conflict(format!(
                "machine {} already exists with id {}",
                request.machine_name, vm.id
            )));
        }

        let (manifest, from_store) = self.resolve_pull_manifest(request).await?;
        if manifest.tainted {
            return Err(CatalogError::Validation(format!(
                "manifest {} is tainted",
                manifest.name
            )));
        }
        if manifest.revoked {
            return Err(CatalogError::Validation(format!(
                "manifest {} is revoked",
                manifest.name
            )));
        }
        if !path_exists(&request.path).await {
            return Err(CatalogError::Validation(format!(
                "destination {} does not exist",
                request.path.display()
            )));
        }

        let provider = manifest.provider.clone().ok_or_else(|| {
            CatalogError::Validation(format!("manifest {} has no provider", manifest.name))
        })?;
        let backend = self.resolve_backend(&provider).await?;

        let mut cleanup = CleanupService::with_backend(Arc::clone(&backend));
        let result = self
            .pull_inner(request, manifest, backend, &mut cleanup)
            .await;
        let response = finish(&mut cleanup, result).await?;

        if from_store {
            let user = request.owner.as_deref().unwrap_or_default();
            self.store
                .record_download(&response.manifest.id, user, OffsetDateTime::now_utc())
                .await?;
        }
        info!(
            machine_id = %response.machine_id,
            path = %response.local_path.display(),
            from_cache = response.from_cache,
            "pulled catalog manifest"
        );
        Ok(response)
    }

    /// The manifest to pull and whether it came from the local store.
    async fn resolve_pull_manifest(&self, request: &PullRequest) -> CatalogResult<(Manifest, bool)> {
        let architecture = normalize_architecture(&request.architecture);
        let remote = request
            .connection
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(Provider::parse)
            .transpose()?
            .filter(Provider::is_remote);

        if let Some(provider) = remote {
            debug!(host = %provider.host, "resolving manifest from remote catalog");
            let client = RemoteCatalogClient::new(&provider)?;
            let manifest = client
                .get_download_manifest(&request.catalog_id, request.version(), &architecture)
                .await?;
            return Ok((manifest, false));
        }

        let manifest = self
            .find_existing(&request.catalog_id, Some(request.version()), Some(&architecture))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                CatalogError::NotFound(format!(
                    "manifest {}/{}/{} not found",
                    request.catalog_id,
                    request.version(),
                    architecture
                ))
            })?;
        Ok((manifest, true))
    }

    async fn pull_inner(
        &self,
        request: &PullRequest,
        manifest: Manifest,
        backend: Arc<dyn StorageBackend>,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<PullResponse> {
        let vm_type = manifest.vm_type().ok_or_else(|| {
            CatalogError::Validation(format!("manifest {} has no known VM type", manifest.name))
        })?;
        let target =
            allocate_machine_folder(&request.path, &request.machine_name, vm_type.extension())
                .await;
        tokio::fs::create_dir_all(&target).await?;
        cleanup.add_local_folder(&target);

        let from_cache = if self.cache.is_enabled() {
            self.pull_through_cache(&manifest, &backend, &target).await?;
            true
        } else {
            self.pull_direct(&manifest, &backend, &target, cleanup).await?;
            false
        };

        self.notifier.info("Registering virtual machine");
        self.hypervisor
            .register_vm(&RegisterVmRequest {
                path: target.clone(),
                machine_name: request.machine_name.clone(),
                owner: request.owner.clone(),
                regenerate_source_uuid: true,
            })
            .await?;

        let mut found = self.hypervisor.find_vms_by_home(&target).await?;
        if found.len() != 1 {
            return Err(CatalogError::Hypervisor(format!(
                "expected one machine registered at {}, found {}",
                target.display(),
                found.len()
            )));
        }
        let vm = found.remove(0);
        if vm.name != request.machine_name {
            self.hypervisor
                .rename_vm(&vm.id, &request.machine_name)
                .await?;
        }

        cleanup.remove_local(&target);
        Ok(PullResponse {
            manifest,
            machine_id: vm.id,
            machine_name: request.machine_name.clone(),
            local_path: target,
            from_cache,
        })
    }

    async fn pull_through_cache(
        &self,
        manifest: &Manifest,
        backend: &Arc<dyn StorageBackend>,
        target: &Path,
    ) -> CatalogResult<()> {
        let request = CacheRequest::new(manifest.clone(), Arc::clone(backend)).await?;
        if self.cache.is_cached(&request).await {
            self.notifier.info("Catalog pack found in cache");
        } else {
            self.notifier.info("Caching catalog pack");
            self.cache.cache(&request).await?;
        }
        let cached = self.cache.mark_used(&request).await?;

        let source = Path::new(&cached.cache_local_full_path).join(&cached.cache_file_name);
        let destination = match cached.cache_type {
            CacheType::File => target.join(&manifest.pack_file),
            _ => target.to_path_buf(),
        };
        self.notifier.info("Copying cached machine");
        tokio::task::spawn_blocking(move || copy_tree(&source, &destination))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    async fn pull_direct(
        &self,
        manifest: &Manifest,
        backend: &Arc<dyn StorageBackend>,
        target: &Path,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<()> {
        let streams = backend.can_stream() && self.cache.config().stream_enabled;
        let work = if streams {
            None
        } else {
            Some(self.work_dir("pull", cleanup).await?)
        };

        for item in pack_items(manifest) {
            let dir = if item.path.is_empty() {
                manifest.path.as_str()
            } else {
                item.path.as_str()
            };
            self.notifier.info(&format!("Downloading {}", item.name));
            match &work {
                None => {
                    backend
                        .pull_file_and_decompress(dir, &item.name, target)
                        .await?;
                }
                Some(work) => {
                    backend.pull_file(dir, &item.name, work).await?;
                    let pack = work.join(&item.name);
                    cleanup.add_local_file(&pack);
                    let destination = target.to_path_buf();
                    tokio::task::spawn_blocking(move || archive::unpack_file(&pack, &destination))
                        .await
                        .map_err(join_error)??;
                }
            }
        }

        let root = target.to_path_buf();
        tokio::task::spawn_blocking(move || archive::flatten_bundle(&root))
            .await
            .map_err(join_error)??;
        Ok(())
    }
}

/// Content entries to download: everything but metadata files.
fn pack_items(manifest: &Manifest) -> Vec<ContentItem> {
    let metadata_suffix = format!(".{METADATA_EXTENSION}");
    if manifest.pack_contents.is_empty() {
        return vec![ContentItem {
            name: manifest.pack_file.clone(),
            path: manifest.path.clone(),
            ..ContentItem::default()
        }];
    }
    manifest
        .pack_contents
        .iter()
        .filter(|item| !item.is_dir && !item.name.ends_with(&metadata_suffix))
        .cloned()
        .collect()
}

/// `<parent>/<name>.<ext>`, or the first free `<name>_<n>.<ext>`.
async fn allocate_machine_folder(parent: &Path, machine_name: &str, extension: &str) -> PathBuf {
    let mut candidate = parent.join(format!("{machine_name}.{extension}"));
    let mut suffix = 1;
    while path_exists(&candidate).await {
        candidate = parent.join(format!("{machine_name}_{suffix}.{extension}"));
        suffix += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocates_non_colliding_folders() {
        let dir = tempfile::tempdir().unwrap();
        let first = allocate_machine_folder(dir.path(), "web", "pvm").await;
        assert_eq!(first, dir.path().join("web.pvm"));

        tokio::fs::create_dir_all(&first).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("web_1.pvm")).await.unwrap();
        let third = allocate_machine_folder(dir.path(), "web", "pvm").await;
        assert_eq!(third, dir.path().join("web_2.pvm"));
    }

    #[test]
    fn pack_items_skip_metadata() {
        let mut manifest = Manifest::new("ubuntu", "1", "x86_64");
        manifest.path = "/ubuntu".to_string();
        assert_eq!(pack_items(&manifest)[0].name, manifest.pack_file);

        manifest.pack_contents = vec![
            ContentItem {
                name: manifest.metadata_file.clone(),
                ..ContentItem::default()
            },
            ContentItem {
                name: manifest.pack_file.clone(),
                ..ContentItem::default()
            },
        ];
        let items = pack_items(&manifest);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].name, manifest.pack_file);
    }
}

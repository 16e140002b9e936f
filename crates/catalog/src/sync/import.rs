use super::{
    CatalogService, catalog_dir, finish, read_manifest, require, split_remote, write_manifest,
};
use crate::error::{CatalogError, CatalogResult};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use vmcatalog_core::manifest::{
    manifest_name, metadata_file_name, normalize_architecture, pack_file_name,
};
use vmcatalog_core::{Manifest, Provider, VmType, bytes_to_mb};
use vmcatalog_storage::{CleanupService, StorageBackend};

/// Adopt a `<catalog>/<name>.meta` and `.pdpack` pair already on a backend.
#[derive(Clone, Debug, Default)]
pub struct ImportRequest {
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    pub connection: String,
}

/// Adopt a single pack file uploaded outside the catalog.
#[derive(Clone, Debug, Default)]
pub struct ImportVmRequest {
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    pub connection: String,
    /// Remote path of the pack, relative to the backend root.
    pub machine_remote_path: String,
    /// `pvm` or `macvm`.
    pub vm_type: String,
    pub is_compressed: bool,
    /// Regenerate metadata even when the backend already has one.
    pub force: bool,
    pub description: String,
    pub required_roles: Vec<String>,
    pub required_claims: Vec<String>,
    pub tags: Vec<String>,
}

impl CatalogService {
    /// Register an uploaded pack without transferring it.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id, version = %request.version))]
    pub async fn import(&self, request: &ImportRequest) -> CatalogResult<Manifest> {
        require(&request.catalog_id, "catalog_id")?;
        require(&request.architecture, "architecture")?;
        let provider = self.parse_import_connection(&request.connection)?;
        let backend = self.resolve_backend(&provider).await?;

        let mut cleanup = CleanupService::with_backend(Arc::clone(&backend));
        let result = self
            .import_inner(request, provider, backend, &mut cleanup)
            .await;
        finish(&mut cleanup, result).await
    }

    fn parse_import_connection(&self, connection: &str) -> CatalogResult<Provider> {
        require(connection, "connection")?;
        let provider = Provider::parse(connection)?;
        if provider.is_remote() {
            return Err(CatalogError::Validation(
                "imports are not supported for remote catalogs".to_string(),
            ));
        }
        Ok(provider)
    }

    async fn import_inner(
        &self,
        request: &ImportRequest,
        provider: Provider,
        backend: Arc<dyn StorageBackend>,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<Manifest> {
        let architecture = normalize_architecture(&request.architecture);
        let name = manifest_name(&request.catalog_id, &architecture, &request.version);
        let dir = catalog_dir(&request.catalog_id);
        let metadata_file = metadata_file_name(&name);
        let pack_file = pack_file_name(&name);

        for file in [&metadata_file, &pack_file] {
            if !backend.file_exists(&dir, file).await? {
                return Err(CatalogError::NotFound(format!(
                    "remote file {dir}/{file} does not exist"
                )));
            }
        }

        let work = self.work_dir("import", cleanup).await?;
        backend.pull_file(&dir, &metadata_file, &work).await?;
        let mut manifest = read_manifest(&work.join(&metadata_file)).await?;
        manifest.catalog_id = request.catalog_id.clone();
        manifest.version = request.version.clone();
        manifest.architecture = architecture;
        manifest.validate()?;

        self.reject_duplicate(&manifest).await?;
        self.ensure_access_rows(&manifest).await?;
        manifest.provider = Some(provider);
        self.store.create_manifest(&manifest).await?;
        info!(id = %manifest.id, name = %manifest.name, "imported catalog manifest");
        Ok(manifest)
    }

    async fn reject_duplicate(&self, manifest: &Manifest) -> CatalogResult<()> {
        let existing = self
            .find_existing(
                &manifest.catalog_id,
                Some(&manifest.version),
                Some(&manifest.architecture),
            )
            .await?;
        if !existing.is_empty() {
            return Err(CatalogError::Conflict(format!(
                "manifest {} already exists",
                manifest.name
            )));
        }
        Ok(())
    }

    /// Build a manifest for a bare remote pack, store it, and publish
    /// fresh metadata next to the pack.
    ///
    /// With `force` an existing remote metadata file is regenerated in
    /// place. The stored record is removed again if publishing fails.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id, path = %request.machine_remote_path))]
    pub async fn import_vm(&self, request: &ImportVmRequest) -> CatalogResult<Manifest> {
        require(&request.catalog_id, "catalog_id")?;
        require(&request.architecture, "architecture")?;
        require(&request.machine_remote_path, "machine_remote_path")?;
        let provider = self.parse_import_connection(&request.connection)?;
        let backend = self.resolve_backend(&provider).await?;

        let mut cleanup = CleanupService::with_backend(Arc::clone(&backend));
        let result = self
            .import_vm_inner(request, provider, backend, &mut cleanup)
            .await;
        finish(&mut cleanup, result).await
    }

    async fn import_vm_inner(
        &self,
        request: &ImportVmRequest,
        provider: Provider,
        backend: Arc<dyn StorageBackend>,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<Manifest> {
        let remote_path = format!("/{}", request.machine_remote_path.trim_start_matches('/'));
        let (dir, pack_file) = split_remote(&remote_path);
        if !backend.file_exists(&dir, &pack_file).await? {
            return Err(CatalogError::NotFound(format!(
                "remote pack {remote_path} does not exist"
            )));
        }
        let pack_bytes = backend.file_size(&dir, &pack_file).await?;

        let architecture = normalize_architecture(&request.architecture);
        // Nothing remote is touched before the identity is known to be free.
        self.reject_duplicate(&Manifest::new(
            &request.catalog_id,
            &request.version,
            &architecture,
        ))
        .await?;
        let name = manifest_name(&request.catalog_id, &architecture, &request.version);
        let metadata_file = metadata_file_name(&name);
        let work = self.work_dir("import-vm", cleanup).await?;

        let metadata_exists = backend.file_exists(&dir, &metadata_file).await?;
        let mut manifest = if metadata_exists && !request.force {
            backend.pull_file(&dir, &metadata_file, &work).await?;
            let loaded = read_manifest(&work.join(&metadata_file)).await?;
            tokio::fs::remove_file(work.join(&metadata_file)).await?;
            loaded
        } else {
            if metadata_exists {
                self.notifier.info("Regenerating existing remote metadata");
            }
            fresh_manifest(request)?
        };

        manifest.catalog_id = request.catalog_id.clone();
        manifest.version = request.version.clone();
        manifest.architecture = architecture;
        manifest.refresh_identity();
        manifest.path = dir.clone();
        manifest.pack_file = pack_file.clone();
        manifest.pack_relative_path = pack_file.clone();
        manifest.metadata_file = metadata_file.clone();
        manifest.is_compressed = request.is_compressed;
        manifest.compressed_checksum = backend.file_checksum(&dir, &pack_file).await?;
        manifest.pack_size = i64::try_from(pack_bytes).unwrap_or(i64::MAX);
        manifest.size = bytes_to_mb(pack_bytes);
        let mut stored_provider = provider;
        for (key, value) in backend.provider_meta() {
            if stored_provider.get_meta(&key).is_none_or(str::is_empty) {
                stored_provider.set_meta(&key, value);
            }
        }
        manifest.provider = Some(stored_provider);
        manifest.validate()?;

        self.ensure_access_rows(&manifest).await?;
        self.store.create_manifest(&manifest).await?;

        if let Err(err) = self.publish_metadata(&manifest, &backend, &work).await {
            warn!(id = %manifest.id, error = %err, "metadata publish failed, removing stored manifest");
            if let Err(e) = self.store.delete_manifest(&manifest.id).await {
                warn!(id = %manifest.id, error = %e, "could not remove stored manifest");
            }
            return Err(err);
        }
        info!(id = %manifest.id, name = %manifest.name, "imported remote pack");
        Ok(manifest)
    }

    async fn publish_metadata(
        &self,
        manifest: &Manifest,
        backend: &Arc<dyn StorageBackend>,
        work: &std::path::Path,
    ) -> CatalogResult<()> {
        write_manifest(manifest, &work.join(&manifest.metadata_file)).await?;
        // Backends replace the object in one step, so the old metadata
        // survives a failed upload.
        backend
            .push_file(work, &manifest.path, &manifest.metadata_file)
            .await?;
        Ok(())
    }
}

fn fresh_manifest(request: &ImportVmRequest) -> CatalogResult<Manifest> {
    let vm_type = VmType::from_extension(&request.vm_type).ok_or_else(|| {
        CatalogError::Validation(format!("unknown VM type {:?}", request.vm_type))
    })?;
    let now = OffsetDateTime::now_utc();
    let mut manifest = Manifest::new(&request.catalog_id, &request.version, &request.architecture);
    manifest.vm_type = vm_type.extension().to_string();
    manifest.description = request.description.clone();
    manifest.required_roles = request.required_roles.clone();
    manifest.required_claims = request.required_claims.clone();
    manifest.tags = request.tags.clone();
    manifest.created_at = Some(now);
    manifest.updated_at = Some(now);
    Ok(manifest)
}

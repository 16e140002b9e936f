use super::{
    CatalogService, catalog_dir, finish, read_manifest, require, split_remote, write_manifest,
};
use crate::error::{CatalogError, CatalogResult, join_error};
use crate::remote_api::RemoteCatalogClient;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument};
use vmcatalog_core::manifest::normalize;
use vmcatalog_core::{
    ContentItem, Manifest, Provider, VmType, bytes_to_mb, checksums_match, file_checksum,
};
use vmcatalog_storage::{CleanupService, StorageBackend, archive};

/// Publish a local VM folder.
#[derive(Clone, Debug, Default)]
pub struct PushRequest {
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    /// VM bundle folder; its extension decides the VM type.
    pub local_path: PathBuf,
    pub connection: String,
    pub description: String,
    pub required_roles: Vec<String>,
    pub required_claims: Vec<String>,
    pub tags: Vec<String>,
}

impl PushRequest {
    fn validate(&self) -> CatalogResult<VmType> {
        require(&self.catalog_id, "catalog_id")?;
        require(&self.architecture, "architecture")?;
        require(&self.connection, "connection")?;
        if !self.local_path.is_dir() {
            return Err(CatalogError::Validation(format!(
                "local path {} is not a directory",
                self.local_path.display()
            )));
        }
        self.local_path
            .extension()
            .and_then(|ext| VmType::from_extension(&ext.to_string_lossy()))
            .ok_or_else(|| {
                CatalogError::Validation(format!(
                    "local path {} is not a .pvm or .macvm bundle",
                    self.local_path.display()
                ))
            })
    }
}

/// Rewrite the access fields of an already published manifest.
#[derive(Clone, Debug, Default)]
pub struct PushMetadataRequest {
    pub catalog_id: String,
    pub version: String,
    pub architecture: String,
    pub connection: String,
    pub required_roles: Vec<String>,
    pub required_claims: Vec<String>,
    pub tags: Vec<String>,
}

/// Pack file built from the local folder.
struct BuiltPack {
    dir: PathBuf,
    checksum: String,
}

impl CatalogService {
    /// Pack a local VM folder, upload what changed and register the manifest.
    ///
    /// A first push that fails removes everything it uploaded. A repeated
    /// push uploads the pack and the metadata only when their checksums
    /// differ from the remote copies.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id, version = %request.version))]
    pub async fn push(&self, request: &PushRequest) -> CatalogResult<Manifest> {
        let vm_type = request.validate()?;
        let provider = Provider::parse(&request.connection)?;
        let backend = self.resolve_backend(&provider).await?;
        self.notifier
            .info(&format!("Pushing {} to {}", request.catalog_id, backend.name()));

        let mut cleanup = CleanupService::with_backend(Arc::clone(&backend));
        let result = self
            .push_inner(request, vm_type, provider, backend, &mut cleanup)
            .await;
        finish(&mut cleanup, result).await
    }

    async fn push_inner(
        &self,
        request: &PushRequest,
        vm_type: VmType,
        provider: Provider,
        backend: Arc<dyn StorageBackend>,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<Manifest> {
        let mut manifest = Manifest::new(
            &normalize(&request.catalog_id),
            &request.version,
            &request.architecture,
        );
        manifest.description = request.description.clone();
        manifest.required_roles = request.required_roles.clone();
        manifest.required_claims = request.required_claims.clone();
        manifest.tags = request.tags.clone();
        manifest.vm_type = vm_type.extension().to_string();
        manifest.path = catalog_dir(&manifest.catalog_id);
        manifest.pack_relative_path = manifest.pack_file.clone();
        manifest.is_compressed = true;
        manifest.provider = Some(provider.clone());

        let work = self.work_dir("push", cleanup).await?;
        self.notifier.info("Compressing virtual machine folder");
        let pack = self.build_pack(request, &mut manifest, &work).await?;

        let dir = manifest.path.clone();
        let existing = if backend.file_exists(&dir, &manifest.metadata_file).await? {
            let remote = work.join("remote");
            tokio::fs::create_dir_all(&remote).await?;
            backend
                .pull_file(&dir, &manifest.metadata_file, &remote)
                .await?;
            Some(read_manifest(&remote.join(&manifest.metadata_file)).await?)
        } else {
            None
        };

        let known = if provider.is_remote() {
            None
        } else {
            self.find_existing(
                &manifest.catalog_id,
                Some(&manifest.version),
                Some(&manifest.architecture),
            )
            .await?
            .into_iter()
            .next()
        };
        manifest.id = known
            .as_ref()
            .or(existing.as_ref())
            .map(|m| m.id.clone())
            .filter(|id| !id.is_empty())
            .unwrap_or_default();
        manifest.validate()?;

        let now = OffsetDateTime::now_utc();
        let mut uploaded = Vec::new();
        match &existing {
            Some(previous) => {
                debug!("remote metadata exists, diffing checksums");
                manifest.created_at = previous.created_at.or(Some(now));
                if manifest.required_roles.is_empty() {
                    manifest.required_roles = previous.required_roles.clone();
                }
                if manifest.required_claims.is_empty() {
                    manifest.required_claims = previous.required_claims.clone();
                }
                let remote_checksum = backend.file_checksum(&dir, &manifest.pack_file).await.ok();
                if remote_checksum.is_some_and(|remote| checksums_match(&remote, &pack.checksum)) {
                    self.notifier.info("Remote pack is up to date");
                    manifest.updated_at = previous.updated_at.or(Some(now));
                } else {
                    self.notifier.info("Uploading pack file");
                    backend
                        .push_file(&pack.dir, &dir, &manifest.pack_file)
                        .await?;
                    manifest.updated_at = Some(now);
                }
            }
            None => {
                let (parent, folder) = split_remote(&dir);
                if !backend.folder_exists(&parent, &folder).await? {
                    backend.create_folder(&parent, &folder).await?;
                    cleanup.add_remote_folder(&parent, &folder);
                    uploaded.push((parent, folder));
                }
                self.notifier.info("Uploading pack file");
                cleanup.add_remote_file(&dir, &manifest.pack_file);
                uploaded.push((dir.clone(), manifest.pack_file.clone()));
                backend
                    .push_file(&pack.dir, &dir, &manifest.pack_file)
                    .await?;
                manifest.created_at = Some(now);
                manifest.updated_at = Some(now);
            }
        }

        manifest.pack_contents = vec![
            ContentItem {
                name: manifest.metadata_file.clone(),
                path: dir.clone(),
                ..ContentItem::default()
            },
            ContentItem {
                name: manifest.pack_file.clone(),
                path: dir.clone(),
                checksum: pack.checksum.clone(),
                size: manifest.pack_size,
                ..ContentItem::default()
            },
        ];

        let metadata_dir = work.join("metadata");
        tokio::fs::create_dir_all(&metadata_dir).await?;
        let metadata_path = metadata_dir.join(&manifest.metadata_file);
        write_manifest(&manifest, &metadata_path).await?;
        let local_checksum = checksum_of(&metadata_path).await?;
        let remote_checksum = if existing.is_some() {
            backend
                .file_checksum(&dir, &manifest.metadata_file)
                .await
                .ok()
        } else {
            None
        };
        if remote_checksum.is_some_and(|remote| checksums_match(&remote, &local_checksum)) {
            self.notifier.info("Remote metadata is up to date");
        } else {
            self.notifier.info("Uploading metadata file");
            if existing.is_none() {
                cleanup.add_remote_file(&dir, &manifest.metadata_file);
                uploaded.push((dir.clone(), manifest.metadata_file.clone()));
            }
            backend
                .push_file(&metadata_dir, &dir, &manifest.metadata_file)
                .await?;
        }

        let registered = self.register_pushed(manifest, &provider, known).await?;

        for (dir, name) in &uploaded {
            cleanup.remove_remote(dir, name);
        }
        info!(id = %registered.id, name = %registered.name, "pushed catalog manifest");
        Ok(registered)
    }

    async fn build_pack(
        &self,
        request: &PushRequest,
        manifest: &mut Manifest,
        work: &Path,
    ) -> CatalogResult<BuiltPack> {
        let pack_dir = work.join("pack");
        let source = request.local_path.clone();
        let pack_path = pack_dir.join(&manifest.pack_file);
        let (contents, pack_bytes, source_bytes, checksum) =
            tokio::task::spawn_blocking(move || -> CatalogResult<_> {
                let contents = archive::list_contents(&source)?;
                let pack_bytes = archive::pack_directory(&source, &pack_path)?;
                let source_bytes = archive::directory_size(&source)?;
                let checksum = file_checksum(&pack_path)?;
                Ok((contents, pack_bytes, source_bytes, checksum))
            })
            .await
            .map_err(join_error)??;

        manifest.virtual_machine_contents = contents;
        manifest.size = bytes_to_mb(source_bytes);
        manifest.pack_size = i64::try_from(pack_bytes).unwrap_or(i64::MAX);
        manifest.compressed_checksum = checksum.clone();
        Ok(BuiltPack {
            dir: pack_dir,
            checksum,
        })
    }

    /// Record the pushed manifest with the control plane or the local store.
    async fn register_pushed(
        &self,
        manifest: Manifest,
        provider: &Provider,
        known: Option<Manifest>,
    ) -> CatalogResult<Manifest> {
        if provider.is_remote() {
            debug!(host = %provider.host, "registering manifest with remote catalog");
            let client = RemoteCatalogClient::new(provider)?;
            return client.post_manifest(&manifest).await;
        }

        self.ensure_access_rows(&manifest).await?;
        match known {
            Some(previous) => {
                let updated = Manifest {
                    download_count: previous.download_count,
                    last_downloaded_at: previous.last_downloaded_at,
                    last_downloaded_user: previous.last_downloaded_user,
                    ..manifest
                };
                self.store.update_manifest(&updated).await?;
                Ok(updated)
            }
            None => {
                self.store.create_manifest(&manifest).await?;
                Ok(manifest)
            }
        }
    }

    /// Replace the roles, claims and tags of a published manifest.
    #[instrument(skip(self, request), fields(catalog_id = %request.catalog_id, version = %request.version))]
    pub async fn push_metadata(&self, request: &PushMetadataRequest) -> CatalogResult<Manifest> {
        require(&request.catalog_id, "catalog_id")?;
        require(&request.connection, "connection")?;
        let provider = Provider::parse(&request.connection)?;
        let backend = self.resolve_backend(&provider).await?;

        let mut cleanup = CleanupService::with_backend(Arc::clone(&backend));
        let result = self
            .push_metadata_inner(request, &provider, backend, &mut cleanup)
            .await;
        finish(&mut cleanup, result).await
    }

    async fn push_metadata_inner(
        &self,
        request: &PushMetadataRequest,
        provider: &Provider,
        backend: Arc<dyn StorageBackend>,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<Manifest> {
        let identity = Manifest::new(
            &normalize(&request.catalog_id),
            &request.version,
            &request.architecture,
        );
        let dir = catalog_dir(&identity.catalog_id);
        if !backend.file_exists(&dir, &identity.metadata_file).await? {
            return Err(CatalogError::NotFound(format!(
                "remote metadata {dir}/{} does not exist",
                identity.metadata_file
            )));
        }

        let work = self.work_dir("push-metadata", cleanup).await?;
        backend
            .pull_file(&dir, &identity.metadata_file, &work)
            .await?;
        let metadata_path = work.join(&identity.metadata_file);
        let mut manifest = read_manifest(&metadata_path).await?;
        manifest.required_roles = request.required_roles.clone();
        manifest.required_claims = request.required_claims.clone();
        manifest.tags = request.tags.clone();
        write_manifest(&manifest, &metadata_path).await?;

        let local_checksum = checksum_of(&metadata_path).await?;
        let remote_checksum = backend
            .file_checksum(&dir, &identity.metadata_file)
            .await?;
        if checksums_match(&remote_checksum, &local_checksum) {
            self.notifier.info("Remote metadata is up to date");
        } else {
            self.notifier.info("Uploading metadata file");
            backend
                .push_file(&work, &dir, &identity.metadata_file)
                .await?;
        }

        if !provider.is_remote() {
            self.ensure_access_rows(&manifest).await?;
            let stored = self
                .find_existing(
                    &identity.catalog_id,
                    Some(&identity.version),
                    Some(&identity.architecture),
                )
                .await?;
            for mut row in stored {
                row.required_roles = manifest.required_roles.clone();
                row.required_claims = manifest.required_claims.clone();
                row.tags = manifest.tags.clone();
                self.store.update_manifest(&row).await?;
            }
        }
        Ok(manifest)
    }
}

async fn checksum_of(path: &Path) -> CatalogResult<String> {
    let path = path.to_path_buf();
    Ok(tokio::task::spawn_blocking(move || file_checksum(&path))
        .await
        .map_err(join_error)??)
}

//! Content-addressed local cache of pulled VM packs.
//!
//! Entries are keyed by the checksum of the remote pack file:
//!
//! ```text
//! <cache_folder>/<checksum>.meta     manifest with cache bookkeeping
//! <cache_folder>/<checksum>.pvm/     unpacked bundle (or .macvm)
//! ```
//!
//! An entry is served only once its metadata says `cache_completed` and,
//! for unpacked bundles, the integrity check passes.

mod capacity;
mod integrity;
mod reconcile;

pub use capacity::{CleanupRequirements, DiskSpace, SystemDiskSpace, plan_cleanup};
pub use integrity::check_integrity;
pub use reconcile::{CacheItemFile, scan_cache_folder};

use crate::error::{CatalogError, CatalogResult, join_error};
use crate::fsutil::{move_path, path_exists, remove_path};
use crate::notifier::Notifier;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use vmcatalog_core::config::CacheConfig;
use vmcatalog_core::manifest::{METADATA_EXTENSION, PACK_EXTENSION};
use vmcatalog_core::{CacheType, CachedManifests, Manifest, bytes_to_mb};
use vmcatalog_storage::{CleanupService, StorageBackend, archive};

/// Package size assumed when a manifest does not carry one (60 GiB).
pub const DEFAULT_PACKAGE_SIZE_MB: i64 = 60 * 1024;

/// Version selector matching every cached version of a catalog.
pub const ALL_VERSIONS: &str = "ALL";

/// A manifest paired with the backend holding its pack.
pub struct CacheRequest {
    pub manifest: Manifest,
    pub backend: Arc<dyn StorageBackend>,
    /// Checksum of the remote pack file; the cache key.
    pub checksum: String,
}

impl CacheRequest {
    pub async fn new(manifest: Manifest, backend: Arc<dyn StorageBackend>) -> CatalogResult<Self> {
        if manifest.vm_type().is_none() {
            return Err(CatalogError::Validation(format!(
                "manifest {} has no known VM type",
                manifest.name
            )));
        }
        let checksum = backend
            .file_checksum(&manifest.path, &manifest.pack_file)
            .await?;
        Ok(Self {
            manifest,
            backend,
            checksum,
        })
    }

    fn metadata_name(&self) -> String {
        format!("{}.{METADATA_EXTENSION}", self.checksum)
    }

    fn machine_name(&self) -> String {
        let ext = self
            .manifest
            .vm_type()
            .map_or(self.manifest.vm_type.as_str(), |t| t.extension());
        format!("{}.{ext}", self.checksum)
    }

    fn package_size_mb(&self) -> i64 {
        if self.manifest.size > 0 {
            self.manifest.size
        } else {
            DEFAULT_PACKAGE_SIZE_MB
        }
    }

    fn is_packed(&self) -> bool {
        self.manifest.is_compressed
            || self
                .manifest
                .pack_file
                .ends_with(&format!(".{PACK_EXTENSION}"))
    }
}

/// Lookup result for one request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheResponse {
    pub cache_type: CacheType,
    pub is_cached: bool,
    pub metadata_path: Option<PathBuf>,
    pub pack_path: Option<PathBuf>,
    pub checksum: String,
}

pub struct CacheService {
    config: CacheConfig,
    temp_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    disk: Arc<dyn DiskSpace>,
}

impl CacheService {
    pub fn new(config: CacheConfig, temp_dir: impl Into<PathBuf>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            temp_dir: temp_dir.into(),
            notifier,
            disk: Arc::new(SystemDiskSpace),
        }
    }

    /// Replace the free-space source.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn folder(&self) -> &Path {
        &self.config.folder
    }

    fn streams(&self, request: &CacheRequest) -> bool {
        request.backend.can_stream() && self.config.stream_enabled
    }

    /// Locate the entry for `request`.
    ///
    /// An unpacked bundle that fails the integrity check is purged and the
    /// check's error returned.
    #[instrument(skip(self, request), fields(checksum = %request.checksum))]
    pub async fn get(&self, request: &CacheRequest) -> CatalogResult<CacheResponse> {
        let mut response = CacheResponse {
            cache_type: CacheType::None,
            is_cached: false,
            metadata_path: None,
            pack_path: None,
            checksum: request.checksum.clone(),
        };
        if !self.config.enabled {
            return Ok(response);
        }

        let folder = self.folder();
        let metadata_path = folder.join(request.metadata_name());
        if path_exists(&metadata_path).await {
            response.metadata_path = Some(metadata_path);
        }
        let candidate = folder.join(request.machine_name());
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            response.cache_type = if meta.is_dir() {
                CacheType::Folder
            } else {
                CacheType::File
            };
            response.pack_path = Some(candidate);
        }

        let (Some(metadata_path), Some(pack_path)) =
            (response.metadata_path.clone(), response.pack_path.clone())
        else {
            return Ok(response);
        };

        match self.verify(&metadata_path, &pack_path, response.cache_type).await {
            Ok(manifest) => {
                response.is_cached = manifest.cache_completed;
                Ok(response)
            }
            Err(err) => {
                warn!(error = %err, "cached entry failed verification, purging");
                self.purge(&[pack_path, metadata_path]).await;
                Err(err)
            }
        }
    }

    async fn verify(
        &self,
        metadata_path: &Path,
        pack_path: &Path,
        cache_type: CacheType,
    ) -> CatalogResult<Manifest> {
        let manifest = load_manifest(metadata_path)
            .await
            .map_err(|e| CatalogError::Integrity(format!("unreadable cache metadata: {e}")))?;
        if cache_type == CacheType::Folder {
            let (checked, root) = (manifest.clone(), pack_path.to_path_buf());
            tokio::task::spawn_blocking(move || check_integrity(&checked, &root))
                .await
                .map_err(join_error)??;
        }
        Ok(manifest)
    }

    async fn purge(&self, paths: &[PathBuf]) {
        for path in paths {
            if let Err(e) = remove_path(path).await {
                warn!(path = %path.display(), error = %e, "failed to remove cache artifact");
            }
        }
    }

    /// True only for a completed, verified entry.
    pub async fn is_cached(&self, request: &CacheRequest) -> bool {
        matches!(self.get(request).await, Ok(response) if response.is_cached)
    }

    /// Refresh `cache_last_used` and bump `cache_used_count` on a hit.
    pub async fn mark_used(&self, request: &CacheRequest) -> CatalogResult<Manifest> {
        let metadata_path = self.folder().join(request.metadata_name());
        let mut manifest = load_manifest(&metadata_path).await?;
        manifest.cache_last_used = Some(OffsetDateTime::now_utc());
        manifest.cache_used_count += 1;
        save_manifest(&manifest, &metadata_path).await?;
        Ok(manifest)
    }

    /// Compare free space and cache size against the configured thresholds.
    pub async fn check_need_cleanup(&self, request: &CacheRequest) -> CatalogResult<CleanupRequirements> {
        let folder = self.folder().to_path_buf();
        tokio::fs::create_dir_all(&folder).await?;
        let disk = Arc::clone(&self.disk);
        let (free_mb, total_mb) = tokio::task::spawn_blocking(move || -> CatalogResult<(i64, i64)> {
            let free = disk.available_mb(&folder)?;
            let total = bytes_to_mb(archive::directory_size(&folder)?);
            Ok((free, total))
        })
        .await
        .map_err(join_error)??;

        let requirements = plan_cleanup(
            &self.config,
            free_mb,
            total_mb,
            request.package_size_mb(),
            self.streams(request),
        );
        debug!(
            free_mb,
            total_mb,
            needs_cleaning = requirements.needs_cleaning,
            space_needed = requirements.space_needed,
            "cache capacity checked"
        );
        Ok(requirements)
    }

    /// Evict least recently used entries until `request` fits.
    #[instrument(skip(self, request), fields(checksum = %request.checksum))]
    pub async fn clean(&self, request: &CacheRequest) -> CatalogResult<()> {
        let requirements = self.check_need_cleanup(request).await?;
        if requirements.is_fatal {
            self.notifier.error(&requirements.reason);
            return Err(CatalogError::FatalCapacity(requirements.reason));
        }
        if !requirements.needs_cleaning {
            self.notifier.debug("No cleanup needed, we have enough space");
            return Ok(());
        }
        debug!(reason = %requirements.reason, "cache cleanup needed");

        let mut listing = self.get_all_cache_items().await?;
        listing.sort_by_ranking();

        let own_metadata = request.metadata_name();
        let mut remaining = requirements.space_needed;
        let mut victims = Vec::new();
        for entry in listing
            .manifests
            .into_iter()
            .filter(|m| m.cache_metadata_name != own_metadata)
        {
            if remaining <= 0 {
                break;
            }
            remaining -= entry.cache_size;
            victims.push(entry);
        }

        if remaining > 0 && !self.config.allow_above_free_disk_space {
            let message = "not enough space for the cached item even after cleaning the cache; \
                           set allow_above_free_disk_space to override";
            self.notifier.error(message);
            return Err(CatalogError::FatalCapacity(message.to_string()));
        }

        for victim in &victims {
            self.notifier.info(&format!("Removing cache item {}", victim.name));
            self.remove_entry(victim).await?;
        }
        Ok(())
    }

    /// Populate the cache for `request` and return the cached manifest.
    ///
    /// Every intermediate artifact is rolled back on failure.
    #[instrument(skip(self, request), fields(checksum = %request.checksum, catalog_id = %request.manifest.catalog_id))]
    pub async fn cache(&self, request: &CacheRequest) -> CatalogResult<Manifest> {
        if !self.config.enabled {
            return Err(CatalogError::Validation("catalog caching is disabled".to_string()));
        }
        tokio::fs::create_dir_all(self.folder()).await?;

        let mut cleanup = CleanupService::new();
        match self.populate(request, &mut cleanup).await {
            Ok(manifest) => {
                if let Err(errors) = cleanup.clean().await {
                    warn!(failed = errors.0.len(), "could not remove cache population temp files");
                }
                info!(cache_size = manifest.cache_size, "cached catalog pack");
                Ok(manifest)
            }
            Err(err) => {
                let failures = cleanup.clean().await.err();
                Err(err.with_cleanup(failures))
            }
        }
    }

    async fn populate(&self, request: &CacheRequest, cleanup: &mut CleanupService) -> CatalogResult<Manifest> {
        let folder = self.folder().to_path_buf();
        let remote = &request.manifest;

        self.notifier.info("Downloading catalog manifest file");
        request
            .backend
            .pull_file(&remote.path, &remote.metadata_file, &folder)
            .await?;
        let pulled = folder.join(&remote.metadata_file);
        cleanup.add_local_file(&pulled);
        let metadata_path = folder.join(request.metadata_name());
        tokio::fs::rename(&pulled, &metadata_path).await?;
        cleanup.add_local_file(&metadata_path);
        cleanup.remove_local(&pulled);

        self.clean(request).await?;

        self.notifier.info("Downloading catalog pack file");
        let work = self
            .temp_dir
            .join(format!("temp-{}-{}", request.checksum, Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&work).await?;
        cleanup.add_local_folder(&work);

        let destination = folder.join(request.machine_name());
        if request.is_packed() {
            let unpacked = work.join("content");
            if self.streams(request) {
                debug!("streaming pack into the cache");
                request
                    .backend
                    .pull_file_and_decompress(&remote.path, &remote.pack_file, &unpacked)
                    .await?;
            } else {
                request
                    .backend
                    .pull_file(&remote.path, &remote.pack_file, &work)
                    .await?;
                let (pack, target) = (work.join(&remote.pack_file), unpacked.clone());
                tokio::task::spawn_blocking(move || archive::unpack_file(&pack, &target))
                    .await
                    .map_err(join_error)??;
            }
            cleanup.add_local_folder(&destination);
            move_path(&unpacked, &destination).await?;
            let root = destination.clone();
            tokio::task::spawn_blocking(move || archive::flatten_bundle(&root))
                .await
                .map_err(join_error)??;
        } else {
            request
                .backend
                .pull_file(&remote.path, &remote.pack_file, &work)
                .await?;
            cleanup.add_local_file(&destination);
            move_path(&work.join(&remote.pack_file), &destination).await?;
        }

        self.notifier.info("Updating cache manifest");
        let mut cached = self
            .update_cache_manifest(&metadata_path)
            .await?
            .ok_or_else(|| {
                CatalogError::Integrity(format!("cached pack {} is missing", destination.display()))
            })?;
        cached.cache_completed = true;
        save_manifest(&cached, &metadata_path).await?;

        if cached.cache_type == CacheType::Folder {
            let (checked, root) = (cached.clone(), destination.clone());
            tokio::task::spawn_blocking(move || check_integrity(&checked, &root))
                .await
                .map_err(join_error)??;
        }

        cleanup.remove_local(&destination);
        cleanup.remove_local(&metadata_path);
        Ok(cached)
    }

    /// Reconcile the cache folder and list every usable entry, oldest first.
    ///
    /// Orphaned packs and unknown files are deleted on the way.
    pub async fn get_all_cache_items(&self) -> CatalogResult<CachedManifests> {
        let folder = self.folder().to_path_buf();
        if !path_exists(&folder).await {
            return Ok(CachedManifests::default());
        }
        let items = tokio::task::spawn_blocking(move || scan_cache_folder(&folder))
            .await
            .map_err(join_error)??;

        let mut cleanup = CleanupService::new();
        let mut manifests = Vec::new();
        for item in items.into_values() {
            if let Some(manifest) = self.reconcile_item(item, &mut cleanup).await? {
                manifests.push(manifest);
            }
        }
        if let Err(errors) = cleanup.clean().await {
            warn!(failed = errors.0.len(), "could not remove every orphaned cache file");
        }

        let mut listing = CachedManifests::new(manifests);
        listing.sort_by_cached_date();
        Ok(listing)
    }

    async fn reconcile_item(
        &self,
        item: CacheItemFile,
        cleanup: &mut CleanupService,
    ) -> CatalogResult<Option<Manifest>> {
        for file in &item.invalid_files {
            stage_local(cleanup, file).await;
        }
        if item.is_orphan_pack() {
            if let Some(pack) = &item.pack {
                debug!(pack = %pack.display(), "removing pack without metadata");
                stage_local(cleanup, pack).await;
            }
            return Ok(None);
        }
        if !item.is_valid() {
            return Ok(None);
        }
        let Some(mut metadata_path) = item.metadata_file else {
            return Ok(None);
        };
        if item.needs_renaming {
            let renamed = self
                .folder()
                .join(format!("{}.{METADATA_EXTENSION}", item.base_name));
            tokio::fs::rename(&metadata_path, &renamed).await?;
            metadata_path = renamed;
        }

        match self.update_cache_manifest(&metadata_path).await {
            Err(CatalogError::Json(e)) => {
                warn!(path = %metadata_path.display(), error = %e, "dropping unreadable cache metadata");
                cleanup.add_local_file(&metadata_path);
                Ok(None)
            }
            other => other,
        }
    }

    /// Refresh the bookkeeping fields of a cache metadata file.
    ///
    /// `None` when the pack it describes is not in the folder.
    async fn update_cache_manifest(&self, metadata_path: &Path) -> CatalogResult<Option<Manifest>> {
        let file_name = metadata_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let Some(name) = file_name.strip_suffix(&format!(".{METADATA_EXTENSION}")) else {
            return Err(CatalogError::Validation(format!(
                "invalid metadata file name {file_name}"
            )));
        };
        let dir = metadata_path.parent().unwrap_or(self.folder());

        let mut manifest = load_manifest(metadata_path).await?;
        let Some(vm_type) = manifest.vm_type() else {
            return Ok(None);
        };
        let pack_name = format!("{name}.{}", vm_type.extension());
        let pack_path = dir.join(&pack_name);
        let Ok(info) = tokio::fs::metadata(&pack_path).await else {
            return Ok(None);
        };

        if manifest.cached_date.is_none() {
            manifest.cached_date = Some(OffsetDateTime::now_utc());
        }
        if manifest.cache_last_used.is_none() {
            manifest.cache_last_used = Some(OffsetDateTime::UNIX_EPOCH);
        }
        manifest.cache_local_full_path = dir.to_string_lossy().to_string();
        manifest.cache_metadata_name = file_name.clone();
        manifest.cache_file_name = pack_name;
        manifest.is_compressed = false;
        manifest.cache_type = if info.is_dir() {
            CacheType::Folder
        } else {
            CacheType::File
        };
        let size_root = pack_path.clone();
        let bytes = tokio::task::spawn_blocking(move || archive::directory_size(&size_root))
            .await
            .map_err(join_error)??;
        manifest.cache_size = bytes_to_mb(bytes);

        save_manifest(&manifest, metadata_path).await?;
        Ok(Some(manifest))
    }

    async fn remove_entry(&self, entry: &Manifest) -> CatalogResult<()> {
        let dir = Path::new(&entry.cache_local_full_path);
        if !entry.cache_file_name.is_empty() {
            remove_path(&dir.join(&entry.cache_file_name)).await?;
        }
        if !entry.cache_metadata_name.is_empty() {
            remove_path(&dir.join(&entry.cache_metadata_name)).await?;
        }
        Ok(())
    }

    /// Remove cached entries of `catalog_id`; `version` may be [`ALL_VERSIONS`] or empty.
    pub async fn remove_cache_item(&self, catalog_id: &str, version: &str) -> CatalogResult<()> {
        if catalog_id.trim().is_empty() {
            return Err(CatalogError::Validation("catalog id is empty".to_string()));
        }
        let version = if version.is_empty() { ALL_VERSIONS } else { version };
        let all = version.eq_ignore_ascii_case(ALL_VERSIONS);

        let listing = self.get_all_cache_items().await?;
        let mut found = false;
        for entry in listing.manifests.iter().filter(|m| {
            m.catalog_id.eq_ignore_ascii_case(catalog_id)
                && (all || m.version.eq_ignore_ascii_case(version))
        }) {
            found = true;
            self.remove_entry(entry).await?;
        }

        if !found {
            return Err(CatalogError::NotFound(format!(
                "cache not found for catalog {catalog_id} and version {version}"
            )));
        }
        Ok(())
    }

    pub async fn remove_all_cache_items(&self) -> CatalogResult<()> {
        let listing = self.get_all_cache_items().await?;
        for entry in &listing.manifests {
            self.remove_entry(entry).await?;
        }
        Ok(())
    }

    /// Delete everything inside the cache folder.
    pub async fn clear_all(&self) -> CatalogResult<()> {
        let folder = self.folder();
        if !path_exists(folder).await {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(folder).await?;
        while let Some(entry) = entries.next_entry().await? {
            remove_path(&entry.path()).await?;
        }
        Ok(())
    }
}

async fn stage_local(cleanup: &mut CleanupService, path: &Path) {
    let is_dir = tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        cleanup.add_local_folder(path);
    } else {
        cleanup.add_local_file(path);
    }
}

async fn load_manifest(path: &Path) -> CatalogResult<Manifest> {
    let data = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&data)?)
}

/// Write through a sibling temp file so readers never see a partial document.
async fn save_manifest(manifest: &Manifest, path: &Path) -> CatalogResult<()> {
    let data = manifest.to_metadata_json()?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let temp = path.with_file_name(format!(".{file_name}.{}", Uuid::new_v4().simple()));
    tokio::fs::write(&temp, data).await?;
    if let Err(e) = tokio::fs::rename(&temp, path).await {
        let _ = tokio::fs::remove_file(&temp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::TracingNotifier;

    fn service(folder: &Path) -> CacheService {
        let config = CacheConfig {
            folder: folder.to_path_buf(),
            ..CacheConfig::default()
        };
        CacheService::new(config, folder.join("../tmp"), Arc::new(TracingNotifier))
    }

    async fn write_entry(folder: &Path, checksum: &str, catalog: &str, version: &str) {
        let mut manifest = Manifest::new(catalog, version, "x86_64");
        manifest.vm_type = "pvm".to_string();
        manifest.cache_completed = true;
        tokio::fs::write(
            folder.join(format!("{checksum}.meta")),
            manifest.to_metadata_json().unwrap(),
        )
        .await
        .unwrap();
        let pack = folder.join(format!("{checksum}.pvm"));
        tokio::fs::create_dir_all(pack.join("disk.hdd")).await.unwrap();
        tokio::fs::write(pack.join("config.pvs"), b"cfg").await.unwrap();
    }

    #[tokio::test]
    async fn metadata_without_pack_is_not_listed() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("cache");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        let mut manifest = Manifest::new("ubuntu", "1", "x86_64");
        manifest.vm_type = "pvm".to_string();
        tokio::fs::write(folder.join("abc123.meta"), manifest.to_metadata_json().unwrap())
            .await
            .unwrap();

        let listing = service(&folder).get_all_cache_items().await.unwrap();
        assert!(listing.manifests.is_empty());
        assert_eq!(listing.total_size, 0);
        assert!(folder.join("abc123.meta").exists());
    }

    #[tokio::test]
    async fn listing_fills_bookkeeping_and_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("cache");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        write_entry(&folder, "aaa", "ubuntu", "1").await;
        tokio::fs::create_dir_all(folder.join("orphan.pvm")).await.unwrap();
        tokio::fs::write(folder.join("junk.txt"), b"x").await.unwrap();

        let listing = service(&folder).get_all_cache_items().await.unwrap();
        assert_eq!(listing.manifests.len(), 1);
        let entry = &listing.manifests[0];
        assert_eq!(entry.cache_type, CacheType::Folder);
        assert_eq!(entry.cache_file_name, "aaa.pvm");
        assert_eq!(entry.cache_metadata_name, "aaa.meta");
        assert_eq!(entry.cache_last_used, Some(OffsetDateTime::UNIX_EPOCH));
        assert!(entry.cached_date.is_some());
        assert!(!folder.join("orphan.pvm").exists());
        assert!(!folder.join("junk.txt").exists());
    }

    #[tokio::test]
    async fn legacy_metadata_is_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("cache");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        write_entry(&folder, "bbb", "debian", "12").await;
        tokio::fs::rename(folder.join("bbb.meta"), folder.join("bbb.pvm.meta"))
            .await
            .unwrap();

        let listing = service(&folder).get_all_cache_items().await.unwrap();
        assert_eq!(listing.manifests.len(), 1);
        assert!(folder.join("bbb.meta").exists());
        assert!(!folder.join("bbb.pvm.meta").exists());
    }

    #[tokio::test]
    async fn remove_all_versions_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("cache");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        write_entry(&folder, "c1", "Ubuntu", "1").await;
        write_entry(&folder, "c2", "ubuntu", "2").await;
        write_entry(&folder, "c3", "debian", "1").await;

        let cache = service(&folder);
        cache.remove_cache_item("UBUNTU", ALL_VERSIONS).await.unwrap();
        let left = cache.get_all_cache_items().await.unwrap();
        assert_eq!(left.manifests.len(), 1);
        assert_eq!(left.manifests[0].catalog_id, "debian");

        let err = cache.remove_cache_item("ubuntu", "ALL").await.unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[tokio::test]
    async fn clear_all_empties_the_folder() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("cache");
        tokio::fs::create_dir_all(&folder).await.unwrap();
        write_entry(&folder, "c1", "ubuntu", "1").await;

        let cache = service(&folder);
        cache.clear_all().await.unwrap();
        assert_eq!(std::fs::read_dir(&folder).unwrap().count(), 0);
    }
}

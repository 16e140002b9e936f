//! Cache population, eviction and integrity against a local backend.

mod common;

use common::{FixedDiskSpace, VmFolder, list_dir, seeded_bytes, tree_digest};
use std::path::Path;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use vmcatalog_catalog::TracingNotifier;
use vmcatalog_catalog::cache::{CacheRequest, CacheService};
use vmcatalog_core::config::CacheConfig;
use vmcatalog_core::{CacheType, Manifest};
use vmcatalog_storage::traits::StorageBackend;
use vmcatalog_storage::{LocalBackend, archive};

struct Fixture {
    dir: tempfile::TempDir,
    backend: Arc<dyn StorageBackend>,
}

impl Fixture {
    async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("catalog")).await.unwrap();
        Self {
            dir,
            backend: Arc::new(backend),
        }
    }

    fn cache_folder(&self) -> std::path::PathBuf {
        self.dir.path().join("cache")
    }

    fn service(&self, tweak: impl FnOnce(&mut CacheConfig), free_mb: i64) -> CacheService {
        let mut config = CacheConfig {
            folder: self.cache_folder(),
            ..CacheConfig::default()
        };
        tweak(&mut config);
        let temp = self.dir.path().join("tmp");
        std::fs::create_dir_all(&temp).unwrap();
        CacheService::new(config, temp, Arc::new(TracingNotifier))
            .with_disk_space(Arc::new(FixedDiskSpace(free_mb)))
    }

    /// Pack a VM into the catalog the way a push lays it out.
    fn publish(&self, vm: &VmFolder, name: &str) -> Manifest {
        let folder = self.dir.path().join("catalog/ubuntu");
        let pack_file = format!("{name}.pdpack");
        archive::pack_directory(vm.path(), &folder.join(&pack_file)).unwrap();

        let mut manifest = Manifest::new("ubuntu", name, "x86_64");
        manifest.vm_type = "pvm".to_string();
        manifest.path = "/ubuntu".to_string();
        manifest.pack_file = pack_file;
        manifest.metadata_file = format!("{name}.meta");
        manifest.is_compressed = true;
        manifest.size = 1;
        std::fs::write(
            folder.join(&manifest.metadata_file),
            manifest.to_metadata_json().unwrap(),
        )
        .unwrap();
        manifest
    }

    async fn request(&self, manifest: &Manifest) -> CacheRequest {
        CacheRequest::new(manifest.clone(), Arc::clone(&self.backend))
            .await
            .unwrap()
    }
}

/// A completed cache entry of roughly 1.5 MB last used `days_ago`.
fn seed_entry(folder: &Path, checksum: &str, version: &str, days_ago: i64) {
    std::fs::create_dir_all(folder).unwrap();
    let mut manifest = Manifest::new("debian", version, "x86_64");
    manifest.vm_type = "pvm".to_string();
    manifest.cache_completed = true;
    manifest.cache_last_used = Some(OffsetDateTime::now_utc() - Duration::days(days_ago));
    manifest.cached_date = manifest.cache_last_used;
    std::fs::write(
        folder.join(format!("{checksum}.meta")),
        manifest.to_metadata_json().unwrap(),
    )
    .unwrap();
    VmFolder::empty(folder, &format!("{checksum}.pvm"))
        .file("config.pvs", b"cfg")
        .file("NVRAM.dat", b"nv")
        .file("disk.hdd/data.hds", &seeded_bytes(days_ago as u64, 1_500_000));
}

#[tokio::test]
async fn cache_materializes_a_verified_entry() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 100_000);
    let request = f.request(&manifest).await;

    assert!(!cache.is_cached(&request).await);
    let cached = cache.cache(&request).await.unwrap();

    assert!(cached.cache_completed);
    assert_eq!(cached.cache_type, CacheType::Folder);
    assert_eq!(cached.cache_file_name, format!("{}.pvm", request.checksum));
    assert!(cache.is_cached(&request).await);

    let entry = f.cache_folder().join(&cached.cache_file_name);
    assert_eq!(tree_digest(&entry), vm.digest());
    assert!(list_dir(&f.dir.path().join("tmp")).is_empty());
}

#[tokio::test]
async fn eviction_removes_least_recently_used_first() {
    let f = Fixture::new().await;
    let folder = f.cache_folder();
    seed_entry(&folder, "oldest", "10", 30);
    seed_entry(&folder, "recent", "11", 1);

    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|c| c.max_size_mb = 4, 100_000);
    let request = f.request(&manifest).await;

    let plan = cache.check_need_cleanup(&request).await.unwrap();
    assert!(plan.needs_cleaning);
    assert!(!plan.is_fatal);

    cache.cache(&request).await.unwrap();

    assert!(!folder.join("oldest.pvm").exists());
    assert!(!folder.join("oldest.meta").exists());
    assert!(folder.join("recent.pvm").exists());

    let listing = cache.get_all_cache_items().await.unwrap();
    assert_eq!(listing.manifests.len(), 2);
    assert!(listing.total_size <= 4);
}

#[tokio::test]
async fn fatal_capacity_aborts_and_rolls_back() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 0);
    let request = f.request(&manifest).await;

    let err = cache.cache(&request).await.unwrap_err();
    assert_eq!(err.code(), "insufficient_space");
    assert!(list_dir(&f.cache_folder()).is_empty());
    assert!(list_dir(&f.dir.path().join("tmp")).is_empty());
}

#[tokio::test]
async fn floor_that_cannot_be_met_is_refused_unless_allowed() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let request = f.request(&manifest).await;

    let strict = f.service(|c| c.keep_free_disk_space_mb = 500, 100);
    let err = strict.cache(&request).await.unwrap_err();
    assert_eq!(err.code(), "insufficient_space");

    let lenient = f.service(
        |c| {
            c.keep_free_disk_space_mb = 500;
            c.allow_above_free_disk_space = true;
        },
        100,
    );
    lenient.cache(&request).await.unwrap();
    assert!(lenient.is_cached(&request).await);
}

#[tokio::test]
async fn broken_entry_is_purged_instead_of_served() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 100_000);
    let request = f.request(&manifest).await;
    let cached = cache.cache(&request).await.unwrap();

    let entry = f.cache_folder().join(&cached.cache_file_name);
    std::fs::remove_file(entry.join("NVRAM.dat")).unwrap();

    let err = cache.get(&request).await.unwrap_err();
    assert_eq!(err.code(), "integrity_error");
    assert!(!entry.exists());
    assert!(!cache.is_cached(&request).await);
}

#[tokio::test]
async fn incomplete_entry_is_never_a_hit() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 100_000);
    let request = f.request(&manifest).await;
    let mut cached = cache.cache(&request).await.unwrap();

    cached.cache_completed = false;
    let metadata = f.cache_folder().join(&cached.cache_metadata_name);
    std::fs::write(&metadata, cached.to_metadata_json().unwrap()).unwrap();

    assert!(!cache.is_cached(&request).await);
}

#[tokio::test]
async fn disabled_cache_reports_nothing() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|c| c.enabled = false, 100_000);
    let request = f.request(&manifest).await;

    let response = cache.get(&request).await.unwrap();
    assert_eq!(response.cache_type, CacheType::None);
    assert!(!response.is_cached);
    assert!(cache.cache(&request).await.is_err());
}

#[tokio::test]
async fn mark_used_bumps_counters() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 100_000);
    let request = f.request(&manifest).await;
    cache.cache(&request).await.unwrap();

    let first = cache.mark_used(&request).await.unwrap();
    let second = cache.mark_used(&request).await.unwrap();
    assert_eq!(second.cache_used_count, first.cache_used_count + 1);
    assert!(second.cache_last_used >= first.cache_last_used);
}

#[tokio::test]
async fn raw_pack_named_by_checksum_is_not_an_entry() {
    let f = Fixture::new().await;
    let vm = VmFolder::pvm(&f.dir.path().join("vms"), "ubuntu");
    let manifest = f.publish(&vm, "22_04");
    let cache = f.service(|_| {}, 100_000);
    let request = f.request(&manifest).await;

    std::fs::create_dir_all(f.cache_folder()).unwrap();
    let stray = f.cache_folder().join(format!("{}.pdpack", request.checksum));
    std::fs::write(&stray, b"raw pack").unwrap();

    let response = cache.get(&request).await.unwrap();
    assert!(response.pack_path.is_none());
    assert!(!response.is_cached);

    let listing = cache.get_all_cache_items().await.unwrap();
    assert!(listing.manifests.is_empty());
    assert!(!stray.exists());
}

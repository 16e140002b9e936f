pub mod fixtures;
pub mod mocks;

#[allow(unused_imports)]
pub use fixtures::{VmFolder, seeded_bytes, sha256_hash, tree_digest};
#[allow(unused_imports)]
pub use mocks::{CountingBackend, CountingProbe, FixedDiskSpace, RecordingHypervisor};

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use vmcatalog_catalog::{CacheService, CatalogService, TracingNotifier};
use vmcatalog_core::config::{AppConfig, CacheConfig};
use vmcatalog_metadata::SqliteStore;
use vmcatalog_storage::{BackendRegistry, LocalBackend};

/// Connection string claimed by [`CountingProbe`].
#[allow(dead_code)]
pub const COUNTING_CONNECTION: &str = "provider=counting";

/// A catalog service rooted in a temp dir, backed by a counting local backend.
#[allow(dead_code)]
pub struct TestCatalog {
    pub dir: TempDir,
    pub config: AppConfig,
    pub backend: Arc<CountingBackend>,
    pub hypervisor: Arc<RecordingHypervisor>,
    pub service: CatalogService,
}

#[allow(dead_code)]
impl TestCatalog {
    pub async fn new() -> Self {
        Self::with_cache(|_| {}).await
    }

    /// Build with a tweaked cache configuration.
    pub async fn with_cache(tweak: impl FnOnce(&mut CacheConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_testing(dir.path());
        tweak(&mut config.cache);
        std::fs::create_dir_all(&config.catalog.temp_dir).unwrap();

        let local = LocalBackend::new(&config.catalog.default_local_root)
            .await
            .unwrap();
        let backend = CountingBackend::new(Arc::new(local));
        let mut registry = BackendRegistry::with_defaults(&config.catalog.default_local_root);
        registry.register(Arc::new(CountingProbe::new(Arc::clone(&backend))));

        let db_path = dir.path().join("catalog.db");
        let store = SqliteStore::new(&db_path, None).await.unwrap();
        let notifier = Arc::new(TracingNotifier);
        let cache = CacheService::new(
            config.cache.clone(),
            &config.catalog.temp_dir,
            notifier.clone(),
        )
        .with_disk_space(Arc::new(FixedDiskSpace(100_000)));
        let hypervisor = Arc::new(RecordingHypervisor::default());

        let service = CatalogService::new(
            registry,
            Arc::new(store),
            cache,
            hypervisor.clone(),
            notifier,
            &config.catalog.temp_dir,
        );
        Self {
            dir,
            config,
            backend,
            hypervisor,
            service,
        }
    }

    /// Root of the catalog the counting backend writes to.
    pub fn catalog_root(&self) -> &Path {
        &self.config.catalog.default_local_root
    }

    pub fn cache_folder(&self) -> &Path {
        &self.config.cache.folder
    }

    pub fn temp_dir(&self) -> &Path {
        &self.config.catalog.temp_dir
    }

    /// A scratch folder for VM bundles and pull destinations.
    pub fn workspace(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::create_dir_all(&path).unwrap();
        path
    }
}

/// Entries left in a directory, sorted.
#[allow(dead_code)]
pub fn list_dir(path: &Path) -> Vec<String> {
    let mut names: Vec<String> = match std::fs::read_dir(path) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

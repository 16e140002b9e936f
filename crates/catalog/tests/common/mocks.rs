use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use vmcatalog_catalog::cache::DiskSpace;
use vmcatalog_catalog::error::{CatalogError, CatalogResult};
use vmcatalog_catalog::hypervisor::{Hypervisor, RegisterVmRequest, VmInfo};
use vmcatalog_core::Provider;
use vmcatalog_storage::error::{StorageError, StorageResult};
use vmcatalog_storage::traits::{BackendProbe, CheckOutcome, StorageBackend};

/// Wraps a backend, counts uploads per file name and can fail pushes on demand.
#[allow(dead_code)]
pub struct CountingBackend {
    inner: Arc<dyn StorageBackend>,
    pushes: Mutex<Vec<String>>,
    pub deletes: AtomicUsize,
    fail_push_suffix: Mutex<Option<String>>,
}

#[allow(dead_code)]
impl CountingBackend {
    pub fn new(inner: Arc<dyn StorageBackend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            pushes: Mutex::new(Vec::new()),
            deletes: AtomicUsize::new(0),
            fail_push_suffix: Mutex::new(None),
        })
    }

    /// Uploads of files whose name ends with `suffix`.
    pub fn push_count(&self, suffix: &str) -> usize {
        self.pushes
            .lock()
            .unwrap()
            .iter()
            .filter(|name| name.ends_with(suffix))
            .count()
    }

    pub fn delete_count(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Make every later upload of a file ending in `suffix` fail.
    pub fn fail_pushes_of(&self, suffix: &str) {
        *self.fail_push_suffix.lock().unwrap() = Some(suffix.to_string());
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn provider_root_path(&self) -> String {
        self.inner.provider_root_path()
    }

    fn provider_meta(&self) -> BTreeMap<String, String> {
        BTreeMap::from([("provider".to_string(), "counting".to_string())])
    }

    async fn file_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        self.inner.file_exists(dir, name).await
    }

    async fn folder_exists(&self, dir: &str, name: &str) -> StorageResult<bool> {
        self.inner.folder_exists(dir, name).await
    }

    async fn file_checksum(&self, dir: &str, name: &str) -> StorageResult<String> {
        self.inner.file_checksum(dir, name).await
    }

    async fn file_size(&self, dir: &str, name: &str) -> StorageResult<u64> {
        self.inner.file_size(dir, name).await
    }

    async fn push_file(&self, local_dir: &Path, dir: &str, name: &str) -> StorageResult<()> {
        let failing = self.fail_push_suffix.lock().unwrap().clone();
        if failing.is_some_and(|suffix| name.ends_with(&suffix)) {
            return Err(StorageError::Io(io::Error::other("injected upload failure")));
        }
        self.pushes.lock().unwrap().push(name.to_string());
        self.inner.push_file(local_dir, dir, name).await
    }

    async fn pull_file(&self, dir: &str, name: &str, destination: &Path) -> StorageResult<()> {
        self.inner.pull_file(dir, name, destination).await
    }

    async fn pull_file_to_memory(&self, dir: &str, name: &str) -> StorageResult<Bytes> {
        self.inner.pull_file_to_memory(dir, name).await
    }

    async fn delete_file(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_file(dir, name).await
    }

    async fn create_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.inner.create_folder(dir, name).await
    }

    async fn delete_folder(&self, dir: &str, name: &str) -> StorageResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete_folder(dir, name).await
    }
}

/// Claims `provider=counting` and hands out one shared backend.
pub struct CountingProbe {
    backend: Arc<CountingBackend>,
}

impl CountingProbe {
    pub fn new(backend: Arc<CountingBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl BackendProbe for CountingProbe {
    fn name(&self) -> &'static str {
        "counting"
    }

    async fn check(&self, connection: &Provider) -> StorageResult<CheckOutcome> {
        if connection.kind.eq_ignore_ascii_case("counting") {
            let backend: Arc<dyn StorageBackend> = self.backend.clone();
            Ok(CheckOutcome::Matched(backend))
        } else {
            Ok(CheckOutcome::NotMatched)
        }
    }
}

/// In-memory hypervisor that records registrations.
#[derive(Default)]
#[allow(dead_code)]
pub struct RecordingHypervisor {
    vms: Mutex<Vec<VmInfo>>,
    registered: Mutex<Vec<RegisterVmRequest>>,
    fail_register: Mutex<bool>,
}

#[allow(dead_code)]
impl RecordingHypervisor {
    pub fn add_vm(&self, name: &str, home: impl Into<PathBuf>) {
        let mut vms = self.vms.lock().unwrap();
        let id = format!("{{vm-{}}}", vms.len() + 1);
        vms.push(VmInfo {
            id,
            name: name.to_string(),
            home: home.into(),
        });
    }

    pub fn vms(&self) -> Vec<VmInfo> {
        self.vms.lock().unwrap().clone()
    }

    pub fn registrations(&self) -> Vec<RegisterVmRequest> {
        self.registered.lock().unwrap().clone()
    }

    pub fn fail_registrations(&self) {
        *self.fail_register.lock().unwrap() = true;
    }
}

#[async_trait]
impl Hypervisor for RecordingHypervisor {
    async fn get_vm(&self, name: &str) -> CatalogResult<Option<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .iter()
            .find(|vm| vm.name.eq_ignore_ascii_case(name) || vm.id == name)
            .cloned())
    }

    async fn register_vm(&self, request: &RegisterVmRequest) -> CatalogResult<()> {
        if *self.fail_register.lock().unwrap() {
            return Err(CatalogError::Hypervisor("registration refused".to_string()));
        }
        self.registered.lock().unwrap().push(request.clone());
        // Registration names the machine after its folder, like prlctl does.
        let folder_name = request
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.add_vm(&folder_name, request.path.clone());
        Ok(())
    }

    async fn find_vms_by_home(&self, home: &Path) -> CatalogResult<Vec<VmInfo>> {
        Ok(self
            .vms
            .lock()
            .unwrap()
            .iter()
            .filter(|vm| vm.home == home)
            .cloned()
            .collect())
    }

    async fn rename_vm(&self, id: &str, new_name: &str) -> CatalogResult<()> {
        let mut vms = self.vms.lock().unwrap();
        let vm = vms
            .iter_mut()
            .find(|vm| vm.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_string()))?;
        vm.name = new_name.to_string();
        Ok(())
    }
}

/// Reports a constant amount of free space.
pub struct FixedDiskSpace(pub i64);

impl DiskSpace for FixedDiskSpace {
    fn available_mb(&self, _path: &Path) -> io::Result<i64> {
        Ok(self.0)
    }
}

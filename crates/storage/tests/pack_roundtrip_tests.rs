//! Pack a VM bundle, ship it through the local backend and unpack it again.

mod common;

use common::{VmFolder, sha256_hash};
use common::fixtures::tree_digest;
use vmcatalog_storage::archive;
use vmcatalog_storage::traits::StorageBackend;
use vmcatalog_storage::LocalBackend;

#[tokio::test]
async fn packed_bundle_survives_push_and_pull() {
    let work = tempfile::tempdir().unwrap();
    let remote = tempfile::tempdir().unwrap();
    let vm = VmFolder::pvm(work.path(), "ubuntu");

    let pack = work.path().join("ubuntu-x86_64-22_04.pdpack");
    let size = archive::pack_directory(vm.path(), &pack).unwrap();
    assert!(size > 0);
    let pack_checksum = sha256_hash(&std::fs::read(&pack).unwrap());

    let backend = LocalBackend::new(remote.path()).await.unwrap();
    backend.create_folder("/", "ubuntu").await.unwrap();
    backend
        .push_file(work.path(), "/ubuntu", "ubuntu-x86_64-22_04.pdpack")
        .await
        .unwrap();
    assert_eq!(
        backend
            .file_checksum("/ubuntu", "ubuntu-x86_64-22_04.pdpack")
            .await
            .unwrap(),
        pack_checksum
    );
    assert_eq!(
        backend
            .file_size("/ubuntu", "ubuntu-x86_64-22_04.pdpack")
            .await
            .unwrap(),
        size
    );

    let download = tempfile::tempdir().unwrap();
    backend
        .pull_file("/ubuntu", "ubuntu-x86_64-22_04.pdpack", download.path())
        .await
        .unwrap();
    let restored = download.path().join("restored");
    archive::unpack_file(
        &download.path().join("ubuntu-x86_64-22_04.pdpack"),
        &restored,
    )
    .unwrap();

    assert_eq!(tree_digest(&restored), vm.digest());
}

#[tokio::test]
async fn content_listing_matches_bundle() {
    let work = tempfile::tempdir().unwrap();
    let vm = VmFolder::pvm(work.path(), "debian");

    let items = archive::list_contents(vm.path()).unwrap();
    let files: Vec<_> = items.iter().filter(|i| !i.is_dir).collect();
    assert_eq!(files.len(), 4);
    let config = files.iter().find(|i| i.name == "config.pvs").unwrap();
    assert_eq!(config.checksum, sha256_hash(b"<ParallelsVirtualMachine/>"));
    assert!(items.iter().any(|i| i.is_dir && i.name == "harddisk.hdd"));
}

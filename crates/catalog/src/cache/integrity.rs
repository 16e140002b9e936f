use crate::error::{CatalogError, CatalogResult};
use std::fs;
use std::path::Path;
use vmcatalog_core::{Manifest, VmType};

const DISK_EXTENSION: &str = "hdd";

/// Check that a materialized cache folder is complete for its VM type.
///
/// Blocking; walks the whole tree in the worst case.
pub fn check_integrity(manifest: &Manifest, cache_path: &Path) -> CatalogResult<()> {
    if !manifest.cache_completed {
        return Err(CatalogError::Integrity("cache is not completed".to_string()));
    }
    let vm_type = VmType::from_extension(&manifest.vm_type).ok_or_else(|| {
        CatalogError::Integrity(format!("invalid cache type {:?}", manifest.vm_type))
    })?;
    for file in vm_type.required_files() {
        if !cache_path.join(file).exists() {
            return Err(CatalogError::Integrity(format!(
                "cache is not completed, missing file {file}"
            )));
        }
    }
    if !contains_disk(cache_path)? {
        return Err(CatalogError::Integrity(
            "cache is not completed, missing .hdd file".to_string(),
        ));
    }
    Ok(())
}

fn contains_disk(root: &Path) -> CatalogResult<bool> {
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let is_disk = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(DISK_EXTENSION));
            if is_disk {
                return Ok(true);
            }
            if path.is_dir() {
                stack.push(path);
            }
        }
    }
    Ok(false)
}

//! Cache folder scanning.
//!
//! Entries are grouped by basename, the part of the file name before the
//! first `.`, so `<checksum>.meta` and `<checksum>.pvm` land together.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use vmcatalog_core::VmType;
use vmcatalog_core::manifest::METADATA_EXTENSION;

/// Everything found in the cache folder under one basename.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheItemFile {
    pub base_name: String,
    pub metadata_file: Option<PathBuf>,
    pub pack: Option<PathBuf>,
    pub pack_is_dir: bool,
    /// Metadata still uses the `<base>.<type>.meta` naming.
    pub needs_renaming: bool,
    /// Files that belong to no known artifact kind.
    pub invalid_files: Vec<PathBuf>,
}

impl CacheItemFile {
    fn new(base_name: &str) -> Self {
        Self {
            base_name: base_name.to_string(),
            ..Self::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.metadata_file.is_some() && self.pack.is_some()
    }

    /// A pack nothing describes anymore.
    pub fn is_orphan_pack(&self) -> bool {
        self.metadata_file.is_none() && self.pack.is_some()
    }
}

enum FileKind {
    Metadata,
    LegacyMetadata,
    Pack,
    Unknown,
}

fn classify(extension: &str) -> FileKind {
    let extension = extension.to_ascii_lowercase();
    if extension == METADATA_EXTENSION {
        return FileKind::Metadata;
    }
    if let Some(inner) = extension.strip_suffix(&format!(".{METADATA_EXTENSION}"))
        && VmType::from_extension(inner).is_some()
    {
        return FileKind::LegacyMetadata;
    }
    if VmType::from_extension(&extension).is_some() {
        return FileKind::Pack;
    }
    FileKind::Unknown
}

/// Group the entries of `folder` by basename. Blocking.
pub fn scan_cache_folder(folder: &Path) -> io::Result<BTreeMap<String, CacheItemFile>> {
    let mut items: BTreeMap<String, CacheItemFile> = BTreeMap::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let (base, extension) = file_name.split_once('.').unwrap_or((&file_name, ""));
        let path = entry.path();
        let item = items
            .entry(base.to_string())
            .or_insert_with(|| CacheItemFile::new(base));

        match classify(extension) {
            FileKind::Metadata => {
                if item.needs_renaming {
                    if let Some(legacy) = item.metadata_file.take() {
                        item.invalid_files.push(legacy);
                    }
                    item.needs_renaming = false;
                }
                item.metadata_file = Some(path);
            }
            FileKind::LegacyMetadata => {
                if item.metadata_file.is_none() {
                    item.metadata_file = Some(path);
                    item.needs_renaming = true;
                } else {
                    item.invalid_files.push(path);
                }
            }
            FileKind::Pack => {
                item.pack_is_dir = entry.file_type()?.is_dir();
                item.pack = Some(path);
            }
            FileKind::Unknown => item.invalid_files.push(path),
        }
    }
    Ok(items)
}

//! Pack archive codec.
//!
//! A pack is a tar archive of a VM bundle with paths relative to the bundle
//! root. Unpacking also accepts gzip-compressed tars and single gzip files.
//! All functions here block and belong on `spawn_blocking`.

use crate::error::{StorageError, StorageResult};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{Cursor, Read};
use std::path::{Component, Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};
use vmcatalog_core::{ContentItem, file_checksum};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_HEADER_PEEK: usize = 512;

/// Extensions of VM bundle directories that get flattened after unpacking.
const BUNDLE_EXTENSIONS: &[&str] = &["pvm", "macvm"];

/// Write every entry below `source` into a tar at `dest`. Returns the archive size.
pub fn pack_directory(source: &Path, dest: &Path) -> StorageResult<u64> {
    if !source.is_dir() {
        return Err(StorageError::InvalidPath(format!(
            "{} is not a directory",
            source.display()
        )));
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }

    let file = fs::File::create(dest)?;
    let mut builder = tar::Builder::new(file);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", source)?;
    let file = builder.into_inner()?;
    file.sync_all()?;
    Ok(fs::metadata(dest)?.len())
}

/// Recursively list `root`, hashing every regular file.
pub fn list_contents(root: &Path) -> StorageResult<Vec<ContentItem>> {
    let mut items = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            let meta = entry.metadata()?;
            let relative = path
                .strip_prefix(root)
                .map_err(|e| StorageError::InvalidPath(e.to_string()))?;
            let parent = relative
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();

            let mut item = ContentItem {
                is_dir: file_type.is_dir(),
                name: entry.file_name().to_string_lossy().to_string(),
                path: parent,
                created_at: meta.created().ok().map(OffsetDateTime::from),
                updated_at: meta.modified().ok().map(OffsetDateTime::from),
                ..ContentItem::default()
            };
            if file_type.is_dir() {
                stack.push(path);
            } else if file_type.is_file() {
                item.size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
                item.checksum = file_checksum(&path)?;
            } else {
                continue;
            }
            items.push(item);
        }
    }
    items.sort_by(|a, b| (&a.path, &a.name).cmp(&(&b.path, &b.name)));
    Ok(items)
}

/// Unpack the archive at `archive` into `dest`.
pub fn unpack_file(archive: &Path, dest: &Path) -> StorageResult<()> {
    let file = fs::File::open(archive)?;
    let fallback = archive
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "unpacked".to_string());
    unpack_reader(file, dest, &fallback)
}

/// Unpack a tar, tar.gz or single gzip stream into `dest`.
///
/// `fallback_name` names the output of a gzip stream that is not a tar.
pub fn unpack_reader<R: Read>(reader: R, dest: &Path, fallback_name: &str) -> StorageResult<()> {
    fs::create_dir_all(dest)?;
    let (head, reader) = peek(reader, TAR_HEADER_PEEK)?;

    if head.starts_with(&GZIP_MAGIC) {
        let decoder = GzDecoder::new(Cursor::new(head).chain(reader));
        let (inner_head, decoded) = peek(decoder, TAR_HEADER_PEEK)?;
        if is_tar(&inner_head) {
            debug!("unpacking gzip tar");
            return extract_tar(Cursor::new(inner_head).chain(decoded), dest);
        }
        debug!(name = fallback_name, "unpacking single gzip file");
        let target = dest.join(sanitize_name(fallback_name)?);
        let mut out = fs::File::create(&target)?;
        std::io::copy(&mut Cursor::new(inner_head).chain(decoded), &mut out)?;
        return Ok(());
    }

    if is_tar(&head) {
        return extract_tar(Cursor::new(head).chain(reader), dest);
    }

    Err(StorageError::Archive(
        "unsupported archive format: expected tar, tar.gz or gzip".to_string(),
    ))
}

/// Read up to `n` bytes without losing them.
fn peek<R: Read>(mut reader: R, n: usize) -> std::io::Result<(Vec<u8>, R)> {
    let mut head = Vec::with_capacity(n);
    (&mut reader).take(n as u64).read_to_end(&mut head)?;
    Ok((head, reader))
}

fn is_tar(head: &[u8]) -> bool {
    head.len() >= TAR_MAGIC_OFFSET + 5 && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

fn sanitize_name(name: &str) -> StorageResult<PathBuf> {
    sanitize_entry_path(Path::new(name))
}

/// Relative, normal-components-only form of an entry path.
fn sanitize_entry_path(path: &Path) -> StorageResult<PathBuf> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            _ => {
                return Err(StorageError::Archive(format!(
                    "archive entry escapes destination: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(clean)
}

/// Lexically resolve `link` relative to `base` and check it stays under `root`.
fn link_stays_inside(root: &Path, base: &Path, link: &Path) -> bool {
    if link.is_absolute() {
        return false;
    }
    let mut resolved = base.to_path_buf();
    for component in link.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !resolved.pop() {
                    return false;
                }
            }
            _ => return false,
        }
    }
    resolved.starts_with(root)
}

fn extract_tar<R: Read>(reader: R, dest: &Path) -> StorageResult<()> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let relative = sanitize_entry_path(&entry.path()?)?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(&relative);

        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if entry_type.is_file() || entry_type.is_gnu_sparse() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        } else if entry_type.is_symlink() {
            let Some(link) = entry.link_name()?.map(|l| l.into_owned()) else {
                continue;
            };
            let base = target.parent().unwrap_or(dest).to_path_buf();
            if !link_stays_inside(dest, &base, &link) {
                warn!(
                    entry = %relative.display(),
                    link = %link.display(),
                    "skipping symlink that points outside the destination"
                );
                continue;
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        } else if entry_type.is_hard_link() {
            let Some(link) = entry.link_name()?.map(|l| l.into_owned()) else {
                continue;
            };
            let source = dest.join(sanitize_entry_path(&link)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::hard_link(source, &target)?;
        } else {
            debug!(entry = %relative.display(), "skipping unsupported entry type");
        }
    }
    Ok(())
}

/// Move the contents of any top-level `*.pvm` / `*.macvm` directory up into `root`.
pub fn flatten_bundle(root: &Path) -> StorageResult<()> {
    for entry in fs::read_dir(root)? {
        let entry = entry?;
        let path = entry.path();
        let is_bundle = entry.file_type()?.is_dir()
            && path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| BUNDLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()));
        if !is_bundle {
            continue;
        }

        for child in fs::read_dir(&path)? {
            let child = child?;
            let dest = root.join(child.file_name());
            if dest.exists() {
                return Err(StorageError::Archive(format!(
                    "cannot flatten {}: {} already exists",
                    path.display(),
                    dest.display()
                )));
            }
            fs::rename(child.path(), dest)?;
        }
        fs::remove_dir(&path)?;
    }
    Ok(())
}

/// Total size in bytes of every regular file under `path`.
pub fn directory_size(path: &Path) -> StorageResult<u64> {
    let meta = fs::symlink_metadata(path)?;
    if meta.is_file() {
        return Ok(meta.len());
    }
    let mut total = 0u64;
    let mut stack = vec![path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                stack.push(entry.path());
            } else if file_type.is_file() {
                total += entry.metadata()?.len();
            }
        }
    }
    Ok(total)
}

//! Local filesystem moves and copies used by the cache and by pulls.

use crate::error::{CatalogResult, join_error};
use std::fs;
use std::io;
use std::path::Path;

/// Copy a file or a directory tree. Existing directories are merged. Blocking.
pub fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(source)?;
    if meta.is_file() {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(source, dest)?;
        return Ok(());
    }
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dest.join(entry.file_name());
        if file_type.is_dir() {
            copy_tree(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Rename `source` to `dest`, falling back to copy and delete across filesystems.
pub async fn move_path(source: &Path, dest: &Path) -> CatalogResult<()> {
    if tokio::fs::rename(source, dest).await.is_ok() {
        return Ok(());
    }
    let (from, to) = (source.to_path_buf(), dest.to_path_buf());
    tokio::task::spawn_blocking(move || copy_tree(&from, &to))
        .await
        .map_err(join_error)??;
    remove_path(source).await?;
    Ok(())
}

/// Remove a file or directory tree. A missing path is not an error.
pub async fn remove_path(path: &Path) -> io::Result<()> {
    let result = match tokio::fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
        Ok(_) => tokio::fs::remove_file(path).await,
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn move_and_remove_trees() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("a/b")).unwrap();
        fs::write(src.join("a/b/file.txt"), b"hello").unwrap();

        let dst = dir.path().join("dst");
        move_path(&src, &dst).await.unwrap();
        assert!(!src.exists());
        assert_eq!(fs::read(dst.join("a/b/file.txt")).unwrap(), b"hello");

        remove_path(&dst).await.unwrap();
        assert!(!dst.exists());
        remove_path(&dst).await.unwrap();
    }

    #[test]
    fn copy_tree_merges_into_existing() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(&src).unwrap();
        fs::create_dir_all(&dst).unwrap();
        fs::write(src.join("new.txt"), b"n").unwrap();
        fs::write(dst.join("old.txt"), b"o").unwrap();

        copy_tree(&src, &dst).unwrap();
        assert!(dst.join("new.txt").exists());
        assert!(dst.join("old.txt").exists());
    }
}

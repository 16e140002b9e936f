use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Compute SHA-256 hash of data as hex string
pub fn sha256_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    result.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Deterministic pseudo-random bytes; the same seed gives the same output.
pub fn seeded_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut data = vec![0u8; len];
    let mut state = seed;
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }
    data
}

/// Builds a VM bundle directory (`<name>.pvm` or `<name>.macvm`) on disk.
pub struct VmFolder {
    path: PathBuf,
}

#[allow(dead_code)]
impl VmFolder {
    /// A pvm bundle with the files the integrity check requires and one disk.
    pub fn pvm(parent: &Path, name: &str) -> Self {
        let folder = Self::empty(parent, &format!("{name}.pvm"));
        folder
            .file("config.pvs", b"<ParallelsVirtualMachine/>")
            .file("NVRAM.dat", &seeded_bytes(1, 4096))
            .file("harddisk.hdd/harddisk.hdd.0.hds", &seeded_bytes(2, 64 * 1024))
            .file("harddisk.hdd/DiskDescriptor.xml", b"<Parallels_disk_image/>")
    }

    pub fn empty(parent: &Path, dir_name: &str) -> Self {
        let path = parent.join(dir_name);
        std::fs::create_dir_all(&path).unwrap();
        Self { path }
    }

    pub fn file(self, relative: &str, data: &[u8]) -> Self {
        let target = self.path.join(relative);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(target, data).unwrap();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sorted (relative path, sha256) pairs for every file below the folder.
    pub fn digest(&self) -> Vec<(String, String)> {
        tree_digest(&self.path)
    }
}

pub fn tree_digest(root: &Path) -> Vec<(String, String)> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<(String, String)>) {
        for entry in std::fs::read_dir(dir).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                walk(root, &path, out);
            } else {
                let rel = path.strip_prefix(root).unwrap().to_string_lossy().into_owned();
                out.push((rel, sha256_hash(&std::fs::read(&path).unwrap())));
            }
        }
    }
    let mut out = Vec::new();
    walk(root, root, &mut out);
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hash() {
        assert_eq!(
            sha256_hash(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_seeded_bytes_deterministic() {
        assert_eq!(seeded_bytes(42, 100), seeded_bytes(42, 100));
        assert_ne!(seeded_bytes(42, 100), seeded_bytes(43, 100));
    }
}

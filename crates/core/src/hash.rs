//! SHA-256 checksums for packs, metadata files and cache keys.
//!
//! Checksums travel as lowercase hex strings: in manifests (`hash`), as
//! object metadata on S3/Azure, and as the cache key of a pulled pack.

use sha2::{Digest, Sha256};
use std::fmt;
use std::io::Read;
use std::path::Path;

const READ_CHUNK: usize = 64 * 1024;

/// SHA-256 digest of a pack or metadata file.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn compute(data: &[u8]) -> Self {
        Self(Sha256::digest(data).into())
    }

    /// Drain `reader` into the digest. Blocking.
    pub fn of_reader(mut reader: impl Read) -> crate::Result<Self> {
        let mut digest = Sha256::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk)? {
                0 => break,
                n => digest.update(&chunk[..n]),
            }
        }
        Ok(Self(digest.finalize().into()))
    }

    /// Blocking; run on `spawn_blocking` from async code.
    pub fn of_file(path: impl AsRef<Path>) -> crate::Result<Self> {
        Self::of_reader(std::fs::File::open(path.as_ref())?)
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentHash").field(&self.to_hex()).finish()
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Hex SHA-256 of a file, the checksum format used for packs and metadata.
pub fn file_checksum(path: impl AsRef<Path>) -> crate::Result<String> {
    Ok(ContentHash::of_file(path)?.to_hex())
}

/// Compare two hex checksums, ignoring case and surrounding whitespace.
///
/// Empty checksums never match: an unknown remote checksum means "upload".
pub fn checksums_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.trim(), b.trim());
    !a.is_empty() && a.eq_ignore_ascii_case(b)
}

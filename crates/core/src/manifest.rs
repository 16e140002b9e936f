//! Catalog manifest model and deterministic naming rules.

use crate::provider::Provider;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Version assigned to manifests pushed without one.
pub const LATEST_TAG: &str = "latest";

/// Extension of pack archives.
pub const PACK_EXTENSION: &str = "pdpack";

/// Extension of manifest metadata files.
pub const METADATA_EXTENSION: &str = "meta";

const REPLACED_CHARS: &str = " ,:;()[]{}'\"/\\|<>=+*&^%$#@!`~?.";

/// Lowercase, trim, and replace path-hostile characters with `_`.
pub fn normalize(s: &str) -> String {
    s.trim()
        .chars()
        .map(|c| if REPLACED_CHARS.contains(c) { '_' } else { c })
        .collect::<String>()
        .to_lowercase()
}

/// Map architecture aliases onto their canonical names.
pub fn normalize_architecture(arch: &str) -> String {
    match arch.trim().to_lowercase().as_str() {
        "amd64" | "x86_64" => "x86_64".to_string(),
        "arm" | "arm64" | "aarch64" => "arm64".to_string(),
        other => other.to_string(),
    }
}

/// `<catalog>-<arch>-<version>`, each part normalized.
pub fn manifest_name(catalog_id: &str, architecture: &str, version: &str) -> String {
    format!(
        "{}-{}-{}",
        normalize(catalog_id),
        normalize(architecture),
        normalize(version)
    )
}

pub fn metadata_file_name(name: &str) -> String {
    format!("{}.{METADATA_EXTENSION}", normalize(name))
}

pub fn pack_file_name(name: &str) -> String {
    format!("{}.{PACK_EXTENSION}", normalize(name))
}

/// Virtual machine bundle flavours the cache knows how to verify.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmType {
    Pvm,
    Macvm,
}

impl VmType {
    /// Resolve from a folder extension such as `pvm` or `.macvm`.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.trim_start_matches('.').to_ascii_lowercase().as_str() {
            "pvm" => Some(Self::Pvm),
            "macvm" => Some(Self::Macvm),
            _ => None,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Pvm => "pvm",
            Self::Macvm => "macvm",
        }
    }

    /// Files a complete bundle of this type must contain at its root.
    pub fn required_files(&self) -> &'static [&'static str] {
        match self {
            Self::Pvm => &["config.pvs", "NVRAM.dat"],
            Self::Macvm => &["aux.bin", "config.pvs", "macid.bin", "machw.bin"],
        }
    }
}

/// How a cached pack is materialized on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    #[default]
    None,
    Folder,
    File,
}

/// One file or directory inside a VM bundle or pack.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentItem {
    #[serde(default)]
    pub is_dir: bool,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "hash", default)]
    pub checksum: String,
    #[serde(default)]
    pub size: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deleted_at: Option<OffsetDateTime>,
}

/// Metadata record for one packaged VM image version.
///
/// The same document is stored remotely as `<name>.meta`, kept in the
/// metadata store, and mirrored in the local cache as `<checksum>.meta`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub id: String,
    pub catalog_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub architecture: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(rename = "pack_path", default)]
    pub pack_file: String,
    #[serde(rename = "metadata_path", default)]
    pub metadata_file: String,
    #[serde(rename = "type", default)]
    pub vm_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<Provider>,
    /// Unpacked size in MB.
    #[serde(default)]
    pub size: i64,
    /// Pack archive size in bytes.
    #[serde(default)]
    pub pack_size: i64,
    #[serde(default)]
    pub is_compressed: bool,
    #[serde(default)]
    pub pack_relative_path: String,
    #[serde(default)]
    pub required_roles: Vec<String>,
    #[serde(default)]
    pub required_claims: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub updated_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_downloaded_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_downloaded_user: String,
    #[serde(default)]
    pub download_count: i64,
    /// Checksum of the pack file.
    #[serde(default)]
    pub compressed_checksum: String,
    #[serde(default)]
    pub virtual_machine_contents: Vec<ContentItem>,
    #[serde(default)]
    pub pack_contents: Vec<ContentItem>,

    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub tainted_by: String,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub tainted_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub untainted_by: String,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub revoked_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub revoked_by: String,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cached_date: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub cache_last_used: Option<OffsetDateTime>,
    #[serde(default)]
    pub cache_used_count: i64,
    /// Cached size in MB.
    #[serde(default)]
    pub cache_size: i64,
    #[serde(default)]
    pub cache_type: CacheType,
    #[serde(default)]
    pub cache_completed: bool,
    #[serde(default)]
    pub cache_local_full_path: String,
    #[serde(default)]
    pub cache_file_name: String,
    #[serde(default)]
    pub cache_metadata_name: String,
}

impl Manifest {
    /// New manifest with identity and derived file names filled in.
    pub fn new(catalog_id: &str, version: &str, architecture: &str) -> Self {
        let mut manifest = Self {
            catalog_id: catalog_id.to_string(),
            version: version.to_string(),
            architecture: normalize_architecture(architecture),
            ..Self::default()
        };
        manifest.refresh_identity();
        manifest
    }

    /// Recompute `name`, `metadata_file` and `pack_file` from the identity.
    pub fn refresh_identity(&mut self) {
        if self.version.is_empty() {
            self.version = LATEST_TAG.to_string();
        }
        self.name = manifest_name(&self.catalog_id, &self.architecture, &self.version);
        self.metadata_file = metadata_file_name(&self.name);
        self.pack_file = pack_file_name(&self.name);
    }

    /// Fill defaults and check required fields.
    pub fn validate(&mut self) -> crate::Result<()> {
        if self.id.is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.catalog_id.trim().is_empty() {
            return Err(crate::Error::InvalidManifest(
                "catalog_id is required".to_string(),
            ));
        }
        if self.version.is_empty() {
            self.version = LATEST_TAG.to_string();
        }
        self.architecture = normalize_architecture(&self.architecture);
        self.name = manifest_name(&self.catalog_id, &self.architecture, &self.version);

        let required = [
            ("path", &self.path),
            ("pack_path", &self.pack_file),
            ("metadata_path", &self.metadata_file),
        ];
        for (field, value) in required {
            if value.is_empty() {
                return Err(crate::Error::InvalidManifest(format!("{field} is required")));
            }
        }
        Ok(())
    }

    /// Copy suitable for storing: provider (and its credentials) removed.
    pub fn for_persistence(&self) -> Self {
        Self {
            provider: None,
            ..self.clone()
        }
    }

    pub fn vm_type(&self) -> Option<VmType> {
        VmType::from_extension(&self.vm_type)
    }

    /// Serialize the persisted form as pretty JSON.
    pub fn to_metadata_json(&self) -> crate::Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(&self.for_persistence())?)
    }

    pub fn from_metadata_json(data: &[u8]) -> crate::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// True when the manifest refers to the given identity.
    ///
    /// Empty `version` or `architecture` match anything.
    pub fn matches(&self, catalog_id: &str, version: &str, architecture: &str) -> bool {
        self.catalog_id.eq_ignore_ascii_case(catalog_id)
            && (version.is_empty() || self.version.eq_ignore_ascii_case(version))
            && (architecture.is_empty()
                || self.architecture == normalize_architecture(architecture))
    }
}

/// Listing of the local cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CachedManifests {
    /// Sum of `cache_size` in MB.
    pub total_size: i64,
    pub manifests: Vec<Manifest>,
}

impl CachedManifests {
    pub fn new(manifests: Vec<Manifest>) -> Self {
        let total_size = manifests.iter().map(|m| m.cache_size).sum();
        Self {
            total_size,
            manifests,
        }
    }

    /// Eviction order: least recently used day first, then least used count.
    pub fn sort_by_ranking(&mut self) {
        self.manifests.sort_by(|a, b| {
            let day = |m: &Manifest| m.cache_last_used.map(|d| d.date());
            day(a)
                .cmp(&day(b))
                .then(a.cache_used_count.cmp(&b.cache_used_count))
        });
    }

    /// Oldest cached first; entries without a date sort first.
    pub fn sort_by_cached_date(&mut self) {
        self.manifests.sort_by_key(|m| m.cached_date);
    }
}

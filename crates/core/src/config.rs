//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Local image cache configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Whether pulled packs are kept in the cache folder.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,
    /// Cache folder holding `<checksum>.<ext>` packs and `<checksum>.meta` files.
    #[serde(default = "default_cache_folder")]
    pub folder: PathBuf,
    /// Upper bound for the total cache size in MB (0 = unbounded).
    #[serde(default)]
    pub max_size_mb: i64,
    /// Free disk space floor in MB that caching must not cross (0 = disabled).
    #[serde(default)]
    pub keep_free_disk_space_mb: i64,
    /// Allow caching to proceed even when the free-space floor cannot be honoured.
    #[serde(default)]
    pub allow_above_free_disk_space: bool,
    /// Use streaming decompression when the backend supports it.
    /// Halves the space margin needed during population.
    #[serde(default = "default_stream_enabled")]
    pub stream_enabled: bool,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_folder() -> PathBuf {
    PathBuf::from("./data/cache")
}

fn default_stream_enabled() -> bool {
    true
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            folder: default_cache_folder(),
            max_size_mb: 0,
            keep_free_disk_space_mb: 0,
            allow_above_free_disk_space: false,
            stream_enabled: default_stream_enabled(),
        }
    }
}

impl CacheConfig {
    /// Validate cache configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size_mb < 0 {
            return Err(format!(
                "cache.max_size_mb must not be negative (got {})",
                self.max_size_mb
            ));
        }
        if self.keep_free_disk_space_mb < 0 {
            return Err(format!(
                "cache.keep_free_disk_space_mb must not be negative (got {})",
                self.keep_free_disk_space_mb
            ));
        }
        if self.enabled && self.folder.as_os_str().is_empty() {
            return Err("cache.folder must be set when the cache is enabled".to_string());
        }
        Ok(())
    }
}

/// Catalog synchronization settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Scratch directory for packs and metadata in flight.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// Root used by the local storage backend when the connection has no `catalog_path`.
    #[serde(default = "default_local_root")]
    pub default_local_root: PathBuf,
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("./catalog")
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            default_local_root: default_local_root(),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file.
    Sqlite {
        /// Database file path.
        path: PathBuf,
        /// Advisory query timeout in seconds; slow queries are logged, not cancelled.
        #[serde(default = "default_sqlite_query_timeout_secs")]
        query_timeout_secs: Option<u64>,
    },
}

fn default_sqlite_query_timeout_secs() -> Option<u64> {
    Some(600)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/catalog.db"),
            query_timeout_secs: default_sqlite_query_timeout_secs(),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path, .. } if path.as_os_str().is_empty() => {
                Err("metadata.path must not be empty".to_string())
            }
            MetadataConfig::Sqlite { .. } => Ok(()),
        }
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.cache.validate()?;
        self.metadata.validate()?;
        Ok(())
    }

    /// Configuration rooted entirely under `base`, for tests and scratch runs.
    pub fn for_testing(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        Self {
            cache: CacheConfig {
                folder: base.join("cache"),
                ..CacheConfig::default()
            },
            catalog: CatalogConfig {
                temp_dir: base.join("tmp"),
                default_local_root: base.join("catalog"),
            },
            metadata: MetadataConfig::Sqlite {
                path: base.join("catalog.db"),
                query_timeout_secs: None,
            },
        }
    }
}

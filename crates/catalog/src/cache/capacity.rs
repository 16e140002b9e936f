//! Disk accounting and the eviction threshold decision.

use std::io;
use std::path::Path;
use vmcatalog_core::MB;
use vmcatalog_core::config::CacheConfig;

/// Outcome of comparing the cache against its thresholds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupRequirements {
    pub needs_cleaning: bool,
    /// MB that eviction has to free.
    pub space_needed: i64,
    /// Not even an empty cache would leave room for the new entry.
    pub is_fatal: bool,
    pub reason: String,
}

/// Free space on the filesystem holding a path.
pub trait DiskSpace: Send + Sync {
    fn available_mb(&self, path: &Path) -> io::Result<i64>;
}

/// `statvfs` / `GetDiskFreeSpaceExW` through `fs4`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemDiskSpace;

impl DiskSpace for SystemDiskSpace {
    fn available_mb(&self, path: &Path) -> io::Result<i64> {
        let bytes = fs4::available_space(path)?;
        Ok(i64::try_from(bytes / MB as u64).unwrap_or(i64::MAX))
    }
}

/// Decide whether room must be made before caching `package_mb`.
///
/// Population holds the raw pack and its unpacked tree at the same time,
/// so the margin is twice the package size unless the pack is streamed.
pub fn plan_cleanup(
    config: &CacheConfig,
    free_mb: i64,
    cache_total_mb: i64,
    package_mb: i64,
    streaming: bool,
) -> CleanupRequirements {
    let used = if streaming { package_mb } else { package_mb * 2 };

    if used > free_mb + cache_total_mb {
        return CleanupRequirements {
            needs_cleaning: true,
            space_needed: used - (free_mb + cache_total_mb),
            is_fatal: true,
            reason: "free disk space is less than required to cache the package".to_string(),
        };
    }

    let keep = config.keep_free_disk_space_mb;
    if keep > 0 && free_mb < keep + used {
        return CleanupRequirements {
            needs_cleaning: true,
            space_needed: keep + used - free_mb,
            is_fatal: false,
            reason: "free disk space after caching would drop below the keep-free floor"
                .to_string(),
        };
    }

    let max = config.max_size_mb;
    if max > 0 && cache_total_mb + used > max {
        return CleanupRequirements {
            needs_cleaning: true,
            space_needed: cache_total_mb + used - max,
            is_fatal: false,
            reason: "cache size including the new item exceeds the maximum cache size".to_string(),
        };
    }

    CleanupRequirements::default()
}

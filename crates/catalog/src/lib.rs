//! VM catalog synchronization.
//!
//! - [`sync::CatalogService`]: push, pull, import and delete of catalog manifests
//! - [`cache::CacheService`]: content-addressed local cache with quota eviction
//! - [`hypervisor`]: the VM registration seam used by pulls
//! - [`remote_api`]: client for a remote catalog control plane

pub mod cache;
pub mod error;
pub mod fsutil;
pub mod hypervisor;
pub mod notifier;
pub mod remote_api;
pub mod sync;

pub use cache::CacheService;
pub use error::{CatalogError, CatalogResult};
pub use hypervisor::{Hypervisor, PrlctlHypervisor};
pub use notifier::{Notifier, TracingNotifier};
pub use sync::CatalogService;

use std::sync::Arc;
use vmcatalog_core::config::AppConfig;
use vmcatalog_storage::BackendRegistry;

/// Wire a [`CatalogService`] from configuration.
pub async fn from_config(
    config: &AppConfig,
    hypervisor: Arc<dyn Hypervisor>,
) -> CatalogResult<CatalogService> {
    config.validate().map_err(CatalogError::Validation)?;
    tokio::fs::create_dir_all(&config.catalog.temp_dir).await?;

    let store = vmcatalog_metadata::from_config(&config.metadata).await?;
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);
    let cache = CacheService::new(
        config.cache.clone(),
        &config.catalog.temp_dir,
        Arc::clone(&notifier),
    );
    let registry = BackendRegistry::with_defaults(&config.catalog.default_local_root);

    Ok(CatalogService::new(
        registry,
        store,
        cache,
        hypervisor,
        notifier,
        &config.catalog.temp_dir,
    ))
}

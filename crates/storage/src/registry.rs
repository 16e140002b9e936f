//! Backend selection by connection string.

use crate::backends::{AzureProbe, LocalProbe, S3Probe};
use crate::error::StorageResult;
use crate::traits::{BackendProbe, CheckOutcome, StorageBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use vmcatalog_core::Provider;

/// Ordered list of probes. The first probe that claims a connection wins.
#[derive(Default)]
pub struct BackendRegistry {
    probes: Vec<Arc<dyn BackendProbe>>,
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.probes.iter().map(|p| p.name()))
            .finish()
    }
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local, S3 and Azure probes. Relative local catalog paths resolve
    /// under `local_root`.
    pub fn with_defaults(local_root: impl Into<PathBuf>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalProbe::new(local_root)));
        registry.register(Arc::new(S3Probe));
        registry.register(Arc::new(AzureProbe));
        registry
    }

    pub fn register(&mut self, probe: Arc<dyn BackendProbe>) {
        self.probes.push(probe);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Offer `connection` to every probe in order.
    ///
    /// `Ok(None)` means no probe claimed it. A probe that claims the
    /// connection but cannot configure itself stops the search.
    pub async fn resolve(
        &self,
        connection: &Provider,
    ) -> StorageResult<Option<Arc<dyn StorageBackend>>> {
        for probe in &self.probes {
            match probe.check(connection).await? {
                CheckOutcome::Matched(backend) => {
                    debug!(backend = probe.name(), "connection matched backend");
                    return Ok(Some(backend));
                }
                CheckOutcome::NotMatched => continue,
            }
        }
        Ok(None)
    }
}

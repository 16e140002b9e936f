//! Progress messages for the operator.

use tracing::{debug, error, info};

/// Sink for human-readable progress messages.
pub trait Notifier: Send + Sync {
    fn info(&self, message: &str);
    fn debug(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards every message to `tracing`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn info(&self, message: &str) {
        info!(target: "vmcatalog::notify", "{message}");
    }

    fn debug(&self, message: &str) {
        debug!(target: "vmcatalog::notify", "{message}");
    }

    fn error(&self, message: &str) {
        error!(target: "vmcatalog::notify", "{message}");
    }
}

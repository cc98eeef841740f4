mod webhook;

#[cfg(test)]
mod webhook_test;

use std::sync::Arc;

use anyhow::Result;

use crate::workerqueue::WorkerQueue;

pub use webhook::WebhookServer;

/// Liveness checks exposed on the HTTP server's `/health` route.
#[derive(Clone, Default)]
pub struct LivenessChecks {
    checks: Arc<Vec<(String, WorkerQueue)>>,
}

impl LivenessChecks {
    /// Create a new set of named worker queue liveness checks.
    pub fn new(checks: Vec<(&str, WorkerQueue)>) -> Self {
        Self {
            checks: Arc::new(checks.into_iter().map(|(name, queue)| (name.to_string(), queue)).collect()),
        }
    }

    /// Run every check, returning the first failure.
    pub fn check(&self) -> Result<()> {
        for (name, queue) in self.checks.iter() {
            if let Err(err) = queue.healthy() {
                anyhow::bail!("liveness check {} failed: {}", name, err);
            }
        }
        Ok(())
    }
}

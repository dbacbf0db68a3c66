//! Bounded admission of pipeline executions within one worker process.

use std::sync::Arc;

use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};
use tracing::info;

/// Counting gate limiting in-flight pipeline executions.
///
/// A slot is held by the returned permit and returned when the permit drops, so a
/// dispatched execution releases it however it ends.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl ConcurrencyGate {
    /// Creates a gate sized from the configured worker count, capped to the
    /// host's available parallelism on hosts with more than two cores.
    pub fn new(configured: usize) -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let size = gate_size(configured, parallelism);
        info!(configured, parallelism, size, "Concurrency gate initialised");
        Self::with_size(size)
    }

    /// Creates a gate with exactly `size` slots (minimum one).
    pub fn with_size(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    /// Waits for a free slot.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, AcquireError> {
        self.semaphore.clone().acquire_owned().await
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of slots currently held.
    pub fn in_flight(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }
}

fn gate_size(configured: usize, parallelism: usize) -> usize {
    if parallelism > 2 && parallelism <= configured {
        parallelism
    } else {
        configured.max(1)
    }
}

//! Periodic purge of the downloaded-template cache.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{info, warn};

/// How often the template cache is purged.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Best-effort removal of a scratch directory, throttled to one run per interval.
#[derive(Debug, Clone)]
pub struct LocalCleanup {
    dir: PathBuf,
    interval: Duration,
}

impl LocalCleanup {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self::with_interval(dir, CLEANUP_INTERVAL)
    }

    pub fn with_interval(dir: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            dir: dir.into(),
            interval,
        }
    }

    /// Purges the directory if more than the interval has passed since `last_run`.
    ///
    /// Returns the new baseline: now when a purge ran, `last_run` otherwise.
    /// Failures are logged and ignored.
    pub async fn run_if_due(&self, last_run: Instant) -> Instant {
        if last_run.elapsed() <= self.interval {
            return last_run;
        }

        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => info!(dir = %self.dir.display(), "Template cache purged"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(dir = %self.dir.display(), error = %e, "Template cache purge failed"),
        }
        Instant::now()
    }
}

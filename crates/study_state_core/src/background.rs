//! crates/study_state_core/src/background.rs
//!
//! Fire-and-forget durable writes ("best-effort mirrors").
//!
//! A mirror write runs detached from the request that scheduled it. Its failure is logged
//! and counted, never surfaced to the caller, and never rolls back cache state.
//!
//! Critical-path writes that must not be cut short by a caller going away run on the same
//! tracker through `run_detached`, so shutdown waits for them too.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::ports::PortResult;

#[derive(Default)]
struct Counters {
    failures: AtomicU64,
    completed: AtomicU64,
}

/// Spawns and tracks best-effort durable writes.
#[derive(Clone)]
pub struct BestEffortWriter {
    tracker: TaskTracker,
    counters: Arc<Counters>,
}

impl Default for BestEffortWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BestEffortWriter {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Spawns `write` and returns immediately.
    pub fn spawn<F>(&self, label: &'static str, write: F)
    where
        F: Future<Output = PortResult<()>> + Send + 'static,
    {
        let counters = self.counters.clone();
        self.tracker.spawn(async move {
            match write.await {
                Ok(()) => {
                    counters.completed.fetch_add(1, Ordering::Relaxed);
                    debug!(write = label, "best-effort write completed");
                }
                Err(e) => {
                    counters.failures.fetch_add(1, Ordering::Relaxed);
                    error!(write = label, error = %e, "best-effort durable write failed; cache state stands");
                }
            }
        });
    }

    /// Runs `work` on its own tracked task and returns the handle to await its result.
    ///
    /// The work runs to completion even if the handle is dropped.
    pub fn run_detached<F>(&self, work: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(work)
    }

    /// Number of mirror writes that failed since construction.
    pub fn failure_count(&self) -> u64 {
        self.counters.failures.load(Ordering::Relaxed)
    }

    pub fn completed_count(&self) -> u64 {
        self.counters.completed.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Waits until every write spawned so far has finished.
    pub async fn settle(&self) {
        while !self.tracker.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    /// Closes the tracker and gives pending writes up to `grace` to finish.
    ///
    /// Returns `true` if everything finished inside the grace period.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.tracker.close();
        match tokio::time::timeout(grace, self.tracker.wait()).await {
            Ok(()) => true,
            Err(_) => {
                warn!(
                    pending = self.tracker.len(),
                    "best-effort writes still pending after the shutdown grace period"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::PortError;

    #[tokio::test]
    async fn failures_are_counted_not_propagated() {
        let writer = BestEffortWriter::new();
        writer.spawn("ok", async { Ok(()) });
        writer.spawn("broken", async { Err(PortError::Persistence("disk full".into())) });
        writer.settle().await;

        assert_eq!(writer.failure_count(), 1);
        assert_eq!(writer.completed_count(), 1);
        assert_eq!(writer.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn detached_work_finishes_after_the_caller_gives_up() {
        let writer = BestEffortWriter::new();
        let done = Arc::new(AtomicU64::new(0));
        let flag = done.clone();
        let handle = writer.run_detached(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            flag.store(1, Ordering::SeqCst);
        });

        assert!(tokio::time::timeout(Duration::from_millis(50), handle).await.is_err());
        assert_eq!(writer.pending(), 1);
        assert!(writer.drain(Duration::from_secs(1)).await);
        assert_eq!(done.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_the_grace_period() {
        let writer = BestEffortWriter::new();
        writer.spawn("slow", async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Ok(())
        });

        assert!(!writer.drain(Duration::from_secs(5)).await);
        assert_eq!(writer.pending(), 1);
    }

    #[tokio::test]
    async fn drain_waits_for_quick_writes() {
        let writer = BestEffortWriter::new();
        writer.spawn("quick", async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        });

        assert!(writer.drain(Duration::from_secs(5)).await);
        assert_eq!(writer.completed_count(), 1);
    }
}

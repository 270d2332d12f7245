//! crates/study_state_core/src/janitor.rs
//!
//! The periodic background sweep that evicts state the request path left behind.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::StudyState;

/// Handle to the running sweep task.
pub struct Janitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl Janitor {
    /// Spawns the sweep loop. The first pass runs one `interval` after start.
    pub fn start(state: Arc<StudyState>, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick
            ticker.tick().await;

            info!(interval_secs = interval.as_secs(), "janitor started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // A pass that has begun always finishes; cancellation is only
                        // observed between passes.
                        let report = state.sweep().await;
                        if report.is_quiet() {
                            debug!("janitor pass found nothing to do");
                        } else {
                            info!(?report, "janitor pass complete");
                        }
                    }
                }
            }
            info!("janitor stopped");
        });
        Self { cancel, handle }
    }

    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }

    /// Stops the loop and waits for the current pass (if any) to finish.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "janitor task ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StateConfig;
    use crate::memory::InMemoryStore;
    use crate::ports::{ManualClock, StudyStore};
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    #[tokio::test(start_paused = true)]
    async fn janitor_closes_sessions_abandoned_without_end() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let state = Arc::new(StudyState::new(store.clone(), clock.clone(), StateConfig::default()));

        let owner = Uuid::new_v4();
        let session = state.sessions.touch(owner, Uuid::new_v4(), None).await.unwrap();
        clock.advance(chrono::Duration::seconds(301));

        let janitor = Janitor::start(state.clone(), Duration::from_secs(60));
        tokio::time::sleep(Duration::from_secs(61)).await;

        assert!(store.open_study_sessions(owner).is_empty());
        let closed = store.get_study_session(session.id).await.unwrap();
        assert_eq!(closed.duration_seconds, Some(0));
        assert!(state.sessions.get_duration_estimate(owner).await.is_none());

        assert!(janitor.is_running());
        janitor.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_the_loop() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let state = Arc::new(StudyState::new(store, clock, StateConfig::default()));

        let janitor = Janitor::start(state, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(3)).await;
        janitor.shutdown().await;
    }
}

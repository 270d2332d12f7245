//! crates/study_state_core/src/state.rs
//!
//! The constructed-once state object handed to the request layer. It owns the three
//! managers and the shared best-effort writer; tests build isolated instances freely.

use std::sync::Arc;
use std::time::Duration;

use crate::background::BestEffortWriter;
use crate::config::StateConfig;
use crate::context_tracker::ContextTracker;
use crate::ports::{Clock, StudyStore};
use crate::session_manager::SessionManager;
use crate::transcript_buffer::TranscriptBuffer;

/// Counts from one janitor pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub closed_sessions: usize,
    pub evicted_contexts: usize,
    pub trimmed_entries: usize,
    pub dropped_buffers: usize,
    pub pruned_slots: usize,
}

impl SweepReport {
    pub fn is_quiet(&self) -> bool {
        *self == SweepReport::default()
    }
}

pub struct StudyState {
    pub sessions: SessionManager,
    pub contexts: ContextTracker,
    pub transcripts: TranscriptBuffer,
    mirror: BestEffortWriter,
    config: StateConfig,
}

impl StudyState {
    pub fn new(store: Arc<dyn StudyStore>, clock: Arc<dyn Clock>, config: StateConfig) -> Self {
        let mirror = BestEffortWriter::new();
        Self {
            sessions: SessionManager::new(store.clone(), clock.clone(), mirror.clone(), &config),
            contexts: ContextTracker::new(store.clone(), clock.clone(), mirror.clone(), &config),
            transcripts: TranscriptBuffer::new(store, clock, mirror.clone(), &config),
            mirror,
            config,
        }
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn mirror(&self) -> &BestEffortWriter {
        &self.mirror
    }

    /// One janitor pass over every cache. Each entry is visited under its own key lock.
    pub async fn sweep(&self) -> SweepReport {
        let closed_sessions = self.sessions.cleanup_stale().await;
        let evicted_contexts = self.contexts.evict_idle().await;
        let transcripts = self.transcripts.sweep().await;
        let pruned_slots =
            self.sessions.prune() + self.contexts.prune() + self.transcripts.prune();
        SweepReport {
            closed_sessions,
            evicted_contexts,
            trimmed_entries: transcripts.trimmed_entries,
            dropped_buffers: transcripts.dropped_buffers,
            pruned_slots,
        }
    }

    /// Gives pending best-effort writes up to `grace` to land.
    pub async fn drain(&self, grace: Duration) -> bool {
        self.mirror.drain(grace).await
    }
}

//! crates/study_state_core/src/transcript_buffer.rs
//!
//! Live lecture transcription: the durable chunk log plus a short rolling view.
//!
//! The durable chunk log is authoritative. The in-memory `LiveBuffer` only carries the
//! committed sequence counter and the entries shown to live consumers; after a restart it
//! is rebuilt empty, with the counter recovered from the highest committed chunk.

use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, Instrument};
use uuid::Uuid;

use crate::background::BestEffortWriter;
use crate::cache::{reconcile, KeyedSlots, Reconciled};
use crate::config::StateConfig;
use crate::domain::{
    count_words, LectureCompletion, LectureStatus, LiveLectureSession, NewTranscriptChunk,
    RollingBufferEntry, TranscriptChunk,
};
use crate::ports::{Clock, PortError, PortResult, StudyStore};
use crate::session_manager::require_id;

const DEFAULT_TITLE: &str = "Untitled lecture";

struct LiveBuffer {
    owner_id: Uuid,
    /// Highest sequence number known to be committed durably.
    last_sequence: i32,
    entries: VecDeque<RollingBufferEntry>,
    last_eviction_at: DateTime<Utc>,
    last_append_at: DateTime<Utc>,
}

impl LiveBuffer {
    fn new(owner_id: Uuid, last_sequence: i32, now: DateTime<Utc>) -> Self {
        Self {
            owner_id,
            last_sequence,
            entries: VecDeque::new(),
            last_eviction_at: now,
            last_append_at: now,
        }
    }

    /// Entries arrive in order, so everything older than `cutoff` sits at the front.
    fn evict_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let mut evicted = 0;
        while self
            .entries
            .front()
            .is_some_and(|entry| entry.arrival_time < cutoff)
        {
            self.entries.pop_front();
            evicted += 1;
        }
        evicted
    }
}

/// What a janitor sweep did to the lecture buffers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TranscriptSweep {
    pub trimmed_entries: usize,
    pub dropped_buffers: usize,
}

pub struct TranscriptBuffer {
    store: Arc<dyn StudyStore>,
    clock: Arc<dyn Clock>,
    mirror: BestEffortWriter,
    buffers: KeyedSlots<Uuid, LiveBuffer>,
    window: Duration,
    eviction_throttle: Duration,
    idle_ttl: Duration,
    history_limit: i64,
}

impl TranscriptBuffer {
    pub fn new(
        store: Arc<dyn StudyStore>,
        clock: Arc<dyn Clock>,
        mirror: BestEffortWriter,
        config: &StateConfig,
    ) -> Self {
        Self {
            store,
            clock,
            mirror,
            buffers: KeyedSlots::new(),
            window: config.rolling_window,
            eviction_throttle: config.eviction_throttle,
            idle_ttl: config.lecture_buffer_idle,
            history_limit: config.history_limit,
        }
    }

    /// Opens a lecture and its empty rolling buffer.
    #[instrument(skip(self))]
    pub async fn create_session(&self, owner_id: Uuid, title: &str) -> PortResult<LiveLectureSession> {
        require_id(owner_id, "owner_id")?;
        let title = match title.trim() {
            "" => DEFAULT_TITLE,
            trimmed => trimmed,
        };

        let now = self.clock.now();
        let lecture = self.store.create_lecture(owner_id, title, now).await?;
        *self.buffers.lock(&lecture.id).await = Some(LiveBuffer::new(owner_id, 0, now));
        info!(owner_id = %owner_id, session_id = %lecture.id, "live lecture started");
        Ok(lecture)
    }

    /// Commits one transcript chunk and publishes it to the rolling buffer.
    ///
    /// Appends to one lecture are serialized by its slot. The sequence number is taken from
    /// the committed counter and the counter only moves after the durable insert succeeded,
    /// so committed numbers are exactly 1..N. The commit runs on a detached task that owns
    /// the slot, so a caller that stops waiting cannot leave the counter behind the log.
    #[instrument(skip(self, text))]
    pub async fn append_transcript(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
        text: &str,
        offset_ms: i64,
        is_final: bool,
    ) -> PortResult<TranscriptChunk> {
        require_id(session_id, "session_id")?;
        require_id(owner_id, "owner_id")?;
        let text = text.trim().to_string();
        if text.is_empty() {
            return Err(PortError::Validation("transcript text must not be empty".to_string()));
        }
        if offset_ms < 0 {
            return Err(PortError::Validation("offset_ms must not be negative".to_string()));
        }

        let mut guard = self.buffers.lock(&session_id).await;
        let store = self.store.clone();
        let clock = self.clock.clone();
        let mirror = self.mirror.clone();
        let (window, eviction_throttle) = (self.window, self.eviction_throttle);

        let commit: JoinHandle<PortResult<TranscriptChunk>> = self.mirror.run_detached(
            async move {
                let slot: &mut Option<LiveBuffer> = &mut guard;
                reconcile_lecture(&store, slot, session_id, clock.now()).await?;
                let buffer = slot.as_mut().ok_or_else(|| {
                    PortError::NotFound(format!("Lecture session {} is not active", session_id))
                })?;
                if buffer.owner_id != owner_id {
                    return Err(PortError::Unauthorized);
                }

                let now = clock.now();
                let sequence_number = buffer.last_sequence + 1;
                let inserted = store
                    .insert_chunk(NewTranscriptChunk {
                        session_id,
                        word_count: count_words(&text),
                        text,
                        sequence_number,
                        timestamp_offset_ms: offset_ms,
                        is_final,
                        created_at: now,
                    })
                    .await;
                let chunk = match inserted {
                    Ok(chunk) => chunk,
                    Err(PortError::NotFound(message)) => {
                        // Completed durably; the cached buffer is stale.
                        *slot = None;
                        return Err(PortError::NotFound(message));
                    }
                    Err(e) => return Err(e),
                };

                buffer.last_sequence = sequence_number;
                buffer.last_append_at = now;
                buffer.entries.push_back(RollingBufferEntry {
                    text: chunk.text.clone(),
                    arrival_time: now,
                    offset_ms,
                    sequence_number,
                });
                if now - buffer.last_eviction_at >= eviction_throttle {
                    buffer.evict_before(now - window);
                    buffer.last_eviction_at = now;
                }

                let word_count_store = store.clone();
                mirror.spawn("lecture_word_count", async move {
                    word_count_store
                        .refresh_lecture_word_count(session_id)
                        .await
                        .map(|_| ())
                });

                debug!(session_id = %session_id, sequence_number, "transcript chunk committed");
                Ok(chunk)
            }
            .in_current_span(),
        );
        commit.await.map_err(write_task_failed)?
    }

    /// Entries that arrived within the rolling window. Unknown lectures yield nothing.
    pub async fn get_rolling_buffer(&self, session_id: Uuid) -> Vec<RollingBufferEntry> {
        let Some(guard) = self.buffers.lock_existing(&session_id).await else {
            return Vec::new();
        };
        let Some(buffer) = (*guard).as_ref() else {
            return Vec::new();
        };
        let cutoff = self.clock.now() - self.window;
        buffer
            .entries
            .iter()
            .filter(|entry| entry.arrival_time >= cutoff)
            .cloned()
            .collect()
    }

    /// Every committed chunk of an owned lecture, in sequence order.
    pub async fn get_full_transcript(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<Vec<TranscriptChunk>> {
        self.get_live_session(session_id, owner_id).await?;
        self.store.list_chunks(session_id).await
    }

    pub async fn get_live_session(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<LiveLectureSession> {
        require_id(session_id, "session_id")?;
        require_id(owner_id, "owner_id")?;
        let lecture = self.store.get_lecture(session_id).await?;
        if lecture.owner_id != owner_id {
            return Err(PortError::Unauthorized);
        }
        Ok(lecture)
    }

    /// Completes a lecture and discards its buffer.
    ///
    /// The stored word count is the sum of the chunks' own counts; the joined transcript is
    /// only for display. Ending an already completed lecture is `NotFound`. Like appends,
    /// the completion runs on a detached task that owns the slot.
    #[instrument(skip(self))]
    pub async fn end_session(
        &self,
        session_id: Uuid,
        owner_id: Uuid,
    ) -> PortResult<LiveLectureSession> {
        require_id(session_id, "session_id")?;
        require_id(owner_id, "owner_id")?;

        let mut guard = self.buffers.lock(&session_id).await;
        let store = self.store.clone();
        let clock = self.clock.clone();

        let completion: JoinHandle<PortResult<LiveLectureSession>> = self.mirror.run_detached(
            async move {
                let lecture = store.get_lecture(session_id).await?;
                if lecture.owner_id != owner_id {
                    return Err(PortError::Unauthorized);
                }
                if lecture.status == LectureStatus::Completed {
                    *guard = None;
                    return Err(PortError::NotFound(format!(
                        "Lecture session {} is already completed",
                        session_id
                    )));
                }

                let chunks = store.list_chunks(session_id).await?;
                let full_transcript = chunks
                    .iter()
                    .map(|chunk| chunk.text.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                let word_count: i64 = chunks.iter().map(|chunk| i64::from(chunk.word_count)).sum();

                let now = clock.now();
                let completed = store
                    .complete_lecture(LectureCompletion {
                        session_id,
                        ended_at: now,
                        duration_seconds: (now - lecture.started_at).num_seconds().max(0),
                        full_transcript,
                        word_count,
                    })
                    .await?;
                *guard = None;

                info!(
                    session_id = %session_id,
                    chunks = chunks.len(),
                    word_count,
                    "live lecture completed"
                );
                Ok(completed)
            }
            .in_current_span(),
        );
        completion.await.map_err(write_task_failed)?
    }

    /// The owner's lectures, newest first.
    pub async fn get_live_session_history(
        &self,
        owner_id: Uuid,
        limit: Option<i64>,
    ) -> PortResult<Vec<LiveLectureSession>> {
        require_id(owner_id, "owner_id")?;
        let limit = limit.unwrap_or(self.history_limit).clamp(1, self.history_limit.max(1));
        self.store.list_lectures(owner_id, limit).await
    }

    /// Trims every buffer to the window and drops buffers with no recent appends.
    pub async fn sweep(&self) -> TranscriptSweep {
        let mut report = TranscriptSweep::default();
        for session_id in self.buffers.keys() {
            let Some(mut guard) = self.buffers.lock_existing(&session_id).await else {
                continue;
            };
            let now = self.clock.now();
            let idle = match (*guard).as_mut() {
                Some(buffer) if now - buffer.last_append_at > self.idle_ttl => true,
                Some(buffer) => {
                    report.trimmed_entries += buffer.evict_before(now - self.window);
                    buffer.last_eviction_at = now;
                    false
                }
                None => false,
            };
            if idle {
                *guard = None;
                report.dropped_buffers += 1;
                debug!(session_id = %session_id, "dropped idle lecture buffer");
            }
        }
        report
    }

    pub fn prune(&self) -> usize {
        self.buffers.prune()
    }

    pub fn cached_buffers(&self) -> usize {
        self.buffers.occupied()
    }

    #[cfg(test)]
    async fn buffered_len(&self, session_id: Uuid) -> usize {
        match self.buffers.lock_existing(&session_id).await {
            Some(guard) => (*guard).as_ref().map_or(0, |buffer| buffer.entries.len()),
            None => 0,
        }
    }
}

/// Rebuilds an active lecture's buffer from the durable log on a cache miss.
async fn reconcile_lecture(
    store: &Arc<dyn StudyStore>,
    slot: &mut Option<LiveBuffer>,
    session_id: Uuid,
    now: DateTime<Utc>,
) -> PortResult<Reconciled> {
    let store = store.clone();
    let outcome = reconcile(slot, || async move {
        let lecture = store.get_lecture(session_id).await?;
        if lecture.status != LectureStatus::Active {
            return Ok(None);
        }
        let last_sequence = store.last_sequence_number(session_id).await?;
        Ok::<_, PortError>(Some(LiveBuffer::new(lecture.owner_id, last_sequence, now)))
    })
    .await?;
    if outcome == Reconciled::Loaded {
        debug!(session_id = %session_id, "rebuilt lecture buffer from the durable store");
    }
    Ok(outcome)
}

fn write_task_failed(e: JoinError) -> PortError {
    PortError::Unexpected(format!("lecture write task failed: {}", e))
}

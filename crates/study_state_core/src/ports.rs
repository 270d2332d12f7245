//! crates/study_state_core/src/ports.rs
//!
//! Defines the service contracts (traits) the core depends on.
//! These traits form the boundary of the hexagonal architecture, allowing the core
//! to be independent of the concrete durable store and of the wall clock.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;
use uuid::Uuid;

use crate::domain::{
    LectureCompletion, LiveLectureSession, NewTranscriptChunk, StudyContext, StudySession,
    TranscriptChunk,
};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port and manager operations.
/// This abstracts away the specific errors from external services (e.g., the database).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Validation failed: {0}")]
    Validation(String),
    #[error("Durable persistence failed: {0}")]
    Persistence(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Durable Store Port
//=========================================================================================

/// The durable, transactional backing store.
///
/// Lookups that may legitimately find nothing return `Option`; `NotFound` is reserved
/// for operations that act on a specific row which does not exist (or is no longer open).
#[async_trait]
pub trait StudyStore: Send + Sync {
    // --- Study Sessions ---
    async fn create_study_session(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> PortResult<StudySession>;

    /// The owner's most recent session with no `ended_at`.
    async fn find_open_study_session(&self, owner_id: Uuid) -> PortResult<Option<StudySession>>;

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession>;

    async fn update_study_session_position(
        &self,
        session_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
    ) -> PortResult<()>;

    /// Closes a still-open session. Fails with `NotFound` if it is missing or already closed.
    async fn close_study_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    ) -> PortResult<StudySession>;

    async fn list_study_sessions(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<StudySession>>;

    // --- Study Context ---
    /// Inserts or replaces the owner's row, unless the stored row is newer.
    async fn upsert_study_context(&self, context: &StudyContext) -> PortResult<()>;

    async fn get_study_context(&self, owner_id: Uuid) -> PortResult<Option<StudyContext>>;

    async fn delete_study_context(&self, owner_id: Uuid) -> PortResult<()>;

    // --- Live Lectures ---
    async fn create_lecture(
        &self,
        owner_id: Uuid,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> PortResult<LiveLectureSession>;

    async fn get_lecture(&self, session_id: Uuid) -> PortResult<LiveLectureSession>;

    async fn list_lectures(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<LiveLectureSession>>;

    async fn insert_chunk(&self, chunk: NewTranscriptChunk) -> PortResult<TranscriptChunk>;

    /// All chunks of a session ordered by sequence number.
    async fn list_chunks(&self, session_id: Uuid) -> PortResult<Vec<TranscriptChunk>>;

    /// Highest committed sequence number, 0 when the session has no chunks.
    async fn last_sequence_number(&self, session_id: Uuid) -> PortResult<i32>;

    /// Recomputes the cumulative word count from the committed chunks and stores it.
    async fn refresh_lecture_word_count(&self, session_id: Uuid) -> PortResult<i64>;

    /// Completes an active lecture. Fails with `NotFound` if it is missing or already completed.
    async fn complete_lecture(&self, completion: LectureCompletion) -> PortResult<LiveLectureSession>;
}

//=========================================================================================
// Clock Port
//=========================================================================================

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to. Used to drive timeouts deterministically.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

//! crates/study_state_core/src/domain.rs
//!
//! Defines the pure, core data structures for the study-state core.
//! These structs are independent of any database or wire format.

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

//=========================================================================================
// Study Sessions
//=========================================================================================

/// A durable study session. At most one per owner has `ended_at == None`.
#[derive(Debug, Clone, PartialEq)]
pub struct StudySession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub resource_id: Uuid,
    pub section_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub metadata: Value,
}

impl StudySession {
    pub fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// The cached view of an owner's open study session.
///
/// `last_activity_at` only lives here; the durable row never stores it.
#[derive(Debug, Clone, PartialEq)]
pub struct ActiveSessionHandle {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub resource_id: Uuid,
    pub section_id: Option<Uuid>,
    pub started_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ActiveSessionHandle {
    /// Adopts a durable open session into the cache, counting the adoption as activity.
    pub fn adopt(session: &StudySession, now: DateTime<Utc>) -> Self {
        Self {
            id: session.id,
            owner_id: session.owner_id,
            resource_id: session.resource_id,
            section_id: session.section_id,
            started_at: session.started_at,
            last_activity_at: now.max(session.started_at),
        }
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        now - self.last_activity_at
    }
}

//=========================================================================================
// Study Context
//=========================================================================================

/// Where inside a resource the owner currently is.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ContextPosition {
    pub page_number: Option<i32>,
    pub timestamp_seconds: Option<f64>,
    pub metadata: Value,
}

/// The owner's single "current viewing position". New updates overwrite, no history.
#[derive(Debug, Clone, PartialEq)]
pub struct StudyContext {
    pub owner_id: Uuid,
    pub resource_id: Uuid,
    pub page_number: Option<i32>,
    pub timestamp_seconds: Option<f64>,
    pub metadata: Value,
    pub last_activity_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

//=========================================================================================
// Live Lectures
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LectureStatus {
    Active,
    Completed,
}

impl LectureStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LectureStatus::Active => "active",
            LectureStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(LectureStatus::Active),
            "completed" => Some(LectureStatus::Completed),
            _ => None,
        }
    }
}

/// A live-transcription lecture session. Terminal once completed.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveLectureSession {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub word_count: i64,
    pub status: LectureStatus,
    pub full_transcript: Option<String>,
}

/// A committed piece of a lecture transcript, durably ordered by `sequence_number`.
#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptChunk {
    pub id: Uuid,
    pub session_id: Uuid,
    pub text: String,
    pub sequence_number: i32,
    pub timestamp_offset_ms: i64,
    pub word_count: i32,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// A chunk about to be inserted; the store assigns `id`.
#[derive(Debug, Clone)]
pub struct NewTranscriptChunk {
    pub session_id: Uuid,
    pub text: String,
    pub sequence_number: i32,
    pub timestamp_offset_ms: i64,
    pub word_count: i32,
    pub is_final: bool,
    pub created_at: DateTime<Utc>,
}

/// The fields written when a lecture is completed.
#[derive(Debug, Clone)]
pub struct LectureCompletion {
    pub session_id: Uuid,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: i64,
    pub full_transcript: String,
    pub word_count: i64,
}

/// Lightweight view of a chunk kept in the rolling buffer for live consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct RollingBufferEntry {
    pub text: String,
    pub arrival_time: DateTime<Utc>,
    pub offset_ms: i64,
    pub sequence_number: i32,
}

/// Whitespace tokenization used for every word count in the core.
pub fn count_words(text: &str) -> i32 {
    text.split_whitespace().count() as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_words_splits_on_any_whitespace() {
        assert_eq!(count_words("hello world"), 2);
        assert_eq!(count_words("  one\ttwo\nthree  "), 3);
        assert_eq!(count_words("   "), 0);
    }

    #[test]
    fn lecture_status_round_trips_through_its_label() {
        assert_eq!(LectureStatus::parse("active"), Some(LectureStatus::Active));
        assert_eq!(LectureStatus::parse(LectureStatus::Completed.as_str()), Some(LectureStatus::Completed));
        assert_eq!(LectureStatus::parse("paused"), None);
    }
}

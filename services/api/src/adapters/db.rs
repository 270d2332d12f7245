//! services/api/src/adapters/db.rs
//!
//! This module contains the database adapter, which is the concrete implementation
//! of the `StudyStore` port from the core crate. It handles all interactions
//! with the PostgreSQL database using `sqlx`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use study_state_core::domain::{
    LectureCompletion, LectureStatus, LiveLectureSession, NewTranscriptChunk, StudyContext,
    StudySession, TranscriptChunk,
};
use study_state_core::ports::{PortError, PortResult, StudyStore};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `StudyStore` port.
#[derive(Clone)]
pub struct DbAdapter {
    pool: PgPool,
}

impl DbAdapter {
    /// Creates a new `DbAdapter`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn persistence(e: sqlx::Error) -> PortError {
    PortError::Persistence(e.to_string())
}

fn not_found_or_persistence(what: String) -> impl FnOnce(sqlx::Error) -> PortError {
    move |e| match e {
        sqlx::Error::RowNotFound => PortError::NotFound(what),
        other => persistence(other),
    }
}

const STUDY_SESSION_COLUMNS: &str =
    "id, owner_id, resource_id, section_id, started_at, ended_at, duration_seconds, metadata";
const CONTEXT_COLUMNS: &str =
    "owner_id, resource_id, page_number, timestamp_seconds, metadata, last_activity_at, updated_at";
const LECTURE_COLUMNS: &str =
    "id, owner_id, title, started_at, ended_at, duration_seconds, word_count, status, full_transcript";
const CHUNK_COLUMNS: &str =
    "id, session_id, text, sequence_number, timestamp_offset_ms, word_count, is_final, created_at";

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct StudySessionRecord {
    id: Uuid,
    owner_id: Uuid,
    resource_id: Uuid,
    section_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    metadata: Value,
}
impl StudySessionRecord {
    fn to_domain(self) -> StudySession {
        StudySession {
            id: self.id,
            owner_id: self.owner_id,
            resource_id: self.resource_id,
            section_id: self.section_id,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
            metadata: self.metadata,
        }
    }
}

#[derive(FromRow)]
struct StudyContextRecord {
    owner_id: Uuid,
    resource_id: Uuid,
    page_number: Option<i32>,
    timestamp_seconds: Option<f64>,
    metadata: Value,
    last_activity_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl StudyContextRecord {
    fn to_domain(self) -> StudyContext {
        StudyContext {
            owner_id: self.owner_id,
            resource_id: self.resource_id,
            page_number: self.page_number,
            timestamp_seconds: self.timestamp_seconds,
            metadata: self.metadata,
            last_activity_at: self.last_activity_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow)]
struct LectureRecord {
    id: Uuid,
    owner_id: Uuid,
    title: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    word_count: i64,
    status: String,
    full_transcript: Option<String>,
}
impl LectureRecord {
    fn to_domain(self) -> PortResult<LiveLectureSession> {
        let status = LectureStatus::parse(&self.status).ok_or_else(|| {
            PortError::Unexpected(format!(
                "Lecture {} has unknown status '{}'",
                self.id, self.status
            ))
        })?;
        Ok(LiveLectureSession {
            id: self.id,
            owner_id: self.owner_id,
            title: self.title,
            started_at: self.started_at,
            ended_at: self.ended_at,
            duration_seconds: self.duration_seconds,
            word_count: self.word_count,
            status,
            full_transcript: self.full_transcript,
        })
    }
}

#[derive(FromRow)]
struct ChunkRecord {
    id: Uuid,
    session_id: Uuid,
    text: String,
    sequence_number: i32,
    timestamp_offset_ms: i64,
    word_count: i32,
    is_final: bool,
    created_at: DateTime<Utc>,
}
impl ChunkRecord {
    fn to_domain(self) -> TranscriptChunk {
        TranscriptChunk {
            id: self.id,
            session_id: self.session_id,
            text: self.text,
            sequence_number: self.sequence_number,
            timestamp_offset_ms: self.timestamp_offset_ms,
            word_count: self.word_count,
            is_final: self.is_final,
            created_at: self.created_at,
        }
    }
}

//=========================================================================================
// `StudyStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl StudyStore for DbAdapter {
    async fn create_study_session(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> PortResult<StudySession> {
        let record = sqlx::query_as::<_, StudySessionRecord>(&format!(
            "INSERT INTO study_sessions (id, owner_id, resource_id, section_id, started_at) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {STUDY_SESSION_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(resource_id)
        .bind(section_id)
        .bind(started_at)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(record.to_domain())
    }

    async fn find_open_study_session(&self, owner_id: Uuid) -> PortResult<Option<StudySession>> {
        let record = sqlx::query_as::<_, StudySessionRecord>(&format!(
            "SELECT {STUDY_SESSION_COLUMNS} FROM study_sessions \
             WHERE owner_id = $1 AND ended_at IS NULL ORDER BY started_at DESC LIMIT 1"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession> {
        let record = sqlx::query_as::<_, StudySessionRecord>(&format!(
            "SELECT {STUDY_SESSION_COLUMNS} FROM study_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or_persistence(format!(
            "Study session {} not found",
            session_id
        )))?;
        Ok(record.to_domain())
    }

    async fn update_study_session_position(
        &self,
        session_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
    ) -> PortResult<()> {
        sqlx::query(
            "UPDATE study_sessions SET resource_id = $2, section_id = $3 \
             WHERE id = $1 AND ended_at IS NULL",
        )
        .bind(session_id)
        .bind(resource_id)
        .bind(section_id)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    async fn close_study_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    ) -> PortResult<StudySession> {
        let record = sqlx::query_as::<_, StudySessionRecord>(&format!(
            "UPDATE study_sessions SET ended_at = $2, duration_seconds = $3 \
             WHERE id = $1 AND ended_at IS NULL RETURNING {STUDY_SESSION_COLUMNS}"
        ))
        .bind(session_id)
        .bind(ended_at)
        .bind(duration_seconds)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        record.map(|r| r.to_domain()).ok_or_else(|| {
            PortError::NotFound(format!("Open study session {} not found", session_id))
        })
    }

    async fn list_study_sessions(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<StudySession>> {
        let records = sqlx::query_as::<_, StudySessionRecord>(&format!(
            "SELECT {STUDY_SESSION_COLUMNS} FROM study_sessions \
             WHERE owner_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        let sessions = records.into_iter().map(|r| r.to_domain()).collect();
        Ok(sessions)
    }

    async fn upsert_study_context(&self, context: &StudyContext) -> PortResult<()> {
        // The WHERE clause keeps a newer stored row when mirror writes land out of order.
        sqlx::query(
            "INSERT INTO study_contexts \
             (owner_id, resource_id, page_number, timestamp_seconds, metadata, last_activity_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             ON CONFLICT (owner_id) DO UPDATE SET \
             resource_id = EXCLUDED.resource_id, page_number = EXCLUDED.page_number, \
             timestamp_seconds = EXCLUDED.timestamp_seconds, metadata = EXCLUDED.metadata, \
             last_activity_at = EXCLUDED.last_activity_at, updated_at = EXCLUDED.updated_at \
             WHERE study_contexts.updated_at <= EXCLUDED.updated_at",
        )
        .bind(context.owner_id)
        .bind(context.resource_id)
        .bind(context.page_number)
        .bind(context.timestamp_seconds)
        .bind(&context.metadata)
        .bind(context.last_activity_at)
        .bind(context.updated_at)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(())
    }

    async fn get_study_context(&self, owner_id: Uuid) -> PortResult<Option<StudyContext>> {
        let record = sqlx::query_as::<_, StudyContextRecord>(&format!(
            "SELECT {CONTEXT_COLUMNS} FROM study_contexts WHERE owner_id = $1"
        ))
        .bind(owner_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        Ok(record.map(|r| r.to_domain()))
    }

    async fn delete_study_context(&self, owner_id: Uuid) -> PortResult<()> {
        sqlx::query("DELETE FROM study_contexts WHERE owner_id = $1")
            .bind(owner_id)
            .execute(&self.pool)
            .await
            .map_err(persistence)?;
        Ok(())
    }

    async fn create_lecture(
        &self,
        owner_id: Uuid,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> PortResult<LiveLectureSession> {
        let record = sqlx::query_as::<_, LectureRecord>(&format!(
            "INSERT INTO live_lecture_sessions (id, owner_id, title, started_at, status) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {LECTURE_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(owner_id)
        .bind(title)
        .bind(started_at)
        .bind(LectureStatus::Active.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)?;
        record.to_domain()
    }

    async fn get_lecture(&self, session_id: Uuid) -> PortResult<LiveLectureSession> {
        let record = sqlx::query_as::<_, LectureRecord>(&format!(
            "SELECT {LECTURE_COLUMNS} FROM live_lecture_sessions WHERE id = $1"
        ))
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(not_found_or_persistence(format!(
            "Lecture session {} not found",
            session_id
        )))?;
        record.to_domain()
    }

    async fn list_lectures(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<LiveLectureSession>> {
        let records = sqlx::query_as::<_, LectureRecord>(&format!(
            "SELECT {LECTURE_COLUMNS} FROM live_lecture_sessions \
             WHERE owner_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(owner_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        records.into_iter().map(|r| r.to_domain()).collect()
    }

    async fn insert_chunk(&self, chunk: NewTranscriptChunk) -> PortResult<TranscriptChunk> {
        // The row lock keeps a concurrent completion from slipping in between check and insert.
        let record = sqlx::query_as::<_, ChunkRecord>(&format!(
            "INSERT INTO transcript_chunks \
             (id, session_id, text, sequence_number, timestamp_offset_ms, word_count, is_final, created_at) \
             SELECT $1::uuid, $2::uuid, $3::text, $4::int4, $5::int8, $6::int4, $7::bool, $8::timestamptz \
             WHERE EXISTS ( \
                 SELECT 1 FROM live_lecture_sessions WHERE id = $2 AND status = 'active' FOR SHARE \
             ) RETURNING {CHUNK_COLUMNS}"
        ))
        .bind(Uuid::new_v4())
        .bind(chunk.session_id)
        .bind(&chunk.text)
        .bind(chunk.sequence_number)
        .bind(chunk.timestamp_offset_ms)
        .bind(chunk.word_count)
        .bind(chunk.is_final)
        .bind(chunk.created_at)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        record.map(|r| r.to_domain()).ok_or_else(|| {
            PortError::NotFound(format!("Active lecture session {} not found", chunk.session_id))
        })
    }

    async fn list_chunks(&self, session_id: Uuid) -> PortResult<Vec<TranscriptChunk>> {
        let records = sqlx::query_as::<_, ChunkRecord>(&format!(
            "SELECT {CHUNK_COLUMNS} FROM transcript_chunks \
             WHERE session_id = $1 ORDER BY sequence_number ASC"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        let chunks = records.into_iter().map(|r| r.to_domain()).collect();
        Ok(chunks)
    }

    async fn last_sequence_number(&self, session_id: Uuid) -> PortResult<i32> {
        sqlx::query_scalar::<_, i32>(
            "SELECT COALESCE(MAX(sequence_number), 0) FROM transcript_chunks WHERE session_id = $1",
        )
        .bind(session_id)
        .fetch_one(&self.pool)
        .await
        .map_err(persistence)
    }

    async fn refresh_lecture_word_count(&self, session_id: Uuid) -> PortResult<i64> {
        let total = sqlx::query_scalar::<_, i64>(
            "UPDATE live_lecture_sessions SET word_count = \
             (SELECT COALESCE(SUM(word_count), 0) FROM transcript_chunks WHERE session_id = $1) \
             WHERE id = $1 RETURNING word_count",
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        total.ok_or_else(|| PortError::NotFound(format!("Lecture session {} not found", session_id)))
    }

    async fn complete_lecture(&self, completion: LectureCompletion) -> PortResult<LiveLectureSession> {
        let record = sqlx::query_as::<_, LectureRecord>(&format!(
            "UPDATE live_lecture_sessions SET ended_at = $2, duration_seconds = $3, \
             full_transcript = $4, word_count = $5, status = $6 \
             WHERE id = $1 AND status = $7 RETURNING {LECTURE_COLUMNS}"
        ))
        .bind(completion.session_id)
        .bind(completion.ended_at)
        .bind(completion.duration_seconds)
        .bind(&completion.full_transcript)
        .bind(completion.word_count)
        .bind(LectureStatus::Completed.as_str())
        .bind(LectureStatus::Active.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;
        match record {
            Some(record) => record.to_domain(),
            None => Err(PortError::NotFound(format!(
                "Active lecture session {} not found",
                completion.session_id
            ))),
        }
    }
}

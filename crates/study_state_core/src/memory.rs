//! crates/study_state_core/src/memory.rs
//!
//! An in-process implementation of the `StudyStore` port.
//!
//! It enforces the same row-level constraints as the PostgreSQL schema (one open study
//! session per owner, unique chunk sequence numbers per lecture, newer-wins context rows)
//! and can be told to fail every write, which is how the tests exercise the
//! persistence-failure paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::domain::{
    LectureCompletion, LectureStatus, LiveLectureSession, NewTranscriptChunk, StudyContext,
    StudySession, TranscriptChunk,
};
use crate::ports::{PortError, PortResult, StudyStore};

#[derive(Default)]
struct Tables {
    study_sessions: Vec<StudySession>,
    contexts: HashMap<Uuid, StudyContext>,
    lectures: HashMap<Uuid, LiveLectureSession>,
    chunks: Vec<TranscriptChunk>,
}

#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    reads: AtomicUsize,
    ack_delay_ms: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail with `PortError::Persistence` until reset.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Holds back the reply of chunk inserts and lecture completions for `delay` after
    /// the write has already been applied, like a database whose commit acknowledgement
    /// is slow to arrive.
    pub fn set_ack_delay(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.ack_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Number of read operations served so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// The owner's open study sessions, read directly from the tables.
    pub fn open_study_sessions(&self, owner_id: Uuid) -> Vec<StudySession> {
        self.tables
            .lock()
            .map(|t| {
                t.study_sessions
                    .iter()
                    .filter(|s| s.owner_id == owner_id && s.is_open())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn tables(&self) -> PortResult<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| PortError::Unexpected("in-memory store lock poisoned".to_string()))
    }

    fn read(&self) -> PortResult<MutexGuard<'_, Tables>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.tables()
    }

    fn write(&self) -> PortResult<MutexGuard<'_, Tables>> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PortError::Persistence("injected write failure".to_string()));
        }
        self.tables()
    }

    async fn acknowledge(&self) {
        let millis = self.ack_delay_ms.load(Ordering::SeqCst);
        if millis > 0 {
            tokio::time::sleep(Duration::from_millis(millis)).await;
        }
    }
}

fn newest_first<T>(rows: &mut [T], started_at: impl Fn(&T) -> DateTime<Utc>) {
    rows.sort_by_key(|row| std::cmp::Reverse(started_at(row)));
}

#[async_trait]
impl StudyStore for InMemoryStore {
    async fn create_study_session(
        &self,
        owner_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
        started_at: DateTime<Utc>,
    ) -> PortResult<StudySession> {
        let mut tables = self.write()?;
        if tables
            .study_sessions
            .iter()
            .any(|s| s.owner_id == owner_id && s.is_open())
        {
            return Err(PortError::Persistence(format!(
                "owner {} already has an open study session",
                owner_id
            )));
        }
        let session = StudySession {
            id: Uuid::new_v4(),
            owner_id,
            resource_id,
            section_id,
            started_at,
            ended_at: None,
            duration_seconds: None,
            metadata: serde_json::json!({}),
        };
        tables.study_sessions.push(session.clone());
        Ok(session)
    }

    async fn find_open_study_session(&self, owner_id: Uuid) -> PortResult<Option<StudySession>> {
        let tables = self.read()?;
        Ok(tables
            .study_sessions
            .iter()
            .filter(|s| s.owner_id == owner_id && s.is_open())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn get_study_session(&self, session_id: Uuid) -> PortResult<StudySession> {
        let tables = self.read()?;
        tables
            .study_sessions
            .iter()
            .find(|s| s.id == session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Study session {} not found", session_id)))
    }

    async fn update_study_session_position(
        &self,
        session_id: Uuid,
        resource_id: Uuid,
        section_id: Option<Uuid>,
    ) -> PortResult<()> {
        let mut tables = self.write()?;
        if let Some(session) = tables
            .study_sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_open())
        {
            session.resource_id = resource_id;
            session.section_id = section_id;
        }
        Ok(())
    }

    async fn close_study_session(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_seconds: i64,
    ) -> PortResult<StudySession> {
        let mut tables = self.write()?;
        let session = tables
            .study_sessions
            .iter_mut()
            .find(|s| s.id == session_id && s.is_open())
            .ok_or_else(|| {
                PortError::NotFound(format!("Open study session {} not found", session_id))
            })?;
        session.ended_at = Some(ended_at);
        session.duration_seconds = Some(duration_seconds);
        Ok(session.clone())
    }

    async fn list_study_sessions(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<StudySession>> {
        let tables = self.read()?;
        let mut sessions: Vec<StudySession> = tables
            .study_sessions
            .iter()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        newest_first(&mut sessions, |s| s.started_at);
        sessions.truncate(limit.max(0) as usize);
        Ok(sessions)
    }

    async fn upsert_study_context(&self, context: &StudyContext) -> PortResult<()> {
        let mut tables = self.write()?;
        let newer_stored = tables
            .contexts
            .get(&context.owner_id)
            .is_some_and(|stored| stored.updated_at > context.updated_at);
        if !newer_stored {
            tables.contexts.insert(context.owner_id, context.clone());
        }
        Ok(())
    }

    async fn get_study_context(&self, owner_id: Uuid) -> PortResult<Option<StudyContext>> {
        let tables = self.read()?;
        Ok(tables.contexts.get(&owner_id).cloned())
    }

    async fn delete_study_context(&self, owner_id: Uuid) -> PortResult<()> {
        let mut tables = self.write()?;
        tables.contexts.remove(&owner_id);
        Ok(())
    }

    async fn create_lecture(
        &self,
        owner_id: Uuid,
        title: &str,
        started_at: DateTime<Utc>,
    ) -> PortResult<LiveLectureSession> {
        let mut tables = self.write()?;
        let lecture = LiveLectureSession {
            id: Uuid::new_v4(),
            owner_id,
            title: title.to_string(),
            started_at,
            ended_at: None,
            duration_seconds: None,
            word_count: 0,
            status: LectureStatus::Active,
            full_transcript: None,
        };
        tables.lectures.insert(lecture.id, lecture.clone());
        Ok(lecture)
    }

    async fn get_lecture(&self, session_id: Uuid) -> PortResult<LiveLectureSession> {
        let tables = self.read()?;
        tables
            .lectures
            .get(&session_id)
            .cloned()
            .ok_or_else(|| PortError::NotFound(format!("Lecture session {} not found", session_id)))
    }

    async fn list_lectures(&self, owner_id: Uuid, limit: i64) -> PortResult<Vec<LiveLectureSession>> {
        let tables = self.read()?;
        let mut lectures: Vec<LiveLectureSession> = tables
            .lectures
            .values()
            .filter(|l| l.owner_id == owner_id)
            .cloned()
            .collect();
        newest_first(&mut lectures, |l| l.started_at);
        lectures.truncate(limit.max(0) as usize);
        Ok(lectures)
    }

    async fn insert_chunk(&self, chunk: NewTranscriptChunk) -> PortResult<TranscriptChunk> {
        let stored = {
            let mut tables = self.write()?;
            let active = tables
                .lectures
                .get(&chunk.session_id)
                .is_some_and(|l| l.status == LectureStatus::Active);
            if !active {
                return Err(PortError::NotFound(format!(
                    "Active lecture session {} not found",
                    chunk.session_id
                )));
            }
            if tables
                .chunks
                .iter()
                .any(|c| c.session_id == chunk.session_id && c.sequence_number == chunk.sequence_number)
            {
                return Err(PortError::Persistence(format!(
                    "duplicate sequence number {} for lecture {}",
                    chunk.sequence_number, chunk.session_id
                )));
            }
            let stored = TranscriptChunk {
                id: Uuid::new_v4(),
                session_id: chunk.session_id,
                text: chunk.text,
                sequence_number: chunk.sequence_number,
                timestamp_offset_ms: chunk.timestamp_offset_ms,
                word_count: chunk.word_count,
                is_final: chunk.is_final,
                created_at: chunk.created_at,
            };
            tables.chunks.push(stored.clone());
            stored
        };
        self.acknowledge().await;
        Ok(stored)
    }

    async fn list_chunks(&self, session_id: Uuid) -> PortResult<Vec<TranscriptChunk>> {
        let tables = self.read()?;
        let mut chunks: Vec<TranscriptChunk> = tables
            .chunks
            .iter()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect();
        chunks.sort_by_key(|c| c.sequence_number);
        Ok(chunks)
    }

    async fn last_sequence_number(&self, session_id: Uuid) -> PortResult<i32> {
        let tables = self.read()?;
        Ok(tables
            .chunks
            .iter()
            .filter(|c| c.session_id == session_id)
            .map(|c| c.sequence_number)
            .max()
            .unwrap_or(0))
    }

    async fn refresh_lecture_word_count(&self, session_id: Uuid) -> PortResult<i64> {
        let mut tables = self.write()?;
        let total: i64 = tables
            .chunks
            .iter()
            .filter(|c| c.session_id == session_id)
            .map(|c| i64::from(c.word_count))
            .sum();
        if let Some(lecture) = tables.lectures.get_mut(&session_id) {
            lecture.word_count = total;
        }
        Ok(total)
    }

    async fn complete_lecture(&self, completion: LectureCompletion) -> PortResult<LiveLectureSession> {
        let completed = {
            let mut tables = self.write()?;
            let lecture = tables
                .lectures
                .get_mut(&completion.session_id)
                .filter(|l| l.status == LectureStatus::Active)
                .ok_or_else(|| {
                    PortError::NotFound(format!(
                        "Active lecture session {} not found",
                        completion.session_id
                    ))
                })?;
            lecture.ended_at = Some(completion.ended_at);
            lecture.duration_seconds = Some(completion.duration_seconds);
            lecture.full_transcript = Some(completion.full_transcript);
            lecture.word_count = completion.word_count;
            lecture.status = LectureStatus::Completed;
            lecture.clone()
        };
        self.acknowledge().await;
        Ok(completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn chunks_are_only_accepted_by_active_lectures() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let lecture = store.create_lecture(Uuid::new_v4(), "Optics", now).await.unwrap();
        let chunk = |sequence_number| NewTranscriptChunk {
            session_id: lecture.id,
            text: "light".to_string(),
            sequence_number,
            timestamp_offset_ms: 0,
            word_count: 1,
            is_final: true,
            created_at: now,
        };

        store.insert_chunk(chunk(1)).await.unwrap();
        store
            .complete_lecture(LectureCompletion {
                session_id: lecture.id,
                ended_at: now,
                duration_seconds: 0,
                full_transcript: "light".to_string(),
                word_count: 1,
            })
            .await
            .unwrap();

        let err = store.insert_chunk(chunk(2)).await.unwrap_err();
        assert!(matches!(err, PortError::NotFound(_)));
        assert_eq!(store.list_chunks(lecture.id).await.unwrap().len(), 1);

        let mut unknown = chunk(1);
        unknown.session_id = Uuid::new_v4();
        assert!(matches!(store.insert_chunk(unknown).await, Err(PortError::NotFound(_))));
    }
}

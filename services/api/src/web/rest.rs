//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification.

use crate::web::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    Extension,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use study_state_core::{
    ActiveSessionHandle, ContextPosition, LiveLectureSession, PortError, RollingBufferEntry,
    StudyContext, StudySession, TranscriptChunk,
};
use tracing::error;
use utoipa::{IntoParams, OpenApi, ToSchema};
use uuid::Uuid;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        touch_handler,
        start_study_handler,
        end_study_handler,
        active_study_handler,
        study_duration_handler,
        study_history_handler,
        put_context_handler,
        get_context_handler,
        clear_context_handler,
        context_age_handler,
        create_lecture_handler,
        list_lectures_handler,
        get_lecture_handler,
        append_transcript_handler,
        rolling_buffer_handler,
        full_transcript_handler,
        end_lecture_handler,
    ),
    components(
        schemas(
            TouchRequest, EndStudyRequest, ContextRequest, CreateLectureRequest,
            AppendTranscriptRequest, ActiveSessionResponse, StudySessionResponse,
            ElapsedResponse, ContextResponse, LectureResponse, ChunkResponse,
            BufferEntryResponse
        )
    ),
    tags(
        (name = "Study State API", description = "Study sessions, viewing context and live lecture transcripts.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Request Payload Structs
//=========================================================================================

/// Activity on a resource, optionally narrowed to a section.
#[derive(Deserialize, ToSchema)]
pub struct TouchRequest {
    pub resource_id: Uuid,
    #[serde(default)]
    pub section_id: Option<Uuid>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct EndStudyRequest {
    /// Ends this specific session. When omitted the owner's open session is ended.
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

#[derive(Deserialize, ToSchema)]
pub struct ContextRequest {
    pub resource_id: Uuid,
    #[serde(default)]
    pub page_number: Option<i32>,
    #[serde(default)]
    pub timestamp_seconds: Option<f64>,
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub metadata: Option<Value>,
}

#[derive(Deserialize, ToSchema, Default)]
pub struct CreateLectureRequest {
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Deserialize, ToSchema)]
pub struct AppendTranscriptRequest {
    pub text: String,
    /// Milliseconds since the lecture started.
    pub offset_ms: i64,
    #[serde(default = "default_is_final")]
    pub is_final: bool,
}

fn default_is_final() -> bool {
    true
}

#[derive(Deserialize, IntoParams)]
pub struct HistoryQuery {
    /// Maximum number of rows, capped by the server.
    pub limit: Option<i64>,
}

//=========================================================================================
// API Response Structs
//=========================================================================================

#[derive(Serialize, ToSchema)]
pub struct ActiveSessionResponse {
    session_id: Uuid,
    resource_id: Uuid,
    section_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
}

impl From<ActiveSessionHandle> for ActiveSessionResponse {
    fn from(handle: ActiveSessionHandle) -> Self {
        Self {
            session_id: handle.id,
            resource_id: handle.resource_id,
            section_id: handle.section_id,
            started_at: handle.started_at,
            last_activity_at: handle.last_activity_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct StudySessionResponse {
    session_id: Uuid,
    resource_id: Uuid,
    section_id: Option<Uuid>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
}

impl From<StudySession> for StudySessionResponse {
    fn from(session: StudySession) -> Self {
        Self {
            session_id: session.id,
            resource_id: session.resource_id,
            section_id: session.section_id,
            started_at: session.started_at,
            ended_at: session.ended_at,
            duration_seconds: session.duration_seconds,
        }
    }
}

/// Seconds elapsed according to the cache; `null` when nothing is cached.
#[derive(Serialize, ToSchema)]
pub struct ElapsedResponse {
    seconds: Option<i64>,
}

#[derive(Serialize, ToSchema)]
pub struct ContextResponse {
    resource_id: Uuid,
    page_number: Option<i32>,
    timestamp_seconds: Option<f64>,
    #[schema(value_type = Object)]
    metadata: Value,
    last_activity_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<StudyContext> for ContextResponse {
    fn from(context: StudyContext) -> Self {
        Self {
            resource_id: context.resource_id,
            page_number: context.page_number,
            timestamp_seconds: context.timestamp_seconds,
            metadata: context.metadata,
            last_activity_at: context.last_activity_at,
            updated_at: context.updated_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct LectureResponse {
    session_id: Uuid,
    title: String,
    status: String,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    duration_seconds: Option<i64>,
    word_count: i64,
    full_transcript: Option<String>,
}

impl From<LiveLectureSession> for LectureResponse {
    fn from(lecture: LiveLectureSession) -> Self {
        Self {
            session_id: lecture.id,
            title: lecture.title,
            status: lecture.status.as_str().to_string(),
            started_at: lecture.started_at,
            ended_at: lecture.ended_at,
            duration_seconds: lecture.duration_seconds,
            word_count: lecture.word_count,
            full_transcript: lecture.full_transcript,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct ChunkResponse {
    chunk_id: Uuid,
    text: String,
    sequence_number: i32,
    timestamp_offset_ms: i64,
    word_count: i32,
    is_final: bool,
    created_at: DateTime<Utc>,
}

impl From<TranscriptChunk> for ChunkResponse {
    fn from(chunk: TranscriptChunk) -> Self {
        Self {
            chunk_id: chunk.id,
            text: chunk.text,
            sequence_number: chunk.sequence_number,
            timestamp_offset_ms: chunk.timestamp_offset_ms,
            word_count: chunk.word_count,
            is_final: chunk.is_final,
            created_at: chunk.created_at,
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct BufferEntryResponse {
    text: String,
    arrival_time: DateTime<Utc>,
    offset_ms: i64,
    sequence_number: i32,
}

impl From<RollingBufferEntry> for BufferEntryResponse {
    fn from(entry: RollingBufferEntry) -> Self {
        Self {
            text: entry.text,
            arrival_time: entry.arrival_time,
            offset_ms: entry.offset_ms,
            sequence_number: entry.sequence_number,
        }
    }
}

//=========================================================================================
// Error Mapping
//=========================================================================================

/// Maps a core error onto a status. Server-side failures are logged and their detail
/// is kept out of the response body.
fn port_error(action: &str, e: PortError) -> (StatusCode, String) {
    let status = match &e {
        PortError::Validation(_) => StatusCode::BAD_REQUEST,
        PortError::Unauthorized => StatusCode::FORBIDDEN,
        PortError::NotFound(_) => StatusCode::NOT_FOUND,
        PortError::Persistence(_) | PortError::Unexpected(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!("Failed to {}: {:?}", action, e);
        (status, format!("Failed to {}", action))
    } else {
        (status, e.to_string())
    }
}

fn collect<T, R: From<T>>(items: Vec<T>) -> Json<Vec<R>> {
    Json(items.into_iter().map(R::from).collect())
}

//=========================================================================================
// Study Session Handlers
//=========================================================================================

/// Record activity, continuing or replacing the owner's open study session.
#[utoipa::path(
    post,
    path = "/study/touch",
    request_body = TouchRequest,
    responses(
        (status = 200, description = "The session the activity was attributed to", body = ActiveSessionResponse),
        (status = 400, description = "Invalid identifiers"),
        (status = 401, description = "Missing or invalid x-user-id header"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn touch_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Json(body): Json<TouchRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = app_state
        .study
        .sessions
        .touch(owner_id, body.resource_id, body.section_id)
        .await
        .map_err(|e| port_error("record study activity", e))?;
    Ok(Json(ActiveSessionResponse::from(handle)))
}

/// Explicitly start a new study session, closing any open one.
#[utoipa::path(
    post,
    path = "/study/start",
    request_body = TouchRequest,
    responses(
        (status = 201, description = "Session started", body = ActiveSessionResponse),
        (status = 400, description = "Invalid identifiers"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn start_study_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Json(body): Json<TouchRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = app_state
        .study
        .sessions
        .start(owner_id, body.resource_id, body.section_id)
        .await
        .map_err(|e| port_error("start study session", e))?;
    Ok((StatusCode::CREATED, Json(ActiveSessionResponse::from(handle))))
}

/// End the owner's open study session, or a specific one.
#[utoipa::path(
    post,
    path = "/study/end",
    request_body = EndStudyRequest,
    responses(
        (status = 200, description = "The closed session", body = StudySessionResponse),
        (status = 404, description = "No open session to end"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn end_study_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Json(body): Json<EndStudyRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let session = app_state
        .study
        .sessions
        .end(owner_id, body.session_id)
        .await
        .map_err(|e| port_error("end study session", e))?;
    Ok(Json(StudySessionResponse::from(session)))
}

/// The owner's open study session.
#[utoipa::path(
    get,
    path = "/study/active",
    responses(
        (status = 200, description = "The open session", body = ActiveSessionResponse),
        (status = 404, description = "The owner has no open session"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn active_study_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = app_state
        .study
        .sessions
        .get_active_session(owner_id)
        .await
        .map_err(|e| port_error("load active study session", e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No active study session".to_string()))?;
    Ok(Json(ActiveSessionResponse::from(handle)))
}

/// Seconds since the cached session started.
#[utoipa::path(
    get,
    path = "/study/duration",
    responses((status = 200, description = "Elapsed time, null when no session is cached", body = ElapsedResponse)),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn study_duration_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
) -> impl IntoResponse {
    let seconds = app_state
        .study
        .sessions
        .get_duration_estimate(owner_id)
        .await
        .map(|elapsed| elapsed.num_seconds());
    Json(ElapsedResponse { seconds })
}

/// The owner's study sessions, newest first.
#[utoipa::path(
    get,
    path = "/study/history",
    responses(
        (status = 200, description = "Past and current sessions", body = Vec<StudySessionResponse>),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        HistoryQuery
    )
)]
pub async fn study_history_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<StudySessionResponse>>, (StatusCode, String)> {
    let sessions = app_state
        .study
        .sessions
        .get_session_history(owner_id, query.limit)
        .await
        .map_err(|e| port_error("load study history", e))?;
    Ok(collect(sessions))
}

//=========================================================================================
// Study Context Handlers
//=========================================================================================

/// Overwrite the owner's current viewing position.
#[utoipa::path(
    put,
    path = "/context",
    request_body = ContextRequest,
    responses(
        (status = 200, description = "The stored context", body = ContextResponse),
        (status = 400, description = "Invalid position"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn put_context_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Json(body): Json<ContextRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let position = ContextPosition {
        page_number: body.page_number,
        timestamp_seconds: body.timestamp_seconds,
        metadata: body.metadata.unwrap_or_else(|| Value::Object(Default::default())),
    };
    let context = app_state
        .study
        .contexts
        .update_context(owner_id, body.resource_id, position)
        .await
        .map_err(|e| port_error("update study context", e))?;
    Ok(Json(ContextResponse::from(context)))
}

#[utoipa::path(
    get,
    path = "/context",
    responses(
        (status = 200, description = "The current context", body = ContextResponse),
        (status = 404, description = "No context recorded"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn get_context_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let context = app_state
        .study
        .contexts
        .get_current_context(owner_id)
        .await
        .map_err(|e| port_error("load study context", e))?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "No study context recorded".to_string()))?;
    Ok(Json(ContextResponse::from(context)))
}

#[utoipa::path(
    delete,
    path = "/context",
    responses(
        (status = 204, description = "Context cleared"),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn clear_context_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
) -> Result<StatusCode, (StatusCode, String)> {
    app_state
        .study
        .contexts
        .clear_context(owner_id)
        .await
        .map_err(|e| port_error("clear study context", e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Seconds since the cached context was last updated.
#[utoipa::path(
    get,
    path = "/context/age",
    responses((status = 200, description = "Context age, null when nothing is cached", body = ElapsedResponse)),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn context_age_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
) -> impl IntoResponse {
    let seconds = app_state
        .study
        .contexts
        .get_context_age(owner_id)
        .await
        .map(|age| age.num_seconds());
    Json(ElapsedResponse { seconds })
}

//=========================================================================================
// Live Lecture Handlers
//=========================================================================================

/// Start a live lecture.
#[utoipa::path(
    post,
    path = "/lectures",
    request_body = CreateLectureRequest,
    responses(
        (status = 201, description = "Lecture started", body = LectureResponse),
        (status = 500, description = "Internal server error")
    ),
    params(("x-user-id" = Uuid, Header, description = "The unique ID of the owner."))
)]
pub async fn create_lecture_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Json(body): Json<CreateLectureRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let title = body.title.unwrap_or_default();
    let lecture = app_state
        .study
        .transcripts
        .create_session(owner_id, &title)
        .await
        .map_err(|e| port_error("start lecture", e))?;
    Ok((StatusCode::CREATED, Json(LectureResponse::from(lecture))))
}

/// The owner's lectures, newest first.
#[utoipa::path(
    get,
    path = "/lectures",
    responses(
        (status = 200, description = "Lectures", body = Vec<LectureResponse>),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        HistoryQuery
    )
)]
pub async fn list_lectures_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<LectureResponse>>, (StatusCode, String)> {
    let lectures = app_state
        .study
        .transcripts
        .get_live_session_history(owner_id, query.limit)
        .await
        .map_err(|e| port_error("list lectures", e))?;
    Ok(collect(lectures))
}

#[utoipa::path(
    get,
    path = "/lectures/{id}",
    responses(
        (status = 200, description = "The lecture", body = LectureResponse),
        (status = 403, description = "The lecture belongs to another owner"),
        (status = 404, description = "Unknown lecture")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        ("id" = Uuid, Path, description = "The lecture id.")
    )
)]
pub async fn get_lecture_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let lecture = app_state
        .study
        .transcripts
        .get_live_session(session_id, owner_id)
        .await
        .map_err(|e| port_error("load lecture", e))?;
    Ok(Json(LectureResponse::from(lecture)))
}

/// Commit one transcript chunk to an active lecture.
#[utoipa::path(
    post,
    path = "/lectures/{id}/transcript",
    request_body = AppendTranscriptRequest,
    responses(
        (status = 201, description = "The committed chunk", body = ChunkResponse),
        (status = 400, description = "Empty text or negative offset"),
        (status = 403, description = "The lecture belongs to another owner"),
        (status = 404, description = "The lecture is unknown or completed"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        ("id" = Uuid, Path, description = "The lecture id.")
    )
)]
pub async fn append_transcript_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
    Json(body): Json<AppendTranscriptRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let chunk = app_state
        .study
        .transcripts
        .append_transcript(session_id, owner_id, &body.text, body.offset_ms, body.is_final)
        .await
        .map_err(|e| port_error("append transcript", e))?;
    Ok((StatusCode::CREATED, Json(ChunkResponse::from(chunk))))
}

/// Chunks that arrived within the rolling window.
#[utoipa::path(
    get,
    path = "/lectures/{id}/buffer",
    responses(
        (status = 200, description = "Recent chunks, oldest first", body = Vec<BufferEntryResponse>),
        (status = 403, description = "The lecture belongs to another owner"),
        (status = 404, description = "Unknown lecture")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        ("id" = Uuid, Path, description = "The lecture id.")
    )
)]
pub async fn rolling_buffer_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<BufferEntryResponse>>, (StatusCode, String)> {
    let transcripts = &app_state.study.transcripts;
    transcripts
        .get_live_session(session_id, owner_id)
        .await
        .map_err(|e| port_error("load lecture", e))?;
    Ok(collect(transcripts.get_rolling_buffer(session_id).await))
}

/// Every committed chunk of a lecture, in sequence order.
#[utoipa::path(
    get,
    path = "/lectures/{id}/transcript",
    responses(
        (status = 200, description = "All committed chunks", body = Vec<ChunkResponse>),
        (status = 403, description = "The lecture belongs to another owner"),
        (status = 404, description = "Unknown lecture"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        ("id" = Uuid, Path, description = "The lecture id.")
    )
)]
pub async fn full_transcript_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<Json<Vec<ChunkResponse>>, (StatusCode, String)> {
    let chunks = app_state
        .study
        .transcripts
        .get_full_transcript(session_id, owner_id)
        .await
        .map_err(|e| port_error("load transcript", e))?;
    Ok(collect(chunks))
}

/// Complete a lecture and discard its rolling buffer.
#[utoipa::path(
    post,
    path = "/lectures/{id}/end",
    responses(
        (status = 200, description = "The completed lecture", body = LectureResponse),
        (status = 403, description = "The lecture belongs to another owner"),
        (status = 404, description = "Unknown or already completed lecture"),
        (status = 500, description = "Internal server error")
    ),
    params(
        ("x-user-id" = Uuid, Header, description = "The unique ID of the owner."),
        ("id" = Uuid, Path, description = "The lecture id.")
    )
)]
pub async fn end_lecture_handler(
    State(app_state): State<Arc<AppState>>,
    Extension(owner_id): Extension<Uuid>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let lecture = app_state
        .study
        .transcripts
        .end_session(session_id, owner_id)
        .await
        .map_err(|e| port_error("end lecture", e))?;
    Ok(Json(LectureResponse::from(lecture)))
}

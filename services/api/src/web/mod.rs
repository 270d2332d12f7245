pub mod middleware;
pub mod rest;
pub mod state;

use axum::{
    middleware as axum_middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;

pub use middleware::require_owner;
pub use state::AppState;

use rest::*;

/// Builds the study-state routes. Every route resolves its owner from the `x-user-id` header.
pub fn router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/study/touch", post(touch_handler))
        .route("/study/start", post(start_study_handler))
        .route("/study/end", post(end_study_handler))
        .route("/study/active", get(active_study_handler))
        .route("/study/duration", get(study_duration_handler))
        .route("/study/history", get(study_history_handler))
        .route(
            "/context",
            put(put_context_handler)
                .get(get_context_handler)
                .delete(clear_context_handler),
        )
        .route("/context/age", get(context_age_handler))
        .route("/lectures", post(create_lecture_handler).get(list_lectures_handler))
        .route("/lectures/{id}", get(get_lecture_handler))
        .route(
            "/lectures/{id}/transcript",
            post(append_transcript_handler).get(full_transcript_handler),
        )
        .route("/lectures/{id}/buffer", get(rolling_buffer_handler))
        .route("/lectures/{id}/end", post(end_lecture_handler))
        .layer(axum_middleware::from_fn(require_owner))
        .with_state(app_state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use serde_json::{json, Value};
    use study_state_core::{InMemoryStore, StateConfig, StudyState, SystemClock};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn app() -> Router {
        let study = StudyState::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(SystemClock),
            StateConfig::default(),
        );
        router(Arc::new(AppState::new(Arc::new(study))))
    }

    async fn call(
        app: &Router,
        method: &str,
        uri: &str,
        owner: Option<Uuid>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(owner) = owner {
            request = request.header(middleware::OWNER_HEADER, owner.to_string());
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn requests_without_an_owner_are_rejected() {
        let app = app();
        let (status, _) = call(&app, "GET", "/study/active", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn touch_reuses_the_open_session_and_end_closes_it() {
        let app = app();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let (status, first) =
            call(&app, "POST", "/study/touch", Some(owner), Some(json!({ "resource_id": resource }))).await;
        assert_eq!(status, StatusCode::OK);
        let (_, second) =
            call(&app, "POST", "/study/touch", Some(owner), Some(json!({ "resource_id": resource }))).await;
        assert_eq!(first["session_id"], second["session_id"]);

        let (status, active) = call(&app, "GET", "/study/active", Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(active["session_id"], first["session_id"]);

        let (status, duration) = call(&app, "GET", "/study/duration", Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(duration["seconds"].is_i64());

        let (status, ended) = call(&app, "POST", "/study/end", Some(owner), Some(json!({}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["session_id"], first["session_id"]);
        assert!(ended["ended_at"].is_string());

        let (status, _) = call(&app, "GET", "/study/active", Some(owner), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "POST", "/study/end", Some(owner), Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, history) = call(&app, "GET", "/study/history?limit=10", Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn nil_resource_is_a_bad_request() {
        let app = app();
        let (status, _) = call(
            &app,
            "POST",
            "/study/touch",
            Some(Uuid::new_v4()),
            Some(json!({ "resource_id": Uuid::nil() })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn context_can_be_set_read_and_cleared() {
        let app = app();
        let owner = Uuid::new_v4();
        let resource = Uuid::new_v4();

        let (status, _) = call(&app, "GET", "/context", Some(owner), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, stored) = call(
            &app,
            "PUT",
            "/context",
            Some(owner),
            Some(json!({ "resource_id": resource, "page_number": 12, "metadata": { "zoom": 2 } })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stored["page_number"], 12);

        let (_, current) = call(&app, "GET", "/context", Some(owner), None).await;
        assert_eq!(current["resource_id"], json!(resource));
        assert_eq!(current["metadata"]["zoom"], 2);

        let (status, age) = call(&app, "GET", "/context/age", Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(age["seconds"].is_i64());

        let (status, _) = call(&app, "DELETE", "/context", Some(owner), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, "GET", "/context", Some(owner), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(
            &app,
            "PUT",
            "/context",
            Some(owner),
            Some(json!({ "resource_id": resource, "page_number": -1 })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn lecture_lifecycle_over_http() {
        let app = app();
        let owner = Uuid::new_v4();

        let (status, lecture) =
            call(&app, "POST", "/lectures", Some(owner), Some(json!({ "title": "Thermodynamics" }))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(lecture["status"], "active");
        let id = lecture["session_id"].as_str().unwrap().to_string();

        for (text, offset) in [("first law", 0), ("energy is conserved", 1500)] {
            let (status, chunk) = call(
                &app,
                "POST",
                &format!("/lectures/{id}/transcript"),
                Some(owner),
                Some(json!({ "text": text, "offset_ms": offset })),
            )
            .await;
            assert_eq!(status, StatusCode::CREATED);
            assert_eq!(chunk["is_final"], true);
        }

        let (_, buffer) = call(&app, "GET", &format!("/lectures/{id}/buffer"), Some(owner), None).await;
        let sequence: Vec<i64> = buffer
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| entry["sequence_number"].as_i64().unwrap())
            .collect();
        assert_eq!(sequence, vec![1, 2]);

        let (_, transcript) =
            call(&app, "GET", &format!("/lectures/{id}/transcript"), Some(owner), None).await;
        assert_eq!(transcript.as_array().map(Vec::len), Some(2));

        let (status, ended) = call(&app, "POST", &format!("/lectures/{id}/end"), Some(owner), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(ended["status"], "completed");
        assert_eq!(ended["word_count"], 5);
        assert_eq!(ended["full_transcript"], "first law energy is conserved");

        let (status, _) = call(&app, "POST", &format!("/lectures/{id}/end"), Some(owner), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(
            &app,
            "POST",
            &format!("/lectures/{id}/transcript"),
            Some(owner),
            Some(json!({ "text": "too late", "offset_ms": 3000 })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, lectures) = call(&app, "GET", "/lectures", Some(owner), None).await;
        assert_eq!(lectures.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn lectures_are_private_to_their_owner() {
        let app = app();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();

        let (_, lecture) = call(&app, "POST", "/lectures", Some(owner), Some(json!({}))).await;
        assert_eq!(lecture["title"], "Untitled lecture");
        let id = lecture["session_id"].as_str().unwrap().to_string();

        let (status, _) = call(&app, "GET", &format!("/lectures/{id}"), Some(stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(
            &app,
            "POST",
            &format!("/lectures/{id}/transcript"),
            Some(stranger),
            Some(json!({ "text": "hello", "offset_ms": 0 })),
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = call(&app, "GET", &format!("/lectures/{id}/buffer"), Some(stranger), None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, _) = call(
            &app,
            "GET",
            &format!("/lectures/{}", Uuid::new_v4()),
            Some(owner),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

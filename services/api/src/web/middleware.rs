//! services/api/src/web/middleware.rs
//!
//! Owner resolution for every study-state route.

use axum::{
    extract::Request,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use tracing::debug;
use uuid::Uuid;

pub const OWNER_HEADER: &str = "x-user-id";

/// Middleware that reads the caller's owner id from the `x-user-id` header.
///
/// If valid, inserts the owner id into request extensions for handlers to use.
/// If missing, malformed or nil, returns 401 Unauthorized.
pub async fn require_owner(mut req: Request, next: Next) -> Result<Response, StatusCode> {
    let owner_id = owner_from_headers(req.headers()).ok_or_else(|| {
        debug!(path = %req.uri().path(), "rejected request without a valid owner header");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(owner_id);
    Ok(next.run(req).await)
}

fn owner_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    let raw = headers.get(OWNER_HEADER)?.to_str().ok()?;
    Uuid::parse_str(raw.trim()).ok().filter(|id| !id.is_nil())
}

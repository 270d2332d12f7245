//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use std::sync::Arc;
use study_state_core::StudyState;

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone)]
pub struct AppState {
    pub study: Arc<StudyState>,
}

impl AppState {
    pub fn new(study: Arc<StudyState>) -> Self {
        Self { study }
    }
}

//! Session cache handlers

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::AppState;

/// Clear session cache response
#[derive(Debug, Serialize)]
pub struct ClearSessionResponse {
    pub session_id: String,
    pub removed: usize,
}

/// Drop every cached answer for a session
pub async fn clear_session_cache(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> Json<ClearSessionResponse> {
    let removed = state.cache.clear_session(&session_id);

    Json(ClearSessionResponse { session_id, removed })
}

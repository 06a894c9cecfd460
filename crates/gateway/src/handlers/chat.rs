//! Chat handlers

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use validator::Validate;

use crate::AppState;
use medassist_common::{
    errors::{AppError, Result},
    types::Source,
};

/// Text chat request
#[derive(Debug, Deserialize, Validate)]
pub struct ChatRequest {
    /// Length limit is enforced by the cache, which knows the configured maximum
    #[validate(length(min = 1))]
    pub query: String,

    #[validate(length(min = 1, max = 128))]
    pub session_id: String,
}

/// Text chat response
#[derive(Debug, Serialize)]
pub struct ChatResponse {
    pub response: String,
    pub sources: Vec<Source>,
    pub confidence: f32,
    pub emergency: bool,
    pub cached: bool,
}

/// Answer a medical question for a session
pub async fn chat_text(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>> {
    let start = Instant::now();

    request.validate().map_err(|e| {
        let field = e.field_errors().keys().next().map(|k| k.to_string());
        AppError::InvalidInput {
            message: e.to_string(),
            field,
        }
    })?;

    let answer = state.cache.ask(&request.query, &request.session_id).await?;

    tracing::info!(
        session_id = %request.session_id,
        cached = answer.cached,
        emergency = answer.emergency,
        sources = answer.sources.len(),
        latency_ms = start.elapsed().as_millis() as u64,
        "Chat answered"
    );

    Ok(Json(ChatResponse {
        response: answer.response_text,
        sources: answer.sources,
        confidence: answer.confidence,
        emergency: answer.emergency,
        cached: answer.cached,
    }))
}

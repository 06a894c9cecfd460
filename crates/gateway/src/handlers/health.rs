//! Health check handlers

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use medassist_common::cache::CacheStats;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Serialize)]
pub struct ReadyResponse {
    pub status: String,
    pub checked_at: DateTime<Utc>,
    pub checks: HealthChecks,
}

#[derive(Serialize)]
pub struct HealthChecks {
    pub cache: CacheStats,
    pub emergency_phrases: usize,
}

/// Liveness probe - always returns healthy if server is running
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: medassist_common::VERSION.to_string(),
    })
}

/// Readiness probe - reports cache state
pub async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ready".to_string(),
        checked_at: Utc::now(),
        checks: HealthChecks {
            cache: state.cache.stats(),
            emergency_phrases: state.cache.emergency_phrases().len(),
        },
    })
}

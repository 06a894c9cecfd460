//! MedAssist Common Library
//!
//! Core of the medical Q&A service:
//! - Coalescing, session-scoped answer cache
//! - Retrieval pipeline (embed, search, generate)
//! - Persona and safety policy
//! - Citation source resolution
//! - Embedder, vector index and generator adapters
//! - Error types, configuration and metrics

pub mod cache;
pub mod config;
pub mod embeddings;
pub mod errors;
pub mod generator;
pub mod metrics;
pub mod persona;
pub mod pipeline;
pub mod sources;
pub mod types;
pub mod vector_index;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;
use tracing::info;

// Re-export commonly used types
pub use cache::{AnswerCache, CacheSettings, CacheStats};
pub use config::AppConfig;
pub use errors::{AppError, Result};
pub use persona::SafetyPolicy;
pub use pipeline::RagPipeline;
pub use types::{Answer, Query, Source};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Wire adapters, pipeline, policy and cache from configuration
pub async fn build_answer_cache(config: &AppConfig) -> Result<Arc<AnswerCache>> {
    config.pipeline.validate()?;

    let embedder = embeddings::create_embedder(&config.embedding)?;
    let index = vector_index::create_vector_index(&config.vector_index, embedder.as_ref()).await?;
    let generator = generator::create_generator(&config.generator)?;

    let pipeline = RagPipeline::new(embedder.clone(), index.clone(), generator.clone())
        .with_top_k(config.pipeline.top_k)
        .with_topic_filter(config.pipeline.topic_filter.clone());

    info!(
        embedder = embedder.model_name(),
        index = index.name(),
        generator = generator.model_name(),
        top_k = pipeline.top_k(),
        "Pipeline adapters ready"
    );

    let policy = SafetyPolicy::new(
        config.pipeline.emergency_phrases.clone(),
        config.pipeline.low_confidence_threshold,
    );

    Ok(Arc::new(AnswerCache::new(
        Arc::new(pipeline),
        policy,
        CacheSettings::from(&config.pipeline),
    )))
}

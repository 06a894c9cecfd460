//! Retrieval-augmented answer pipeline
//!
//! Runs the fixed stage order for one query:
//! 1. Embed the question
//! 2. Search the vector index (top-K, optional topic filter)
//! 3. Generate with persona + context, even when no chunks matched
//! 4. Apply the safety policy
//! 5. Resolve citation sources
//!
//! Every stage is bounded by one shared deadline. Nothing is retried.

use crate::embeddings::Embedder;
use crate::errors::{AppError, Result, Stage};
use crate::generator::{Generator, PromptContext};
use crate::metrics;
use crate::persona::{SafetyPolicy, SYSTEM_PROMPT};
use crate::sources;
use crate::types::{Answer, Query};
use crate::vector_index::VectorIndex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default number of chunks retrieved per query
pub const DEFAULT_TOP_K: usize = 3;

/// Absolute deadline for one pipeline execution
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    /// Deadline `budget` from now
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    fn timeout_error(&self, stage: Stage) -> AppError {
        AppError::Timeout {
            stage,
            timeout_ms: self.budget.as_millis() as u64,
        }
    }

    /// Run one stage, handing the adapter whatever time is left
    async fn run_stage<T, F, Fut>(&self, stage: Stage, call: F) -> Result<T>
    where
        F: FnOnce(Duration) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let remaining = self.remaining();
        if remaining.is_zero() {
            return Err(self.timeout_error(stage));
        }

        let start = Instant::now();
        let result = match tokio::time::timeout_at(self.at, call(remaining)).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error(stage)),
        };

        metrics::record_stage(stage, start.elapsed().as_secs_f64(), result.is_ok());
        if let Err(e) = &result {
            warn!(stage = %stage, error = %e, "Pipeline stage failed");
        }
        result
    }
}

/// The embed → search → generate → policy → sources sequence
pub struct RagPipeline {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    generator: Arc<dyn Generator>,
    top_k: usize,
    topic_filter: Option<String>,
}

impl RagPipeline {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        generator: Arc<dyn Generator>,
    ) -> Self {
        Self {
            embedder,
            index,
            generator,
            top_k: DEFAULT_TOP_K,
            topic_filter: None,
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k.max(1);
        self
    }

    pub fn with_topic_filter(mut self, topic: Option<String>) -> Self {
        self.topic_filter = topic;
        self
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    /// Produce an uncached answer for `query`
    pub async fn run(&self, query: &Query, policy: &SafetyPolicy, deadline: Deadline) -> Result<Answer> {
        let start = Instant::now();

        let vector = deadline
            .run_stage(Stage::Embedding, |t| self.embedder.embed(query.text(), t))
            .await?;
        debug!(dimension = vector.len(), model = self.embedder.model_name(), "Query embedded");

        let chunks = deadline
            .run_stage(Stage::Search, |t| {
                self.index.search(&vector, self.top_k, self.topic_filter.as_deref(), t)
            })
            .await?;
        if chunks.is_empty() {
            warn!(index = self.index.name(), "No matching chunks, generating without context");
        }

        let context = PromptContext {
            persona: SYSTEM_PROMPT.to_string(),
            chunks,
            query: query.text().to_string(),
        };
        let raw = deadline
            .run_stage(Stage::Generation, |t| self.generator.generate(&context, t))
            .await?;

        let outcome = policy.apply(&raw, query.text(), &context.chunks);
        if outcome.emergency {
            warn!(session_id = %query.session_id(), "Emergency indicators detected");
        }

        let answer = Answer {
            response_text: outcome.response_text,
            sources: sources::resolve(&context.chunks),
            confidence: outcome.confidence,
            emergency: outcome.emergency,
            cached: false,
        };

        info!(
            chunks = context.chunks.len(),
            sources = answer.sources.len(),
            confidence = answer.confidence,
            confidence_source = ?outcome.confidence_source,
            emergency = answer.emergency,
            refused = outcome.refused,
            latency_ms = start.elapsed().as_millis() as u64,
            "Pipeline complete"
        );

        Ok(answer)
    }
}

//! Vector index abstraction
//!
//! Provides nearest-neighbour chunk retrieval via:
//! - Pinecone-compatible REST indexes (metadata topic filter)
//! - An in-memory cosine-similarity index for local runs and tests

use crate::config::VectorIndexConfig;
use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::types::RetrievedChunk;
use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Seed documents embedded concurrently
const SEED_CONCURRENCY: usize = 8;

/// Nearest-neighbour search over document chunks
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Return up to `top_k` chunks ordered by descending relevance
    ///
    /// Zero results is a valid answer, not an error.
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        topic_filter: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<RetrievedChunk>>;

    /// Backend name for logs and health output
    fn name(&self) -> &str;
}

/// Pinecone REST client
pub struct PineconeIndex {
    client: reqwest::Client,
    host: String,
    api_key: String,
    namespace: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    vector: &'a [f32],
    top_k: usize,
    include_metadata: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    filter: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    namespace: Option<&'a str>,
}

#[derive(Deserialize)]
struct QueryResponse {
    #[serde(default)]
    matches: Vec<QueryMatch>,
}

#[derive(Deserialize)]
struct QueryMatch {
    score: f32,
    #[serde(default)]
    metadata: Option<MatchMetadata>,
}

#[derive(Deserialize)]
struct MatchMetadata {
    #[serde(default)]
    text: String,
    source_url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    topic: String,
}

impl PineconeIndex {
    pub fn new(host: String, api_key: String, namespace: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            host: host.trim_end_matches('/').to_string(),
            api_key,
            namespace,
        })
    }
}

#[async_trait]
impl VectorIndex for PineconeIndex {
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        topic_filter: Option<&str>,
        timeout: Duration,
    ) -> Result<Vec<RetrievedChunk>> {
        let request = QueryRequest {
            vector,
            top_k,
            include_metadata: true,
            filter: topic_filter.map(|topic| serde_json::json!({ "topic": { "$eq": topic } })),
            namespace: self.namespace.as_deref(),
        };

        let response = self.client
            .post(format!("{}/query", self.host))
            .timeout(timeout)
            .header("Api-Key", &self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Search {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Search {
                message: format!("API error {}: {}", status, body),
            });
        }

        let result: QueryResponse = response.json().await.map_err(|e| AppError::Search {
            message: format!("Failed to parse response: {}", e),
        })?;

        // Matches without metadata cannot be cited and are skipped
        let chunks: Vec<RetrievedChunk> = result
            .matches
            .into_iter()
            .filter_map(|m| {
                m.metadata.map(|meta| RetrievedChunk {
                    text: meta.text,
                    source_url: meta.source_url,
                    title: meta.title,
                    topic: meta.topic,
                    relevance_score: m.score.clamp(0.0, 1.0),
                })
            })
            .collect();

        debug!(matches = chunks.len(), "Pinecone query complete");
        Ok(chunks)
    }

    fn name(&self) -> &str {
        "pinecone"
    }
}

/// Document accepted by the in-memory index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDocument {
    pub text: String,
    pub source_url: String,
    pub title: String,
    pub topic: String,
}

struct IndexedChunk {
    document: IndexDocument,
    embedding: Vec<f32>,
}

/// Brute-force cosine similarity index held in memory
#[derive(Default)]
pub struct InMemoryIndex {
    chunks: RwLock<Vec<IndexedChunk>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one document with a precomputed embedding
    pub fn insert(&self, document: IndexDocument, embedding: Vec<f32>) -> Result<()> {
        let mut chunks = self.chunks.write().map_err(|_| AppError::Internal {
            message: "In-memory index lock poisoned".to_string(),
        })?;
        chunks.push(IndexedChunk { document, embedding });
        Ok(())
    }

    /// Embed and insert a batch of documents
    pub async fn index_documents(
        &self,
        embedder: &dyn Embedder,
        documents: Vec<IndexDocument>,
        timeout: Duration,
    ) -> Result<usize> {
        let embedded: Vec<(IndexDocument, Vec<f32>)> = stream::iter(documents)
            .map(|document| async move {
                let embedding = embedder.embed(&document.text, timeout).await?;
                Ok::<_, AppError>((document, embedding))
            })
            .buffered(SEED_CONCURRENCY)
            .try_collect()
            .await?;

        let count = embedded.len();
        for (document, embedding) in embedded {
            self.insert(document, embedding)?;
        }
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn search(
        &self,
        vector: &[f32],
        top_k: usize,
        topic_filter: Option<&str>,
        _timeout: Duration,
    ) -> Result<Vec<RetrievedChunk>> {
        let chunks = self.chunks.read().map_err(|_| AppError::Search {
            message: "In-memory index lock poisoned".to_string(),
        })?;

        let mut scored: Vec<RetrievedChunk> = chunks
            .iter()
            .filter(|c| topic_filter.map_or(true, |topic| c.document.topic == topic))
            .map(|c| RetrievedChunk {
                text: c.document.text.clone(),
                source_url: c.document.source_url.clone(),
                title: c.document.title.clone(),
                topic: c.document.topic.clone(),
                relevance_score: cosine_similarity(vector, &c.embedding).clamp(0.0, 1.0),
            })
            .collect();

        scored.sort_by(|a, b| b.relevance_score.total_cmp(&a.relevance_score));
        scored.truncate(top_k);
        Ok(scored)
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Create a vector index based on configuration
///
/// The memory provider is seeded from `seed_path` (a JSON array of
/// documents) when one is configured.
pub async fn create_vector_index(
    config: &VectorIndexConfig,
    embedder: &dyn Embedder,
) -> Result<Arc<dyn VectorIndex>> {
    match config.provider.as_str() {
        "pinecone" => {
            let host = config.host.clone().ok_or_else(|| AppError::Configuration {
                message: "vector_index.host is required for the pinecone provider".to_string(),
            })?;
            let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
                message: "vector_index.api_key is required for the pinecone provider".to_string(),
            })?;
            Ok(Arc::new(PineconeIndex::new(host, api_key, config.namespace.clone())?))
        }
        "memory" => {
            let index = InMemoryIndex::new();
            if let Some(path) = &config.seed_path {
                let raw = tokio::fs::read_to_string(path).await.map_err(|e| AppError::Configuration {
                    message: format!("Failed to read seed file '{}': {}", path, e),
                })?;
                let documents: Vec<IndexDocument> = serde_json::from_str(&raw)?;
                let count = index
                    .index_documents(embedder, documents, Duration::from_secs(30))
                    .await?;
                info!(documents = count, path = %path, "Seeded in-memory vector index");
            }
            Ok(Arc::new(index))
        }
        other => Err(AppError::Configuration {
            message: format!("Unknown vector index provider '{}'", other),
        }),
    }
}

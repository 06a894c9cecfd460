//! Scripted adapters for unit tests

use crate::embeddings::Embedder;
use crate::errors::{AppError, Result};
use crate::generator::{Generator, GeneratorOutput, PromptContext};
use crate::types::RetrievedChunk;
use crate::vector_index::VectorIndex;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub fn chunk(url: &str, score: f32) -> RetrievedChunk {
    RetrievedChunk {
        text: format!("Medical information from {}.", url),
        source_url: url.to_string(),
        title: format!("Page at {}", url),
        topic: "diabetes".to_string(),
        relevance_score: score,
    }
}

#[derive(Default)]
pub struct FakeEmbedder {
    calls: AtomicUsize,
    fail_with: Option<String>,
}

impl FakeEmbedder {
    pub fn failing(message: &str) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_with: Some(message.to_string()),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed(&self, _text: &str, _timeout: Duration) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(AppError::Embedding { message: message.clone() }),
            None => Ok(vec![0.5; 4]),
        }
    }

    fn model_name(&self) -> &str {
        "fake"
    }

    fn dimension(&self) -> usize {
        4
    }
}

pub struct FakeIndex {
    chunks: Vec<RetrievedChunk>,
    fail_with: Option<String>,
    calls: AtomicUsize,
    last_request: Mutex<Option<(usize, Option<String>)>>,
}

impl FakeIndex {
    pub fn returning(chunks: Vec<RetrievedChunk>) -> Self {
        Self {
            chunks,
            fail_with: None,
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::returning(vec![])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<(usize, Option<String>)> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl VectorIndex for FakeIndex {
    async fn search(
        &self,
        _vector: &[f32],
        top_k: usize,
        topic_filter: Option<&str>,
        _timeout: Duration,
    ) -> Result<Vec<RetrievedChunk>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some((top_k, topic_filter.map(str::to_string)));
        match &self.fail_with {
            Some(message) => Err(AppError::Search { message: message.clone() }),
            None => Ok(self.chunks.iter().take(top_k).cloned().collect()),
        }
    }

    fn name(&self) -> &str {
        "fake"
    }
}

pub struct FakeGenerator {
    reply: GeneratorOutput,
    fail_with: Option<String>,
    panics: bool,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    last_chunk_count: Mutex<Option<usize>>,
}

impl FakeGenerator {
    pub fn replying(reply: GeneratorOutput) -> Self {
        Self {
            reply,
            fail_with: None,
            panics: false,
            delay: Mutex::new(Duration::ZERO),
            calls: AtomicUsize::new(0),
            last_chunk_count: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::replying(GeneratorOutput::default())
        }
    }

    /// Panics instead of answering, like a crashing adapter
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Self::replying(GeneratorOutput::default())
        }
    }

    /// Sleep (on the tokio clock) before answering
    pub fn with_delay(self, delay: Duration) -> Self {
        self.set_delay(delay);
        self
    }

    /// Change the delay for subsequent calls
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_chunk_count(&self) -> Option<usize> {
        *self.last_chunk_count.lock().unwrap()
    }
}

#[async_trait]
impl Generator for FakeGenerator {
    async fn generate(&self, context: &PromptContext, _timeout: Duration) -> Result<GeneratorOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_chunk_count.lock().unwrap() = Some(context.chunks.len());
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.panics {
            panic!("generator crashed");
        }
        match &self.fail_with {
            Some(message) => Err(AppError::Generation { message: message.clone() }),
            None => Ok(self.reply.clone()),
        }
    }

    fn model_name(&self) -> &str {
        "fake"
    }
}

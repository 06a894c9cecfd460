//! Answer generation
//!
//! Provides:
//! - Prompt assembly from persona rules, retrieved chunks, and the question
//! - An OpenAI-compatible chat-completions client (Groq, OpenAI, vLLM, ...)
//! - An offline extractive generator for local runs
//! - Strict parsing of the structured `{answer, confidence, reasoning}` reply

use crate::config::GeneratorConfig;
use crate::errors::{AppError, Result};
use crate::types::RetrievedChunk;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Sentinel the model is told to emit for questions outside medicine
pub const OUT_OF_SCOPE_SENTINEL: &str = "OUT_OF_SCOPE";

/// Everything the generator sees for one question
#[derive(Debug, Clone)]
pub struct PromptContext {
    /// System persona and safety rules
    pub persona: String,

    /// Retrieved context, possibly empty
    pub chunks: Vec<RetrievedChunk>,

    /// The user's question
    pub query: String,
}

impl PromptContext {
    /// Numbered context block, one entry per chunk
    pub fn render_context(&self) -> String {
        if self.chunks.is_empty() {
            return "(no matching documents were found)".to_string();
        }

        self.chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| {
                format!(
                    "[Source {}: {}]\n{}\n(Source: {})\n",
                    i + 1,
                    chunk.title,
                    chunk.text,
                    chunk.source_url
                )
            })
            .collect::<Vec<_>>()
            .join("\n---\n")
    }

    /// User message sent alongside the persona
    pub fn render_user_prompt(&self) -> String {
        format!(
            "Context from medical sources:\n{context}\n\n\
            Question: {question}\n\n\
            Instructions:\n\
            1. Answer using only the context above and explain concepts clearly.\n\
            2. Never diagnose the user and never recommend specific medication doses.\n\
            3. If the question is not about health or medicine, set \"answer\" to \"{sentinel}\".\n\
            4. Reply with a single JSON object: \
            {{\"answer\": string, \"confidence\": number between 0 and 1, \"reasoning\": string}}.\n",
            context = self.render_context(),
            question = self.query,
            sentinel = OUT_OF_SCOPE_SENTINEL,
        )
    }
}

/// Generator reply after parsing
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeneratorOutput {
    /// Answer text
    pub text: String,

    /// Model's self-reported confidence, when it sent a number
    pub confidence_hint: Option<f32>,

    /// Model's reasoning notes, scanned for emergency indicators
    pub reasoning: Option<String>,
}

impl GeneratorOutput {
    /// Plain text reply with no structured fields
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

#[derive(Deserialize)]
struct StructuredReply {
    answer: String,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
    #[serde(default)]
    reasoning: Option<String>,
}

/// Parse a model reply into a [`GeneratorOutput`]
///
/// A well-formed JSON object (optionally fenced in a markdown code block)
/// yields its fields; anything else is treated as plain answer text with no
/// confidence hint. A confidence that is not a JSON number is dropped.
pub fn parse_reply(raw: &str) -> GeneratorOutput {
    let trimmed = raw.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .map(str::trim)
        .unwrap_or(trimmed);

    match serde_json::from_str::<StructuredReply>(body) {
        Ok(reply) if !reply.answer.trim().is_empty() => GeneratorOutput {
            text: reply.answer,
            confidence_hint: reply
                .confidence
                .as_ref()
                .and_then(serde_json::Value::as_f64)
                .map(|c| c as f32),
            reasoning: reply.reasoning.filter(|r| !r.trim().is_empty()),
        },
        _ => GeneratorOutput::text(trimmed),
    }
}

/// Produces an answer for a prompt context
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, context: &PromptContext, timeout: Duration) -> Result<GeneratorOutput>;

    /// Model name for logs
    fn model_name(&self) -> &str;
}

/// OpenAI-compatible chat-completions client
pub struct ChatCompletionsGenerator {
    config: GeneratorConfig,
    api_key: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: usize,
    temperature: f32,
    response_format: ResponseFormat,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

impl ChatCompletionsGenerator {
    /// Create a new generator client
    pub fn new(config: GeneratorConfig) -> Result<Self> {
        let api_key = config.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "generator.api_key is required for the openai provider".to_string(),
        })?;

        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::Configuration {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self { config, api_key, client })
    }
}

#[async_trait]
impl Generator for ChatCompletionsGenerator {
    async fn generate(&self, context: &PromptContext, timeout: Duration) -> Result<GeneratorOutput> {
        let user_prompt = context.render_user_prompt();

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage { role: "system", content: &context.persona },
                ChatMessage { role: "user", content: &user_prompt },
            ],
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            response_format: ResponseFormat { kind: "json_object" },
        };

        let response = self.client
            .post(&self.config.endpoint)
            .timeout(timeout)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| AppError::Generation {
                message: format!("Request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Generation {
                message: format!("API error {}: {}", status, body),
            });
        }

        let chat_response: ChatResponse = response.json().await
            .map_err(|e| AppError::Generation {
                message: format!("Failed to parse LLM response: {}", e),
            })?;

        let content = chat_response.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.trim().is_empty())
            .ok_or_else(|| AppError::Generation {
                message: "Empty response from LLM".to_string(),
            })?;

        Ok(parse_reply(&content))
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }
}

/// Extractive generator that needs no model
///
/// Quotes the leading sentence of each retrieved chunk with a source marker.
/// It never reports a confidence, so answers always take the
/// retrieval-score confidence path.
pub struct OfflineGenerator;

impl OfflineGenerator {
    const NO_CONTEXT_REPLY: &'static str =
        "I don't have specific information about that topic in my current knowledge base. \
        Please try rephrasing your question, or consult a healthcare professional.";

    fn lead_sentence(text: &str) -> &str {
        let text = text.trim();
        match text.find(". ") {
            Some(end) => &text[..=end],
            None => text,
        }
    }
}

#[async_trait]
impl Generator for OfflineGenerator {
    async fn generate(&self, context: &PromptContext, _timeout: Duration) -> Result<GeneratorOutput> {
        if context.chunks.is_empty() {
            return Ok(GeneratorOutput::text(Self::NO_CONTEXT_REPLY));
        }

        let body = context
            .chunks
            .iter()
            .enumerate()
            .map(|(i, chunk)| format!("{} [{}]", Self::lead_sentence(&chunk.text), i + 1))
            .collect::<Vec<_>>()
            .join(" ");

        Ok(GeneratorOutput::text(format!(
            "Here is what my medical sources say about this: {}",
            body
        )))
    }

    fn model_name(&self) -> &str {
        "offline-extractive"
    }
}

/// Create a generator based on configuration
pub fn create_generator(config: &GeneratorConfig) -> Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "openai" | "groq" => Ok(Arc::new(ChatCompletionsGenerator::new(config.clone())?)),
        "offline" => Ok(Arc::new(OfflineGenerator)),
        other => Err(AppError::Configuration {
            message: format!("Unknown generator provider '{}'", other),
        }),
    }
}

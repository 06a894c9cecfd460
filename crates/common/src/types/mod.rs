//! Core value types shared by every pipeline stage
//!
//! All of these are immutable once constructed and cheap to share between
//! the callers attached to one pipeline execution.

use crate::errors::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum query length accepted by default (characters)
pub const MAX_QUERY_CHARS: usize = 500;

/// A validated user question scoped to a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    text: String,
    session_id: String,
}

impl Query {
    /// Validate and build a query using the default length limit
    pub fn new(text: impl Into<String>, session_id: impl Into<String>) -> Result<Self> {
        Self::with_limit(text, session_id, MAX_QUERY_CHARS)
    }

    /// Validate and build a query with a custom length limit
    ///
    /// Text is rejected when it is empty after trimming, or longer than
    /// `max_chars` characters.
    pub fn with_limit(
        text: impl Into<String>,
        session_id: impl Into<String>,
        max_chars: usize,
    ) -> Result<Self> {
        let text = text.into();
        let trimmed = text.trim();

        if trimmed.is_empty() {
            return Err(AppError::invalid("query", "query must not be empty"));
        }

        let length = trimmed.chars().count();
        if length > max_chars {
            return Err(AppError::QueryTooLong { length, limit: max_chars });
        }

        Ok(Self {
            text: trimmed.to_string(),
            session_id: session_id.into(),
        })
    }

    /// Query text, trimmed but otherwise as submitted
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Lowercased text with whitespace runs collapsed to single spaces
    pub fn normalized(&self) -> String {
        normalize(&self.text)
    }
}

/// Lowercase, trim, and collapse internal whitespace
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Session-scoped cache key
///
/// Hex SHA-256 over the length-prefixed normalized text followed by the
/// session id, so no text/session pair can alias another.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(String);

impl CacheKey {
    /// Key prefix used for namespacing
    pub const PREFIX: &'static str = "chat";

    pub fn derive(query: &Query) -> Self {
        let normalized = query.normalized();
        let mut hasher = Sha256::new();
        hasher.update((normalized.len() as u64).to_le_bytes());
        hasher.update(normalized.as_bytes());
        hasher.update(query.session_id().as_bytes());
        CacheKey(format!("{}:{}", Self::PREFIX, hex::encode(hasher.finalize())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Chunk returned by the vector index for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievedChunk {
    /// Chunk content
    pub text: String,

    /// Page the chunk was scraped from
    pub source_url: String,

    /// Document title
    pub title: String,

    /// Topic label (e.g. "diabetes")
    pub topic: String,

    /// Similarity to the query (0.0 - 1.0)
    pub relevance_score: f32,
}

/// Citation attached to an answer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub relevance_score: f32,
}

/// Final answer; the unit stored in and served from the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    pub response_text: String,
    pub sources: Vec<Source>,
    pub confidence: f32,
    pub emergency: bool,
    pub cached: bool,
}

impl Answer {
    /// Copy of this answer marked as served from cache
    pub fn as_cached(&self) -> Self {
        Self {
            cached: true,
            ..self.clone()
        }
    }

    /// True when both answers carry the same content, ignoring the cached flag
    pub fn same_content(&self, other: &Answer) -> bool {
        self.response_text == other.response_text
            && self.sources == other.sources
            && self.confidence == other.confidence
            && self.emergency == other.emergency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_query_rejected() {
        let err = Query::new("   \n\t ", "s1").unwrap_err();
        assert!(matches!(err, AppError::InvalidInput { .. }));
    }

    #[test]
    fn test_oversized_query_rejected() {
        let err = Query::new("a".repeat(501), "s1").unwrap_err();
        assert_eq!(err, AppError::QueryTooLong { length: 501, limit: 500 });
        assert!(Query::new("a".repeat(500), "s1").is_ok());
    }

    #[test]
    fn test_limit_counts_characters_not_bytes() {
        assert!(Query::with_limit("é".repeat(10), "s1", 10).is_ok());
    }

    #[test]
    fn test_key_ignores_case_and_whitespace() {
        let a = Query::new("What are symptoms of diabetes?", "s1").unwrap();
        let b = Query::new("  what ARE   symptoms of\tdiabetes?  ", "s1").unwrap();
        assert_eq!(CacheKey::derive(&a), CacheKey::derive(&b));
    }

    #[test]
    fn test_key_is_session_scoped() {
        let a = Query::new("t", "A").unwrap();
        let b = Query::new("t", "B").unwrap();
        assert_ne!(CacheKey::derive(&a), CacheKey::derive(&b));
    }

    #[test]
    fn test_key_text_session_boundary() {
        let a = Query::new("flu:a", "b").unwrap();
        let b = Query::new("flu", "a:b").unwrap();
        assert_ne!(CacheKey::derive(&a), CacheKey::derive(&b));
    }

    #[test]
    fn test_key_format() {
        let key = CacheKey::derive(&Query::new("hello", "s").unwrap());
        assert!(key.as_str().starts_with("chat:"));
        assert_eq!(key.as_str().len(), "chat:".len() + 64);
    }

    #[test]
    fn test_as_cached_keeps_content() {
        let answer = Answer {
            response_text: "text".into(),
            sources: vec![],
            confidence: 0.8,
            emergency: false,
            cached: false,
        };
        let cached = answer.as_cached();
        assert!(cached.cached);
        assert!(cached.same_content(&answer));
    }
}

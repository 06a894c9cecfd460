//! Error types for MedAssist
//!
//! Provides a comprehensive error handling system with:
//! - Distinct error types for each pipeline failure mode
//! - HTTP status code mapping
//! - Structured error responses
//! - Error codes for client handling
//!
//! Every variant carries owned, cloneable data so a single pipeline failure
//! can be handed to every caller waiting on the same execution.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    InvalidInput,
    QueryTooLong,

    // Upstream errors (8xxx)
    EmbeddingError,
    SearchError,
    GenerationError,
    Timeout,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            // Validation (1xxx)
            ErrorCode::InvalidInput => 1001,
            ErrorCode::QueryTooLong => 1004,

            // Upstream (8xxx)
            ErrorCode::EmbeddingError => 8002,
            ErrorCode::SearchError => 8003,
            ErrorCode::GenerationError => 8004,
            ErrorCode::Timeout => 8005,

            // Internal (9xxx)
            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_code())
    }
}

/// Pipeline stage that an upstream error or timeout is attributed to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Embedding,
    Search,
    Generation,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Embedding => "embedding",
            Stage::Search => "search",
            Stage::Generation => "generation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Application error types
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    // Caller mistakes
    #[error("Invalid input: {message}")]
    InvalidInput {
        message: String,
        field: Option<String>
    },

    #[error("Query too long: {length} characters exceeds limit of {limit}")]
    QueryTooLong { length: usize, limit: usize },

    // Upstream dependency failures
    #[error("Embedding service error: {message}")]
    Embedding { message: String },

    #[error("Vector search error: {message}")]
    Search { message: String },

    #[error("Generation error: {message}")]
    Generation { message: String },

    #[error("Pipeline deadline of {timeout_ms}ms exceeded during {stage}")]
    Timeout { stage: Stage, timeout_ms: u64 },

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl AppError {
    /// Shorthand for an invalid-input error on a named field
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        AppError::InvalidInput {
            message: message.into(),
            field: Some(field.to_string()),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::InvalidInput { .. } => ErrorCode::InvalidInput,
            AppError::QueryTooLong { .. } => ErrorCode::QueryTooLong,
            AppError::Embedding { .. } => ErrorCode::EmbeddingError,
            AppError::Search { .. } => ErrorCode::SearchError,
            AppError::Generation { .. } => ErrorCode::GenerationError,
            AppError::Timeout { .. } => ErrorCode::Timeout,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization { .. } => ErrorCode::SerializationError,
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::InvalidInput { .. } => StatusCode::BAD_REQUEST,

            // 413 Payload Too Large
            AppError::QueryTooLong { .. } => StatusCode::PAYLOAD_TOO_LARGE,

            // 500 Internal Server Error
            AppError::Internal { .. } |
            AppError::Configuration { .. } |
            AppError::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,

            // 502 Bad Gateway
            AppError::Embedding { .. } |
            AppError::Search { .. } |
            AppError::Generation { .. } => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Upstream failures are safe for the caller to retry later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Embedding { .. }
                | AppError::Search { .. }
                | AppError::Generation { .. }
                | AppError::Timeout { .. }
        )
    }

    /// Check if this error should be logged at error level
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Check if this error is a client error
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }
}

/// Structured error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let code = self.code();
        let message = self.to_string();

        // Log based on severity
        if self.is_server_error() {
            tracing::error!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Server error"
            );
        } else if self.is_client_error() {
            tracing::warn!(
                error = %message,
                code = ?code,
                status = status.as_u16(),
                "Client error"
            );
        }

        let field = match &self {
            AppError::InvalidInput { field, .. } => field.clone(),
            AppError::QueryTooLong { .. } => Some("query".to_string()),
            _ => None,
        };

        let body = ErrorResponse {
            error: ErrorDetails {
                code,
                message,
                retryable: self.is_retryable(),
                field,
            },
        };

        (status, Json(body)).into_response()
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization {
            message: err.to_string()
        }
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Configuration {
            message: err.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_mapping() {
        let err = AppError::Search { message: "index unavailable".into() };
        assert_eq!(err.code(), ErrorCode::SearchError);
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_invalid_input_error() {
        let err = AppError::invalid("query", "must not be empty");
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert!(!err.is_server_error());
        assert!(err.is_client_error());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_error() {
        let err = AppError::Timeout { stage: Stage::Generation, timeout_ms: 2500 };
        assert_eq!(err.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(err.code().as_code(), 8005);
        assert!(err.to_string().contains("generation"));
    }

    #[test]
    fn test_errors_clone_equal() {
        let err = AppError::Generation { message: "model overloaded".into() };
        assert_eq!(err.clone(), err);
    }
}

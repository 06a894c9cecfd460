//! Configuration management for MedAssist services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Answer pipeline and cache configuration
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Embedding service configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Vector index configuration
    #[serde(default)]
    pub vector_index: VectorIndexConfig,

    /// Generator (LLM) configuration
    #[serde(default)]
    pub generator: GeneratorConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Lifetime of a cached answer in seconds
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Number of chunks requested from the vector index
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Overall deadline for one pipeline execution in milliseconds
    #[serde(default = "default_pipeline_timeout")]
    pub pipeline_timeout_ms: u64,

    /// Restrict retrieval to one topic (e.g. "diabetes")
    #[serde(default)]
    pub topic_filter: Option<String>,

    /// Maximum accepted query length in characters
    #[serde(default = "default_max_query_chars")]
    pub max_query_chars: usize,

    /// Interval for the expired-entry sweeper (0 disables it)
    #[serde(default)]
    pub sweep_interval_secs: u64,

    /// Answers below this confidence carry a limited-information disclaimer
    #[serde(default = "default_low_confidence_threshold")]
    pub low_confidence_threshold: f32,

    /// Phrases that flag a query as a potential emergency
    #[serde(default = "default_emergency_phrases")]
    pub emergency_phrases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hashed
    #[serde(default = "default_embedding_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct VectorIndexConfig {
    /// Vector index provider: pinecone, memory
    #[serde(default = "default_index_provider")]
    pub provider: String,

    /// Index host URL (https://<index>-<project>.svc.<env>.pinecone.io)
    pub host: Option<String>,

    /// API key for the index service
    pub api_key: Option<String>,

    /// Namespace inside the index
    #[serde(default)]
    pub namespace: Option<String>,

    /// JSON document file loaded into the memory provider at startup
    #[serde(default)]
    pub seed_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneratorConfig {
    /// Generator provider: openai (any chat-completions compatible API), offline
    #[serde(default = "default_generator_provider")]
    pub provider: String,

    /// API key
    pub api_key: Option<String>,

    /// Chat completions endpoint
    #[serde(default = "default_generator_endpoint")]
    pub endpoint: String,

    /// Model name
    #[serde(default = "default_generator_model")]
    pub model: String,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Maximum output tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for tracing
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8000 }
fn default_request_timeout() -> u64 { 30 }
fn default_ttl() -> u64 { 3600 }
fn default_top_k() -> usize { 3 }
fn default_pipeline_timeout() -> u64 { 10_000 }
fn default_max_query_chars() -> usize { 500 }
fn default_low_confidence_threshold() -> f32 { 0.5 }
fn default_embedding_provider() -> String { "hashed".to_string() }
fn default_embedding_model() -> String { "text-embedding-3-small".to_string() }
fn default_embedding_dimension() -> usize { 384 }
fn default_index_provider() -> String { "memory".to_string() }
fn default_generator_provider() -> String { "offline".to_string() }
fn default_generator_endpoint() -> String { "https://api.groq.com/openai/v1/chat/completions".to_string() }
fn default_generator_model() -> String { "llama-3.3-70b-versatile".to_string() }
fn default_temperature() -> f32 { 0.8 }
fn default_max_tokens() -> usize { 2048 }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "medassist".to_string() }

/// Built-in emergency phrase list
pub fn default_emergency_phrases() -> Vec<String> {
    [
        "chest pain",
        "heart attack",
        "stroke",
        "can't breathe",
        "cannot breathe",
        "severe bleeding",
        "unconscious",
        "suicide",
        "suicidal",
        "kill myself",
        "overdose",
        "severe pain",
        "emergency",
        "dying",
    ]
    .iter()
    .map(|p| p.to_string())
    .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            top_k: default_top_k(),
            pipeline_timeout_ms: default_pipeline_timeout(),
            topic_filter: None,
            max_query_chars: default_max_query_chars(),
            sweep_interval_secs: 0,
            low_confidence_threshold: default_low_confidence_threshold(),
            emergency_phrases: default_emergency_phrases(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_embedding_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
        }
    }
}

impl Default for VectorIndexConfig {
    fn default() -> Self {
        Self {
            provider: default_index_provider(),
            host: None,
            api_key: None,
            namespace: None,
            seed_path: None,
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            provider: default_generator_provider(),
            api_key: None,
            endpoint: default_generator_endpoint(),
            model: default_generator_model(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl PipelineConfig {
    /// Cache entry lifetime as Duration
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    /// Pipeline deadline as Duration
    pub fn pipeline_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_timeout_ms)
    }

    /// Sweeper interval, `None` when disabled
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.top_k == 0 {
            return Err(ConfigError::Message("pipeline.top_k must be at least 1".into()));
        }
        if self.pipeline_timeout_ms == 0 {
            return Err(ConfigError::Message("pipeline.pipeline_timeout_ms must be positive".into()));
        }
        if self.max_query_chars == 0 {
            return Err(ConfigError::Message("pipeline.max_query_chars must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.low_confidence_threshold) {
            return Err(ConfigError::Message(
                "pipeline.low_confidence_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

/// Environment variables with the APP__ prefix, e.g. APP__PIPELINE__TOP_K=5
fn env_source() -> Environment {
    Environment::with_prefix("APP")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("pipeline.emergency_phrases")
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            .add_source(env_source())
            .build()?;

        Self::finish(config)
    }

    /// Load from a specific file, still honoring `APP__*` overrides
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(env_source())
            .build()?;

        Self::finish(config)
    }

    fn finish(config: Config) -> Result<Self, ConfigError> {
        let config: Self = config.try_deserialize()?;
        config.pipeline.validate()?;
        Ok(config)
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            pipeline: PipelineConfig::default(),
            embedding: EmbeddingConfig::default(),
            vector_index: VectorIndexConfig::default(),
            generator: GeneratorConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.pipeline.ttl_secs, 3600);
        assert_eq!(config.pipeline.top_k, 3);
        assert_eq!(config.pipeline.max_query_chars, 500);
        assert!(config.pipeline.sweep_interval().is_none());
        assert!(config.pipeline.validate().is_ok());
    }

    #[test]
    fn test_default_emergency_phrases() {
        let phrases = default_emergency_phrases();
        assert!(phrases.iter().any(|p| p == "chest pain"));
        assert!(phrases.iter().any(|p| p == "severe bleeding"));
    }

    #[test]
    fn test_invalid_pipeline_settings() {
        let mut pipeline = PipelineConfig::default();
        pipeline.top_k = 0;
        assert!(pipeline.validate().is_err());

        let mut pipeline = PipelineConfig::default();
        pipeline.low_confidence_threshold = 1.5;
        assert!(pipeline.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = Config::builder()
            .add_source(File::from_str(
                "[pipeline]\nttl_secs = 60\ntop_k = 5\n",
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.ttl(), Duration::from_secs(60));
        assert_eq!(config.pipeline.top_k, 5);
        assert_eq!(config.pipeline.pipeline_timeout_ms, 10_000);
        assert_eq!(config.server.port, 8000);
    }

    #[test]
    fn test_from_file_applies_validation() {
        let dir = std::env::temp_dir().join(format!("medassist-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let good = dir.join("good.toml");
        std::fs::write(&good, "[pipeline]\ntop_k = 4\n").unwrap();
        let config = AppConfig::from_file(good.to_str().unwrap()).unwrap();
        assert_eq!(config.pipeline.top_k, 4);

        let bad = dir.join("bad.toml");
        std::fs::write(&bad, "[pipeline]\ntop_k = 0\n").unwrap();
        assert!(AppConfig::from_file(bad.to_str().unwrap()).is_err());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_env_emergency_phrases_parse_as_list() {
        let vars = config::Map::from([(
            "APP__PIPELINE__EMERGENCY_PHRASES".to_string(),
            "chest pain,stroke".to_string(),
        )]);
        let config: AppConfig = Config::builder()
            .add_source(env_source().source(Some(vars)))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.pipeline.emergency_phrases, vec!["chest pain", "stroke"]);
    }
}

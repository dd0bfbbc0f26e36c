//! Configuration management for Lodestar
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values
//!
//! Every pipeline component has its own section so that engines can be
//! constructed programmatically (tests, embedding in other services)
//! without touching the environment.

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Reranker and language-model endpoints
    #[serde(default)]
    pub providers: ProvidersConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub retrieval: RetrievalConfig,

    #[serde(default)]
    pub evidence: EvidenceConfig,

    #[serde(default)]
    pub reasoning: ReasoningConfig,

    #[serde(default)]
    pub corag: CoragConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    /// Concurrency limits, stage timeouts and retry policy
    #[serde(default)]
    pub resilience: ResilienceConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Maximum concurrent HTTP requests
    pub max_concurrent_requests: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
            max_concurrent_requests: 100,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, hashing
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    pub model: String,

    /// Embedding dimension
    pub dimension: usize,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Batch size for embedding requests
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            api_key: None,
            api_base: None,
            model: "text-embedding-3-small".to_string(),
            dimension: 384,
            timeout_secs: 30,
            batch_size: 32,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub reranker: RerankerConfig,

    #[serde(default)]
    pub llm: LlmConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RerankerConfig {
    /// Reranker provider: http, lexical, none
    pub provider: String,

    /// Cross-encoder endpoint accepting `{query, documents}`
    pub endpoint: Option<String>,

    pub api_key: Option<String>,

    pub model: Option<String>,

    pub timeout_secs: u64,
}

impl Default for RerankerConfig {
    fn default() -> Self {
        Self {
            provider: "lexical".to_string(),
            endpoint: None,
            api_key: None,
            model: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Language model provider: openai, none
    pub provider: String,

    pub api_base: Option<String>,

    pub api_key: Option<String>,

    pub model: String,

    pub temperature: f32,

    pub max_tokens: u32,

    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "none".to_string(),
            api_base: None,
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            temperature: 0.1,
            max_tokens: 512,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChunkingConfig {
    /// Chunks scoring below this are dropped before indexing
    pub quality_threshold: f32,

    /// Lines per code window
    pub code_window_lines: usize,

    /// Lines shared between consecutive code windows
    pub code_overlap_lines: usize,

    /// Upper bound for prose chunks, in characters
    pub max_chunk_chars: usize,

    /// Prose chunks shorter than this are merged with their neighbour
    pub min_chunk_chars: usize,

    /// Adjacent-sentence similarity below which prose is split
    pub semantic_break_threshold: f32,

    /// Data rows per table chunk (header is repeated)
    pub table_rows_per_chunk: usize,

    /// Items per list chunk
    pub list_items_per_chunk: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            quality_threshold: 0.6,
            code_window_lines: 40,
            code_overlap_lines: 5,
            max_chunk_chars: 1200,
            min_chunk_chars: 60,
            semantic_break_threshold: 0.05,
            table_rows_per_chunk: 20,
            list_items_per_chunk: 12,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Documents kept by the document-level filter
    pub document_top_k: usize,

    /// Sections kept by the section-level match
    pub section_top_k: usize,

    /// Sentences extracted per chunk hit (top_k * multiplier)
    pub sentence_multiplier: usize,

    /// Minimum document/section score to count as a match
    pub min_level_score: f32,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            document_top_k: 50,
            section_top_k: 20,
            sentence_multiplier: 3,
            min_level_score: 0.15,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Final number of candidates handed to evidence extraction
    pub top_k: usize,

    /// Chunk hits drawn from the hierarchical funnel for hybrid ranking
    pub candidate_pool: usize,

    /// Run dense and sparse rankings and fuse them (else dense only)
    pub hybrid_enabled: bool,

    /// RRF constant
    pub rrf_k: f32,

    pub dense_weight: f32,

    pub sparse_weight: f32,

    pub bm25_k1: f32,

    pub bm25_b: f32,

    pub expansion_enabled: bool,

    /// Fused candidates whose references are followed
    pub expansion_top_n: usize,

    pub max_depth: usize,

    /// Score multiplier per hop, in (0, 1)
    pub hop_decay: f32,

    /// Upper bound on candidates added by expansion
    pub max_expanded: usize,

    pub rerank_enabled: bool,

    /// Candidates rescored by the cross-encoder
    pub rerank_top_m: usize,

    pub late_interaction_enabled: bool,

    /// Reranker top-K rescored by late interaction
    pub late_interaction_top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            candidate_pool: 50,
            hybrid_enabled: true,
            rrf_k: 60.0,
            dense_weight: 1.0,
            sparse_weight: 1.0,
            bm25_k1: 1.2,
            bm25_b: 0.75,
            expansion_enabled: true,
            expansion_top_n: 5,
            max_depth: 1,
            hop_decay: 0.5,
            max_expanded: 10,
            rerank_enabled: true,
            rerank_top_m: 20,
            late_interaction_enabled: false,
            late_interaction_top_k: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EvidenceConfig {
    pub max_per_chunk: usize,

    pub max_total: usize,

    pub overlap_weight: f32,

    pub retrieval_weight: f32,

    pub prior_weight: f32,

    /// Confidence at or above which evidence is `strong`
    pub strong_threshold: f32,

    /// Confidence at or above which evidence is `moderate`
    pub moderate_threshold: f32,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            max_per_chunk: 4,
            max_total: 20,
            overlap_weight: 0.4,
            retrieval_weight: 0.35,
            prior_weight: 0.25,
            strong_threshold: 0.75,
            moderate_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Strong-evidence count that allows a conclusion
    pub strong_evidence_threshold: usize,

    /// Confidence-weighted coverage that allows a conclusion
    pub coverage_threshold: f32,

    pub max_inference_steps: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            strong_evidence_threshold: 3,
            coverage_threshold: 0.6,
            max_inference_steps: 3,
        }
    }
}

/// When the chain-of-retrieval loop runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainMode {
    /// Single retrieval pass
    Off,
    /// Only for comparison, workflow and debugging intents or entity-heavy queries
    Auto,
    /// Every query
    Always,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CoragConfig {
    pub mode: ChainMode,

    pub max_hops: usize,
}

impl Default for CoragConfig {
    fn default() -> Self {
        Self {
            mode: ChainMode::Auto,
            max_hops: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// Polish answers with the language model when one is configured
    pub use_llm: bool,

    pub contradiction_penalty: f32,

    pub timeout_penalty: f32,

    pub incomplete_penalty: f32,

    /// Evidence snippets quoted in template answers
    pub max_supporting_points: usize,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            use_llm: true,
            contradiction_penalty: 0.85,
            timeout_penalty: 0.8,
            incomplete_penalty: 0.9,
            max_supporting_points: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Full-fidelity turns kept per conversation
    pub window_size: usize,

    /// Summaries kept before the oldest are merged
    pub max_summaries: usize,

    /// Conversations with a live window; past this the least recent one is
    /// compacted into a single summary
    pub max_conversations: usize,

    /// Compacted conversations retained before the least recent is forgotten
    pub max_compacted_conversations: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            window_size: 5,
            max_summaries: 20,
            max_conversations: 1000,
            max_compacted_conversations: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Queries answered concurrently per engine
    pub max_concurrent_queries: usize,

    /// In-flight calls per external provider
    pub provider_concurrency: usize,

    pub embed_timeout_ms: u64,

    pub vector_store_timeout_ms: u64,

    pub rerank_timeout_ms: u64,

    pub llm_timeout_ms: u64,

    /// Retries after the first attempt for transient failures
    pub max_retries: u32,

    pub initial_backoff_ms: u64,

    pub max_backoff_ms: u64,

    /// Longest accepted query, in characters
    pub max_query_chars: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_concurrent_queries: 32,
            provider_concurrency: 8,
            embed_timeout_ms: 2_000,
            vector_store_timeout_ms: 2_000,
            rerank_timeout_ms: 3_000,
            llm_timeout_ms: 20_000,
            max_retries: 2,
            initial_backoff_ms: 50,
            max_backoff_ms: 1_000,
            max_query_chars: 2_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    pub log_level: String,

    /// Enable JSON logging
    pub json_logging: bool,

    /// Metrics port (0 to disable the standalone exporter)
    pub metrics_port: u16,

    /// Service name for logs
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: true,
            metrics_port: 0,
            service_name: "lodestar".to_string(),
        }
    }
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
            // e.g., APP__RETRIEVAL__RRF_K=30
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would break pipeline invariants
    pub fn validate(&self) -> Result<(), ConfigError> {
        let decay = self.retrieval.hop_decay;
        if !(decay > 0.0 && decay < 1.0) {
            return Err(ConfigError::Message(format!(
                "retrieval.hop_decay must be in (0, 1), got {}",
                decay
            )));
        }
        if self.retrieval.rrf_k <= 0.0 {
            return Err(ConfigError::Message("retrieval.rrf_k must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.chunking.quality_threshold) {
            return Err(ConfigError::Message(
                "chunking.quality_threshold must be in [0, 1]".into(),
            ));
        }
        if self.corag.max_hops == 0 {
            return Err(ConfigError::Message("corag.max_hops must be at least 1".into()));
        }
        if self.conversation.window_size == 0 {
            return Err(ConfigError::Message(
                "conversation.window_size must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.retrieval.rrf_k, 60.0);
        assert_eq!(config.index.document_top_k, 50);
        assert_eq!(config.index.section_top_k, 20);
        assert_eq!(config.conversation.window_size, 5);
        assert_eq!(config.corag.max_hops, 3);
        assert_eq!(config.chunking.quality_threshold, 0.6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_hop_decay() {
        let mut config = AppConfig::default();
        config.retrieval.hop_decay = 1.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: AppConfig = Config::builder()
            .set_override("retrieval.top_k", 5)
            .and_then(|b| b.set_override("corag.mode", "always"))
            .and_then(|b| b.build())
            .and_then(|c| c.try_deserialize())
            .unwrap();
        assert_eq!(config.retrieval.top_k, 5);
        assert_eq!(config.retrieval.rerank_top_m, 20);
        assert_eq!(config.corag.mode, ChainMode::Always);
    }
}

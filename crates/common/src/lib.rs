//! Lodestar Common Library
//!
//! Shared code for the Lodestar crates including:
//! - Core data model (documents, chunks, ids)
//! - Provider abstractions (embedding, vector store, reranker, language model)
//! - Guarded provider access (concurrency, timeouts, retries, cancellation)
//! - Error types and handling
//! - Configuration management
//! - Text utilities and metrics

pub mod config;
pub mod embeddings;
pub mod errors;
pub mod metrics;
pub mod models;
pub mod providers;
pub mod resilience;
pub mod text;
pub mod vector_store;

// Re-export commonly used types
pub use config::AppConfig;
pub use embeddings::Embedder;
pub use errors::{AppError, Result};
pub use providers::{LanguageModel, Reranker};
pub use resilience::{ProviderGate, ProviderGates};
pub use vector_store::VectorStore;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 384;

//! Inference providers besides embeddings: cross-encoder reranking and
//! text generation

pub mod llm;
pub mod reranker;

pub use llm::{create_llm, LanguageModel, OpenAICompatibleLlm};
pub use reranker::{create_reranker, HttpReranker, LexicalReranker, Reranker};

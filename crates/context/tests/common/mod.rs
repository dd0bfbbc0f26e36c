//! Shared fixtures for engine scenario tests
#![allow(dead_code)]

use async_trait::async_trait;
use lodestar_common::config::AppConfig;
use lodestar_common::embeddings::HashingEmbedder;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::models::Document;
use lodestar_common::providers::{LanguageModel, Reranker};
use lodestar_common::text;
use lodestar_common::vector_store::InMemoryVectorStore;
use lodestar_context::{EngineComponents, QueryEngine};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const README: &str = "# GRID

GRID is a distributed job scheduler for batch workloads. The GRID architecture is described in ARCHITECTURE.md.

## Installation

Install with pip and run the `grid` command to start a scheduler node.
";

pub const ARCHITECTURE: &str = "# Architecture

The GRID architecture has three layers: the API layer, the scheduling layer and the worker layer. Each layer of the GRID architecture runs as a separate process.

## Workers

Workers pull jobs from the scheduling layer and report heartbeats every five seconds. The worker loop lives in src/engine.py.
";

pub const ENGINE_PY: &str = "class GridEngine:
    \"\"\"Core of the GRID architecture: schedules jobs onto workers.\"\"\"

    def __init__(self, workers):
        self.workers = workers

    def schedule(self, job):
        return self.workers.pick(job)
";

pub const RECIPES: &str = "# Banana bread

Banana bread needs ripe bananas, flour and butter. Bake it for one hour at medium heat.
";

/// README / ARCHITECTURE / engine corpus plus one unrelated document
pub fn grid_corpus() -> Vec<Document> {
    vec![
        Document::from_markdown("readme", "README.md", README),
        Document::from_markdown("architecture", "ARCHITECTURE.md", ARCHITECTURE),
        Document::from_text("engine", "src/engine.py", ENGINE_PY),
        Document::from_markdown("recipes", "recipes.md", RECIPES),
    ]
}

/// Two documents that disagree on the retry count
pub fn conflicting_corpus() -> Vec<Document> {
    vec![
        Document::from_markdown(
            "retries",
            "docs/retries.md",
            "# Retries\n\nThe scheduler retries failed jobs three times before giving up.\n",
        ),
        Document::from_markdown(
            "operations",
            "docs/operations.md",
            "# Failed jobs\n\nThe scheduler retries failed jobs five times before giving up.\n",
        ),
    ]
}

/// Config with fast retries so failing doubles do not slow tests down
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.resilience.max_retries = 1;
    config.resilience.initial_backoff_ms = 1;
    config.resilience.max_backoff_ms = 2;
    config
}

pub fn engine_with(
    config: AppConfig,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn LanguageModel>>,
) -> QueryEngine {
    let components = EngineComponents {
        embedder: Arc::new(HashingEmbedder::new(config.embedding.dimension)),
        vector_store: Arc::new(InMemoryVectorStore::with_dimension(config.embedding.dimension)),
        reranker,
        llm,
    };
    QueryEngine::new(components, config)
}

/// Engine over `documents` with the default test config
pub async fn indexed_engine(
    documents: Vec<Document>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn LanguageModel>>,
) -> QueryEngine {
    indexed_engine_with(test_config(), documents, reranker, llm).await
}

pub async fn indexed_engine_with(
    config: AppConfig,
    documents: Vec<Document>,
    reranker: Option<Arc<dyn Reranker>>,
    llm: Option<Arc<dyn LanguageModel>>,
) -> QueryEngine {
    let engine = engine_with(config, reranker, llm);
    engine.index_documents(documents).await.unwrap();
    engine
}

/// Scores by the share of query terms present in the chunk
pub struct TermOverlapReranker;

#[async_trait]
impl Reranker for TermOverlapReranker {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f32> {
        let query_terms = text::key_terms(query);
        if query_terms.is_empty() {
            return Ok(0.0);
        }
        let chunk_terms: HashSet<String> = text::key_terms(chunk_text).into_iter().collect();
        let shared = query_terms.iter().filter(|t| chunk_terms.contains(*t)).count();
        Ok(shared as f32 / query_terms.len() as f32)
    }

    fn name(&self) -> &str {
        "term-overlap"
    }
}

/// Always unavailable
pub struct UnavailableReranker;

#[async_trait]
impl Reranker for UnavailableReranker {
    async fn score(&self, _query: &str, _chunk_text: &str) -> Result<f32> {
        Err(AppError::ServiceUnavailable {
            message: "reranker offline".to_string(),
        })
    }

    fn name(&self) -> &str {
        "unavailable"
    }
}

/// Replays canned completions in order, repeating the last one
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<String>>,
    last: Mutex<String>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(responses: &[&str]) -> Self {
        Self {
            responses: Mutex::new(responses.iter().map(|r| r.to_string()).collect()),
            last: Mutex::new(String::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.responses.lock().unwrap().pop_front();
        let mut last = self.last.lock().unwrap();
        if let Some(next) = next {
            *last = next;
        }
        Ok(last.clone())
    }

    fn model_name(&self) -> &str {
        "scripted"
    }
}

/// Always fails with a transient error
pub struct UnavailableLlm;

#[async_trait]
impl LanguageModel for UnavailableLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        Err(AppError::LanguageModelUnavailable {
            message: "model offline".to_string(),
        })
    }

    fn model_name(&self) -> &str {
        "unavailable"
    }
}

/// Answers like [`TermOverlapReranker`], but only after `delay`
pub struct SlowReranker {
    pub delay: Duration,
}

#[async_trait]
impl Reranker for SlowReranker {
    async fn score(&self, query: &str, chunk_text: &str) -> Result<f32> {
        tokio::time::sleep(self.delay).await;
        TermOverlapReranker.score(query, chunk_text).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Completes with a fixed answer after `delay`
pub struct SlowLlm {
    pub delay: Duration,
}

#[async_trait]
impl LanguageModel for SlowLlm {
    async fn complete(&self, _prompt: &str) -> Result<String> {
        tokio::time::sleep(self.delay).await;
        Ok("GRID has three layers [ARCHITECTURE.md:L3].".to_string())
    }

    fn model_name(&self) -> &str {
        "slow"
    }
}

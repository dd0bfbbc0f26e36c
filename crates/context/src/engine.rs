//! Query engine
//!
//! Wires the pipeline together behind the caller API:
//! conversation context -> query understanding -> retrieval (single pass or
//! chain-of-retrieval) -> evidence -> reasoning -> synthesis.
//!
//! Also owns index management: chunking, embedding and publishing new
//! snapshots. Every provider is injected; engines share nothing global.

use crate::conversation::{ContextSource, ConversationManager};
use crate::corag::{self, ChainStages, CoragController};
use crate::evidence::EvidenceExtractor;
use crate::query_parser::{QueryParser, QueryParserConfig};
use crate::reasoner::ReasoningEngine;
use crate::synthesizer::{ResponseSynthesizer, SynthesisInput, SynthesizedResponse};
use async_trait::async_trait;
use lodestar_common::config::AppConfig;
use lodestar_common::embeddings::{create_embedder, Embedder};
use lodestar_common::errors::{AppError, Result};
use lodestar_common::metrics;
use lodestar_common::models::{ChunkId, Document, DocumentId};
use lodestar_common::providers::{create_llm, create_reranker, LanguageModel, Reranker};
use lodestar_common::resilience::{check_cancelled, within_deadline, ProviderGate, ProviderGates};
use lodestar_common::vector_store::{InMemoryVectorStore, VectorStore};
use lodestar_ingestion::ChunkingEngine;
use lodestar_search::{
    HierarchicalIndex, IndexEntry, IndexHandle, IndexStats, RetrievalOrchestrator, RetrievalOutcome, RetrievalRequest,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Largest `top_k` a caller may request
pub const MAX_TOP_K: usize = 50;

/// External providers the engine is built from
#[derive(Clone)]
pub struct EngineComponents {
    pub embedder: Arc<dyn Embedder>,
    pub vector_store: Arc<dyn VectorStore>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub llm: Option<Arc<dyn LanguageModel>>,
}

impl EngineComponents {
    /// Providers named by configuration, with an in-memory vector store
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            embedder: create_embedder(&config.embedding)?,
            vector_store: Arc::new(InMemoryVectorStore::with_dimension(config.embedding.dimension)),
            reranker: create_reranker(&config.providers.reranker)?,
            llm: create_llm(&config.providers.llm)?,
        })
    }
}

/// One question for the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnswerRequest {
    pub query: String,

    #[serde(default)]
    pub conversation_id: Option<String>,

    /// Force chain-of-retrieval on or off for this request
    #[serde(default)]
    pub chain: Option<bool>,

    #[serde(default)]
    pub top_k: Option<usize>,

    /// When reached, the engine answers from whatever it has gathered
    #[serde(skip)]
    pub deadline: Option<tokio::time::Instant>,
}

impl AnswerRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn with_chain(mut self, chain: bool) -> Self {
        self.chain = Some(chain);
        self
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_deadline(mut self, deadline: tokio::time::Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Result of an indexing run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexReport {
    pub version: u64,
    pub documents: usize,
    pub chunks_accepted: usize,
    pub chunks_rejected: usize,
    pub vectors_upserted: usize,
    pub vectors_deleted: usize,
    /// Documents scored without embeddings because the embedder failed
    pub lexical_fallback: Vec<DocumentId>,
}

/// Result of removing documents
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemovalReport {
    pub version: u64,
    pub removed: Vec<DocumentId>,
    /// Requested ids that were not indexed
    pub missing: Vec<DocumentId>,
    pub vectors_deleted: usize,
}

pub struct QueryEngine {
    config: AppConfig,
    embedder: Arc<dyn Embedder>,
    vector_store: Arc<dyn VectorStore>,
    gates: ProviderGates,
    index: IndexHandle,
    chunker: ChunkingEngine,
    parser: QueryParser,
    conversations: ConversationManager,
    orchestrator: RetrievalOrchestrator,
    extractor: EvidenceExtractor,
    reasoner: ReasoningEngine,
    corag: CoragController,
    synthesizer: ResponseSynthesizer,
    query_permits: Semaphore,
}

impl QueryEngine {
    pub fn new(components: EngineComponents, config: AppConfig) -> Self {
        let EngineComponents {
            embedder,
            vector_store,
            reranker,
            llm,
        } = components;
        let gates = ProviderGates::from_config(&config.resilience);

        let parser = QueryParser::new(QueryParserConfig {
            max_query_chars: config.resilience.max_query_chars,
            ..QueryParserConfig::default()
        });
        let orchestrator = RetrievalOrchestrator::new(
            config.retrieval.clone(),
            embedder.clone(),
            vector_store.clone(),
            reranker,
            gates.clone(),
        );
        let corag = CoragController::new(config.corag.clone(), llm.clone(), gates.llm.clone());
        let synthesizer = ResponseSynthesizer::new(config.synthesis.clone(), llm, gates.llm.clone());

        info!(
            embedder = embedder.model_name(),
            dimension = embedder.dimension(),
            max_concurrent_queries = config.resilience.max_concurrent_queries,
            "Query engine initialized"
        );

        Self {
            index: IndexHandle::new(HierarchicalIndex::empty(config.index.clone())),
            chunker: ChunkingEngine::new(config.chunking.clone()),
            conversations: ConversationManager::new(config.conversation.clone()),
            extractor: EvidenceExtractor::new(config.evidence.clone(), config.chunking.quality_threshold),
            reasoner: ReasoningEngine::new(config.reasoning.clone()),
            query_permits: Semaphore::new(config.resilience.max_concurrent_queries.max(1)),
            parser,
            orchestrator,
            corag,
            synthesizer,
            embedder,
            vector_store,
            gates,
            config,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn conversations(&self) -> &ConversationManager {
        &self.conversations
    }

    /// Answer a question, optionally within a conversation
    pub async fn answer(&self, query: &str, conversation_id: Option<&str>) -> Result<SynthesizedResponse> {
        let mut request = AnswerRequest::new(query);
        request.conversation_id = conversation_id.map(str::to_string);
        self.answer_with(request, &CancellationToken::new()).await
    }

    /// Answer with per-request options and a caller-owned cancellation token
    ///
    /// Structural errors (`InvalidQuery`) and cancellation are returned;
    /// provider failures only degrade the response. Past the request
    /// deadline the answer is built from what was gathered so far.
    #[instrument(skip(self, request, cancel), fields(conversation_id = ?request.conversation_id))]
    pub async fn answer_with(&self, request: AnswerRequest, cancel: &CancellationToken) -> Result<SynthesizedResponse> {
        let started = Instant::now();

        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(AppError::Cancelled { stage: "queue".to_string() }),
            permit = self.query_permits.acquire() => permit.map_err(|_| AppError::ServiceUnavailable {
                message: "query engine is shutting down".to_string(),
            })?,
        };

        let parsed = self.parser.parse(&request.query)?;
        let conversation_id = request.conversation_id.as_deref();
        let reconstructed = self
            .conversations
            .reconstruct_query(conversation_id, &parsed.original_query, parsed.intent)
            .await;

        let (understanding, reconstructed_query) = if reconstructed.source == ContextSource::None {
            (parsed.clone(), None)
        } else {
            match self.parser.parse(&reconstructed.query) {
                Ok(mut understanding) => {
                    // Intent belongs to what the user typed, not the appended context
                    understanding.intent = parsed.intent;
                    understanding.intent_confidence = parsed.intent_confidence;
                    (understanding, Some(reconstructed.query))
                }
                Err(e) => {
                    warn!(error = %e, "Reconstructed query rejected, using the original");
                    (parsed.clone(), None)
                }
            }
        };

        let snapshot = self.index.snapshot().await;
        let top_k = request
            .top_k
            .unwrap_or(self.config.retrieval.top_k)
            .clamp(1, MAX_TOP_K);

        let deadline = request.deadline;
        let (mut retrieval, retrieval_chain) =
            if corag::should_run(self.corag.config().mode, &understanding, request.chain) {
                let stages = ChainStages {
                    orchestrator: &self.orchestrator,
                    extractor: &self.extractor,
                    reasoner: &self.reasoner,
                };
                let outcome = self
                    .corag
                    .run(&stages, &snapshot, &understanding, top_k, deadline, cancel)
                    .await?;
                (outcome.outcome, Some(outcome.chain))
            } else {
                let retrieval_request = RetrievalRequest::new(understanding.original_query.clone(), top_k)
                    .with_expansions(understanding.expansions.clone());
                let retrieved = self.orchestrator.retrieve(&snapshot, &retrieval_request, cancel);
                match within_deadline(deadline, retrieved).await {
                    Some(outcome) => (outcome?, None),
                    None => {
                        warn!("Request deadline reached during retrieval");
                        let mut outcome = RetrievalOutcome::default();
                        outcome.provenance.timed_out = true;
                        (outcome, None)
                    }
                }
            };
        retrieval.provenance.index_version = snapshot.version();

        check_cancelled(cancel, "evidence")?;
        let evidence = self
            .extractor
            .extract(&understanding, &retrieval.candidates, &retrieval.sentences);
        let reasoning = self.reasoner.reason(&understanding, &evidence);

        check_cancelled(cancel, "synthesis")?;
        let mut response = self
            .synthesizer
            .synthesize(
                SynthesisInput {
                    understanding: &understanding,
                    reconstructed_query,
                    evidence,
                    reasoning,
                    retrieval,
                    retrieval_chain,
                    deadline,
                },
                cancel,
            )
            .await?;

        drop(snapshot);
        self.reclaim_if_idle().await;

        let elapsed = started.elapsed();
        response.metadata.duration_ms = elapsed.as_millis() as u64;

        if let Some(id) = conversation_id {
            self.conversations
                .record_turn(id, &parsed.original_query, &response.answer, parsed.intent)
                .await;
        }

        let terminal = response.reasoning.terminal().kind;
        metrics::record_query(elapsed.as_secs_f64(), terminal.as_str(), response.evidence.len());
        info!(
            intent = parsed.intent.as_str(),
            terminal = terminal.as_str(),
            evidence = response.evidence.len(),
            citations = response.citations.len(),
            confidence = response.confidence,
            index_version = response.metadata.index_version,
            duration_ms = response.metadata.duration_ms,
            "Query answered"
        );

        Ok(response)
    }

    /// Chunk, embed and index documents, superseding any with the same id
    ///
    /// Within one batch the last document with a given id wins.
    pub async fn index_documents(&self, documents: Vec<Document>) -> Result<IndexReport> {
        if documents.is_empty() {
            return Err(AppError::Validation {
                message: "at least one document is required".to_string(),
                field: Some("documents".to_string()),
            });
        }
        if let Some(doc) = documents.iter().find(|d| d.id.as_str().trim().is_empty()) {
            return Err(AppError::Validation {
                message: format!("document with path '{}' has an empty id", doc.path),
                field: Some("id".to_string()),
            });
        }

        let documents = last_per_id(documents);

        let _writer = self.index.lock_writer().await;
        let current = self.index.snapshot().await;
        let cancel = CancellationToken::new();
        let embedder = GatedEmbedder {
            inner: self.embedder.as_ref(),
            gate: &self.gates.embedding,
            batch_size: self.config.embedding.batch_size.max(1),
            cancel: &cancel,
        };

        let mut entries = Vec::with_capacity(documents.len());
        let mut lexical_fallback = Vec::new();
        let (mut accepted, mut rejected) = (0, 0);

        for document in documents {
            let outcome = self.chunker.chunk_document(&document, &embedder).await?;
            if outcome.scored_lexically {
                lexical_fallback.push(document.id.clone());
            }

            accepted += outcome.chunks.len();
            rejected += outcome.rejected;
            entries.push(IndexEntry {
                document: Arc::new(document),
                chunks: outcome.chunks.into_iter().map(Arc::new).collect(),
            });
        }

        let vectors: Vec<(ChunkId, Vec<f32>)> = entries
            .iter()
            .flat_map(|e| e.chunks.iter())
            .filter(|c| !c.embedding.is_empty())
            .map(|c| (c.id.clone(), c.embedding.clone()))
            .collect();
        let document_count = entries.len();
        let next = current.rebuild(entries, &HashSet::new());
        drop(current);

        let vectors_upserted = vectors.len();
        if !vectors.is_empty() {
            self.gates
                .vector_store
                .call("upsert", &cancel, || self.vector_store.upsert_batch(vectors.clone()))
                .await?;
        }

        let version = self.index.publish(next).await.version();
        let vectors_deleted = self.reclaim_vectors(&cancel).await;
        metrics::record_indexing(accepted, rejected, version);
        info!(
            version,
            documents = document_count,
            accepted,
            rejected,
            vectors_upserted,
            vectors_deleted,
            "Documents indexed"
        );

        Ok(IndexReport {
            version,
            documents: document_count,
            chunks_accepted: accepted,
            chunks_rejected: rejected,
            vectors_upserted,
            vectors_deleted,
            lexical_fallback,
        })
    }

    /// Drop documents from the index; fails with `NotFound` if none are indexed
    pub async fn remove_documents(&self, ids: &[DocumentId]) -> Result<RemovalReport> {
        let _writer = self.index.lock_writer().await;
        let current = self.index.snapshot().await;

        let (removed, missing): (Vec<DocumentId>, Vec<DocumentId>) =
            ids.iter().cloned().partition(|id| current.contains_document(id));
        if removed.is_empty() {
            return Err(AppError::NotFound {
                resource_type: "document".to_string(),
                id: ids.iter().map(DocumentId::as_str).collect::<Vec<_>>().join(","),
            });
        }

        let removals: HashSet<DocumentId> = removed.iter().cloned().collect();
        let next = current.rebuild(Vec::new(), &removals);
        drop(current);

        let version = self.index.publish(next).await.version();
        let vectors_deleted = self.reclaim_vectors(&CancellationToken::new()).await;
        info!(version, removed = removed.len(), missing = missing.len(), "Documents removed");

        Ok(RemovalReport {
            version,
            removed,
            missing,
            vectors_deleted,
        })
    }

    pub async fn index_stats(&self) -> IndexStats {
        self.index.snapshot().await.stats()
    }

    /// Readiness probe: one guarded embedding call
    pub async fn probe_embedder(&self) -> Result<()> {
        let vector = self
            .gates
            .embedding
            .call("probe", &CancellationToken::new(), || self.embedder.embed("readiness probe"))
            .await?;
        if vector.len() != self.embedder.dimension() {
            return Err(AppError::ServiceUnavailable {
                message: format!(
                    "embedder returned {} dimensions, expected {}",
                    vector.len(),
                    self.embedder.dimension()
                ),
            });
        }
        Ok(())
    }

    /// Readiness probe: number of vectors the store holds
    pub async fn probe_vector_store(&self) -> Result<usize> {
        self.gates
            .vector_store
            .call("probe", &CancellationToken::new(), || async { Ok(self.vector_store.count().await) })
            .await
    }

    /// Reclaim after a query unless an indexing run holds the writer lock
    async fn reclaim_if_idle(&self) {
        if let Some(_writer) = self.index.try_lock_writer() {
            self.reclaim_vectors(&CancellationToken::new()).await;
        }
    }

    /// Delete vectors of retired chunks no snapshot holds any more
    ///
    /// The caller holds the writer lock. Dense retrieval only ranks chunks
    /// of its own snapshot, so a failed delete only warns.
    async fn reclaim_vectors(&self, cancel: &CancellationToken) -> usize {
        let stale = self.index.reclaim().await;
        if stale.is_empty() {
            return 0;
        }
        match self
            .gates
            .vector_store
            .call("delete", cancel, || self.vector_store.delete_batch(&stale))
            .await
        {
            Ok(()) => {
                debug!(count = stale.len(), "Deleted vectors of retired chunks");
                stale.len()
            }
            Err(e) => {
                warn!(count = stale.len(), error = %e, "Failed to delete stale vectors");
                0
            }
        }
    }
}

/// Keep the last document for each id, in first-seen order
fn last_per_id(documents: Vec<Document>) -> Vec<Document> {
    let total = documents.len();
    let mut position: HashMap<DocumentId, usize> = HashMap::new();
    let mut unique: Vec<Document> = Vec::with_capacity(total);
    for document in documents {
        match position.get(&document.id) {
            Some(&idx) => unique[idx] = document,
            None => {
                position.insert(document.id.clone(), unique.len());
                unique.push(document);
            }
        }
    }
    if unique.len() < total {
        debug!(duplicates = total - unique.len(), "Superseded duplicate document ids in batch");
    }
    unique
}

/// Embedder seen by the chunker: batched and routed through the embedding gate
struct GatedEmbedder<'a> {
    inner: &'a dyn Embedder,
    gate: &'a ProviderGate,
    batch_size: usize,
    cancel: &'a CancellationToken,
}

#[async_trait]
impl<'a> Embedder for GatedEmbedder<'a> {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.gate
            .call("embed_chunks", self.cancel, || self.inner.embed(text))
            .await
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let vectors = self
                .gate
                .call("embed_chunks", self.cancel, || self.inner.embed_batch(batch))
                .await?;
            embeddings.extend(vectors);
        }
        Ok(embeddings)
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

//! Retrieval orchestration
//!
//! Runs the stages against one immutable snapshot:
//! embed query → hierarchical funnel → hybrid (dense ∥ sparse, RRF) →
//! multi-hop expansion → cross-encoder → late interaction → top_k.

use super::{
    apply_cross_encoder, apply_late_interaction, expand_candidates, DenseRetriever, HybridSearch,
    RetrievalCandidate, RetrievalOutcome, RetrievalProvenance, RetrievalRequest, RetrievedSentence, Stage,
    StageStatus,
};
use crate::index::{HierarchicalIndex, QueryProbe};
use lodestar_common::config::RetrievalConfig;
use lodestar_common::embeddings::Embedder;
use lodestar_common::errors::Result;
use lodestar_common::providers::Reranker;
use lodestar_common::resilience::{check_cancelled, ProviderGates};
use lodestar_common::vector_store::VectorStore;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

pub struct RetrievalOrchestrator {
    config: RetrievalConfig,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<dyn Reranker>>,
    hybrid: HybridSearch,
    gates: ProviderGates,
}

impl RetrievalOrchestrator {
    pub fn new(
        config: RetrievalConfig,
        embedder: Arc<dyn Embedder>,
        vector_store: Arc<dyn VectorStore>,
        reranker: Option<Arc<dyn Reranker>>,
        gates: ProviderGates,
    ) -> Self {
        let dense = DenseRetriever::new(vector_store, gates.vector_store.clone());
        let hybrid = HybridSearch::new(dense, &config);
        Self {
            config,
            embedder,
            reranker,
            hybrid,
            gates,
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve ranked candidates for one query
    ///
    /// Provider failures degrade the affected stage and are recorded in the
    /// provenance. Only cancellation is returned as an error.
    #[instrument(skip(self, index, request, cancel), fields(version = index.version()))]
    pub async fn retrieve(
        &self,
        index: &HierarchicalIndex,
        request: &RetrievalRequest,
        cancel: &CancellationToken,
    ) -> Result<RetrievalOutcome> {
        check_cancelled(cancel, "retrieve")?;
        let started = Instant::now();
        let mut provenance = RetrievalProvenance {
            index_version: index.version(),
            ..RetrievalProvenance::default()
        };

        let embedding = self.embed_query(&request.query, cancel, &mut provenance).await?;
        let probe = QueryProbe::new(&request.query, &request.expansions, embedding);

        // Hierarchical funnel
        let stage_start = Instant::now();
        let hits = index.hierarchical_retrieve(&probe, self.config.candidate_pool.max(request.top_k));
        if let Some(level) = hits.empty_level {
            provenance.empty_level = Some(level);
            provenance.record(
                Stage::Hierarchical,
                StageStatus::Completed,
                Some(format!("no coverage at {:?} level", level).to_lowercase()),
                stage_start,
            );
            provenance.record(Stage::Rerank, StageStatus::Skipped, Some("no candidates".to_string()), stage_start);
            provenance.reranking_skipped = true;
            provenance.late_interaction_skipped = true;
            info!(level = ?level, "No coverage for query");
            return Ok(RetrievalOutcome {
                provenance,
                ..RetrievalOutcome::default()
            });
        }
        provenance.record(Stage::Hierarchical, StageStatus::Completed, None, stage_start);
        let pool: Vec<usize> = hits.chunks.iter().map(|h| h.chunk).collect();

        // Hybrid search
        check_cancelled(cancel, "hybrid")?;
        let stage_start = Instant::now();
        let hybrid = self.hybrid.search(index, &pool, &probe, cancel).await?;
        if let Some(error) = &hybrid.dense_fallback {
            provenance.hybrid_degraded = true;
            provenance.degrade(Stage::Dense, error, stage_start);
        } else if hybrid.dense_unavailable {
            provenance.hybrid_degraded = true;
            provenance.record(
                Stage::Dense,
                StageStatus::Degraded,
                Some("query embedding unavailable".to_string()),
                stage_start,
            );
        } else {
            provenance.record(Stage::Dense, StageStatus::Completed, None, stage_start);
        }
        if hybrid.sparse_skipped {
            provenance.record(Stage::Sparse, StageStatus::Skipped, Some("hybrid disabled".to_string()), stage_start);
        } else {
            provenance.record(Stage::Sparse, StageStatus::Completed, None, stage_start);
        }
        provenance.record(
            Stage::Fusion,
            StageStatus::Completed,
            Some(format!("dense={} sparse={}", hybrid.dense_count, hybrid.sparse_count)),
            stage_start,
        );
        let mut candidates = hybrid.candidates;

        // Multi-hop expansion
        let stage_start = Instant::now();
        if self.config.expansion_enabled {
            provenance.expanded_count = expand_candidates(index, &mut candidates, &self.config);
            provenance.record(Stage::Expansion, StageStatus::Completed, None, stage_start);
        } else {
            provenance.expansion_skipped = true;
            provenance.record(Stage::Expansion, StageStatus::Skipped, Some("disabled".to_string()), stage_start);
        }

        let top_k = request.top_k.max(1);
        provenance.pre_rerank_order = candidates.iter().take(top_k).map(|c| c.chunk.id.clone()).collect();

        // Cross-encoder
        check_cancelled(cancel, "rerank")?;
        let stage_start = Instant::now();
        let reranked = match (&self.reranker, self.config.rerank_enabled) {
            (Some(reranker), true) => {
                match apply_cross_encoder(
                    &mut candidates,
                    &request.query,
                    reranker.as_ref(),
                    &self.gates.reranker,
                    self.config.rerank_top_m,
                    cancel,
                )
                .await
                {
                    Ok(applied) => {
                        provenance.record(Stage::Rerank, StageStatus::Completed, None, stage_start);
                        applied
                    }
                    Err(e) if e.is_cancelled() => return Err(e),
                    Err(e) => {
                        provenance.degrade(Stage::Rerank, &e, stage_start);
                        false
                    }
                }
            }
            (None, _) => {
                provenance.record(Stage::Rerank, StageStatus::Skipped, Some("no reranker".to_string()), stage_start);
                false
            }
            (Some(_), false) => {
                provenance.record(Stage::Rerank, StageStatus::Skipped, Some("disabled".to_string()), stage_start);
                false
            }
        };
        provenance.reranking_skipped = !reranked;

        // Late interaction, restricted to the reranker's top-K
        let stage_start = Instant::now();
        let late = if !self.config.late_interaction_enabled {
            provenance.record(Stage::LateInteraction, StageStatus::Skipped, Some("disabled".to_string()), stage_start);
            false
        } else if !reranked {
            provenance.record(
                Stage::LateInteraction,
                StageStatus::Skipped,
                Some("reranking skipped".to_string()),
                stage_start,
            );
            false
        } else {
            match apply_late_interaction(
                &mut candidates,
                &request.query,
                self.embedder.as_ref(),
                &self.gates.embedding,
                self.config.late_interaction_top_k,
                cancel,
            )
            .await
            {
                Ok(applied) => {
                    provenance.record(Stage::LateInteraction, StageStatus::Completed, None, stage_start);
                    applied
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    provenance.degrade(Stage::LateInteraction, &e, stage_start);
                    false
                }
            }
        };
        provenance.late_interaction_skipped = !late;

        candidates.truncate(top_k);
        assign_ranks(&mut candidates);

        let kept: HashSet<usize> = candidates.iter().map(|c| c.index).collect();
        let sentences = hits
            .sentences
            .iter()
            .filter(|s| kept.contains(&s.chunk))
            .map(|s| {
                let node = index.sentence(s.sentence);
                RetrievedSentence {
                    chunk_id: index.chunk(s.chunk).chunk.id.clone(),
                    start: node.start,
                    end: node.end,
                    text: node.text.clone(),
                    score: s.score,
                }
            })
            .collect();

        debug!(
            candidates = candidates.len(),
            expanded = provenance.expanded_count,
            reranking_skipped = provenance.reranking_skipped,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Retrieval complete"
        );

        Ok(RetrievalOutcome {
            candidates,
            sentences,
            provenance,
        })
    }

    /// Query embedding; unavailability degrades to a lexical-only probe
    async fn embed_query(
        &self,
        query: &str,
        cancel: &CancellationToken,
        provenance: &mut RetrievalProvenance,
    ) -> Result<Vec<f32>> {
        let stage_start = Instant::now();
        match self
            .gates
            .embedding
            .call("embed_query", cancel, || self.embedder.embed(query))
            .await
        {
            Ok(embedding) => {
                provenance.record(Stage::EmbedQuery, StageStatus::Completed, None, stage_start);
                Ok(embedding)
            }
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                provenance.degrade(Stage::EmbedQuery, &e, stage_start);
                Ok(Vec::new())
            }
        }
    }
}

/// Final 1-based ranks and normalized relevance
///
/// Relevance is the fused score relative to the best fused score, averaged
/// with the last reranking score when one exists.
fn assign_ranks(candidates: &mut [RetrievalCandidate]) {
    let max_fused = candidates
        .iter()
        .map(|c| c.scores.fused)
        .fold(0.0f32, f32::max);

    for (i, candidate) in candidates.iter_mut().enumerate() {
        candidate.rank = i + 1;
        let fused = if max_fused > 0.0 {
            (candidate.scores.fused / max_fused).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let stage = candidate
            .scores
            .late_interaction
            .or(candidate.scores.reranked)
            .map(|s| s.clamp(0.0, 1.0));
        candidate.relevance = match stage {
            Some(score) => 0.5 * fused + 0.5 * score,
            None => fused,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::{corpus, DIM};
    use crate::index::IndexLevel;
    use async_trait::async_trait;
    use lodestar_common::config::ResilienceConfig;
    use lodestar_common::embeddings::HashingEmbedder;
    use lodestar_common::errors::AppError;
    use lodestar_common::providers::LexicalReranker;
    use lodestar_common::vector_store::InMemoryVectorStore;

    struct DownReranker;

    #[async_trait]
    impl Reranker for DownReranker {
        async fn score(&self, _query: &str, _chunk_text: &str) -> Result<f32> {
            Err(AppError::RerankerUnavailable { message: "connection refused".into() })
        }

        fn name(&self) -> &str {
            "down"
        }
    }

    struct DownEmbedder;

    #[async_trait]
    impl Embedder for DownEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(AppError::EmbeddingUnavailable { message: "offline".into() })
        }

        async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Err(AppError::EmbeddingUnavailable { message: "offline".into() })
        }

        fn model_name(&self) -> &str {
            "down"
        }

        fn dimension(&self) -> usize {
            DIM
        }
    }

    fn gates() -> ProviderGates {
        ProviderGates::from_config(&ResilienceConfig {
            max_retries: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            ..ResilienceConfig::default()
        })
    }

    async fn orchestrator(
        index: &HierarchicalIndex,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<dyn Reranker>>,
        config: RetrievalConfig,
    ) -> RetrievalOrchestrator {
        let store = Arc::new(InMemoryVectorStore::new());
        for c in 0..index.chunk_count() {
            let chunk = &index.chunk(c).chunk;
            store.upsert(&chunk.id, chunk.embedding.clone()).await.unwrap();
        }
        RetrievalOrchestrator::new(config, embedder, store, reranker, gates())
    }

    fn paths(outcome: &RetrievalOutcome) -> Vec<String> {
        outcome.candidates.iter().map(|c| c.chunk.path.clone()).collect()
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let index = corpus();
        let retriever = orchestrator(
            &index,
            Arc::new(HashingEmbedder::new(DIM)),
            Some(Arc::new(LexicalReranker::new())),
            RetrievalConfig::default(),
        )
        .await;

        let request = RetrievalRequest::new("What is the GRID architecture?", 10);
        let outcome = retriever.retrieve(&index, &request, &CancellationToken::new()).await.unwrap();

        assert_eq!(outcome.candidates[0].chunk.path, "ARCHITECTURE.md");
        assert!(paths(&outcome).contains(&"src/engine.py".to_string()));
        assert!(!paths(&outcome).contains(&"recipes.md".to_string()));
        assert!(!outcome.provenance.reranking_skipped);
        assert!(outcome.provenance.late_interaction_skipped);
        assert_eq!(outcome.provenance.index_version, 1);
        assert_eq!(outcome.provenance.status_of(Stage::Rerank), Some(StageStatus::Completed));

        for (i, candidate) in outcome.candidates.iter().enumerate() {
            assert_eq!(candidate.rank, i + 1);
            assert!((0.0..=1.0).contains(&candidate.relevance));
        }
        assert!(outcome
            .sentences
            .iter()
            .all(|s| outcome.candidates.iter().any(|c| c.chunk.id == s.chunk_id)));
    }

    #[tokio::test]
    async fn test_ordering_is_deterministic() {
        let index = corpus();
        let retriever = orchestrator(&index, Arc::new(HashingEmbedder::new(DIM)), None, RetrievalConfig::default()).await;
        let request = RetrievalRequest::new("GRID scheduler workers", 10);
        let token = CancellationToken::new();

        let first = retriever.retrieve(&index, &request, &token).await.unwrap();
        let second = retriever.retrieve(&index, &request, &token).await.unwrap();
        let ids = |o: &RetrievalOutcome| o.candidates.iter().map(|c| c.chunk.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids(&first), ids(&second));
        assert!(first.provenance.reranking_skipped);
    }

    #[tokio::test]
    async fn test_reranker_failure_keeps_fused_order() {
        let index = corpus();
        let retriever = orchestrator(
            &index,
            Arc::new(HashingEmbedder::new(DIM)),
            Some(Arc::new(DownReranker)),
            RetrievalConfig::default(),
        )
        .await;

        let request = RetrievalRequest::new("What is the GRID architecture?", 10);
        let outcome = retriever.retrieve(&index, &request, &CancellationToken::new()).await.unwrap();

        assert!(!outcome.candidates.is_empty());
        assert!(outcome.provenance.reranking_skipped);
        assert_eq!(outcome.provenance.status_of(Stage::Rerank), Some(StageStatus::Degraded));
        let order: Vec<_> = outcome.candidates.iter().map(|c| c.chunk.id.clone()).collect();
        assert_eq!(order, outcome.provenance.pre_rerank_order);
    }

    #[tokio::test]
    async fn test_embedding_outage_falls_back_to_lexical() {
        let index = corpus();
        let retriever = orchestrator(&index, Arc::new(DownEmbedder), None, RetrievalConfig::default()).await;
        let request = RetrievalRequest::new("What is the GRID architecture?", 10);
        let outcome = retriever.retrieve(&index, &request, &CancellationToken::new()).await.unwrap();

        assert!(outcome.provenance.hybrid_degraded);
        assert_eq!(outcome.provenance.status_of(Stage::EmbedQuery), Some(StageStatus::Degraded));
        assert!(outcome.candidates.iter().all(|c| c.dense_rank.is_none()));
        assert!(paths(&outcome).contains(&"ARCHITECTURE.md".to_string()));
    }

    #[tokio::test]
    async fn test_no_coverage_returns_empty() {
        let index = corpus();
        let retriever = orchestrator(
            &index,
            Arc::new(DownEmbedder),
            Some(Arc::new(LexicalReranker::new())),
            RetrievalConfig::default(),
        )
        .await;
        let request = RetrievalRequest::new("quantum flux capacitor", 10);
        let outcome = retriever.retrieve(&index, &request, &CancellationToken::new()).await.unwrap();

        assert!(outcome.candidates.is_empty());
        assert_eq!(outcome.provenance.empty_level, Some(IndexLevel::Document));
        assert!(outcome.provenance.reranking_skipped);
        assert!(outcome.provenance.late_interaction_skipped);
        assert_eq!(outcome.provenance.status_of(Stage::Rerank), Some(StageStatus::Skipped));
    }

    #[tokio::test]
    async fn test_cancelled_query() {
        let index = corpus();
        let retriever = orchestrator(&index, Arc::new(HashingEmbedder::new(DIM)), None, RetrievalConfig::default()).await;
        let token = CancellationToken::new();
        token.cancel();
        let result = retriever
            .retrieve(&index, &RetrievalRequest::new("grid", 5), &token)
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_stages_disabled_by_config() {
        let index = corpus();
        let config = RetrievalConfig {
            expansion_enabled: false,
            rerank_enabled: false,
            ..RetrievalConfig::default()
        };
        let retriever = orchestrator(
            &index,
            Arc::new(HashingEmbedder::new(DIM)),
            Some(Arc::new(LexicalReranker::new())),
            config,
        )
        .await;
        let outcome = retriever
            .retrieve(&index, &RetrievalRequest::new("GRID architecture", 10), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.provenance.expansion_skipped);
        assert!(outcome.provenance.reranking_skipped);
        assert_eq!(outcome.provenance.expanded_count, 0);
        assert!(outcome.candidates.iter().all(|c| c.hop_depth == 0));
    }
}

//! Hybrid retrieval combining dense and BM25 rankings
//!
//! Both rankings run concurrently over the same candidate pool and are
//! fused with RRF.

use super::{
    bm25::Bm25Scorer,
    fusion::RrfFusion,
    vector::{DenseRanking, DenseRetriever},
    RetrievalCandidate, StageScores,
};
use crate::index::{HierarchicalIndex, QueryProbe};
use lodestar_common::config::RetrievalConfig;
use lodestar_common::errors::{AppError, Result};
use lodestar_common::models::ChunkId;
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Fused candidates plus what each ranker contributed
#[derive(Debug, Default)]
pub struct HybridOutcome {
    /// Sorted by fused score (see [`RrfFusion::fuse`])
    pub candidates: Vec<RetrievalCandidate>,
    pub dense_count: usize,
    pub sparse_count: usize,
    /// The query had no embedding, so no dense ranking was possible
    pub dense_unavailable: bool,
    /// Vector store error that forced the snapshot fallback
    pub dense_fallback: Option<AppError>,
    /// Sparse ranking was not run (hybrid disabled)
    pub sparse_skipped: bool,
}

pub struct HybridSearch {
    dense: DenseRetriever,
    bm25: Bm25Scorer,
    fusion: RrfFusion,
    hybrid_enabled: bool,
}

impl HybridSearch {
    pub fn new(dense: DenseRetriever, config: &RetrievalConfig) -> Self {
        Self {
            dense,
            bm25: Bm25Scorer::from(config),
            fusion: RrfFusion::from(config),
            hybrid_enabled: config.hybrid_enabled,
        }
    }

    /// Dense and sparse rankings of `pool`, fused
    ///
    /// With hybrid disabled only the dense ranking is used, unless the query
    /// has no embedding, in which case BM25 stands in for it.
    pub async fn search(
        &self,
        index: &HierarchicalIndex,
        pool: &[usize],
        probe: &QueryProbe,
        cancel: &CancellationToken,
    ) -> Result<HybridOutcome> {
        let dense_unavailable = probe.embedding.is_empty();
        let run_sparse = self.hybrid_enabled || dense_unavailable;

        let sparse_task = async {
            if run_sparse {
                self.bm25.rank(index, pool, probe)
            } else {
                Vec::new()
            }
        };

        let (dense, sparse) = tokio::join!(self.dense.rank(index, pool, probe, cancel), sparse_task);
        let DenseRanking {
            ranked: dense,
            fallback_reason,
        } = dense?;

        let dense_ids: Vec<ChunkId> = dense.iter().map(|(id, _)| id.clone()).collect();
        let sparse_ids: Vec<ChunkId> = sparse.iter().map(|(id, _)| id.clone()).collect();
        let dense_scores: HashMap<&ChunkId, f32> = dense.iter().map(|(id, s)| (id, *s)).collect();
        let sparse_scores: HashMap<&ChunkId, f32> = sparse.iter().map(|(id, s)| (id, *s)).collect();

        let candidates = self
            .fusion
            .fuse(&dense_ids, &sparse_ids)
            .into_iter()
            .filter_map(|entry| {
                let idx = index.chunk_index(&entry.chunk_id)?;
                Some(RetrievalCandidate {
                    chunk: index.chunk(idx).chunk.clone(),
                    index: idx,
                    scores: StageScores {
                        dense: dense_scores.get(&entry.chunk_id).copied(),
                        sparse: sparse_scores.get(&entry.chunk_id).copied(),
                        fused: entry.score,
                        ..StageScores::default()
                    },
                    dense_rank: entry.dense_rank,
                    sparse_rank: entry.sparse_rank,
                    hop_depth: 0,
                    rank: 0,
                    relevance: 0.0,
                })
            })
            .collect();

        Ok(HybridOutcome {
            candidates,
            dense_count: dense.len(),
            sparse_count: sparse.len(),
            dense_unavailable,
            dense_fallback: fallback_reason,
            sparse_skipped: !run_sparse,
        })
    }
}

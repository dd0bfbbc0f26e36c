//! Reciprocal Rank Fusion (RRF) for combining rankings
//!
//! RRF needs no score normalization, so rankers with different score
//! distributions (cosine, BM25) combine cleanly:
//! `fused(d) = Σ_r w_r / (k + rank_r(d))`, summing only over rankers that
//! contain `d`, with 1-based ranks.

use lodestar_common::config::RetrievalConfig;
use lodestar_common::models::ChunkId;
use std::collections::HashMap;

/// RRF fusion parameters
#[derive(Debug, Clone)]
pub struct RrfFusion {
    /// Constant k (typically 60)
    pub k: f32,

    pub dense_weight: f32,

    pub sparse_weight: f32,
}

impl Default for RrfFusion {
    fn default() -> Self {
        Self {
            k: 60.0,
            dense_weight: 1.0,
            sparse_weight: 1.0,
        }
    }
}

impl From<&RetrievalConfig> for RrfFusion {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k: config.rrf_k,
            dense_weight: config.dense_weight,
            sparse_weight: config.sparse_weight,
        }
    }
}

/// One fused chunk
#[derive(Debug, Clone, PartialEq)]
pub struct FusedEntry {
    pub chunk_id: ChunkId,
    pub dense_rank: Option<usize>,
    pub sparse_rank: Option<usize>,
    pub score: f32,
}

impl RrfFusion {
    /// Fuse two ranked lists (best first)
    ///
    /// Output is sorted by fused score descending; ties go to the better
    /// dense rank (unranked last), then the smaller chunk id.
    pub fn fuse(&self, dense: &[ChunkId], sparse: &[ChunkId]) -> Vec<FusedEntry> {
        let mut ranks: HashMap<&ChunkId, (Option<usize>, Option<usize>)> = HashMap::new();

        for (rank, id) in dense.iter().enumerate() {
            ranks.entry(id).or_insert((None, None)).0.get_or_insert(rank + 1);
        }
        for (rank, id) in sparse.iter().enumerate() {
            ranks.entry(id).or_insert((None, None)).1.get_or_insert(rank + 1);
        }

        let mut results: Vec<FusedEntry> = ranks
            .into_iter()
            .map(|(id, (dense_rank, sparse_rank))| {
                let dense_rrf = dense_rank
                    .map(|r| self.dense_weight / (self.k + r as f32))
                    .unwrap_or(0.0);
                let sparse_rrf = sparse_rank
                    .map(|r| self.sparse_weight / (self.k + r as f32))
                    .unwrap_or(0.0);

                FusedEntry {
                    chunk_id: id.clone(),
                    dense_rank,
                    sparse_rank,
                    score: dense_rrf + sparse_rrf,
                }
            })
            .collect();

        results.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| {
                    a.dense_rank
                        .unwrap_or(usize::MAX)
                        .cmp(&b.dense_rank.unwrap_or(usize::MAX))
                })
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        results
    }
}

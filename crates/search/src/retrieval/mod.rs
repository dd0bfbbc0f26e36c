//! Multi-stage retrieval
//!
//! Stages, in order:
//! - Hybrid search: dense (vector store) and sparse (BM25) rankings over the
//!   hierarchical candidate pool, fused with RRF
//! - Multi-hop expansion along the cross-reference graph
//! - Cross-encoder reranking, then optional late-interaction MaxSim
//!
//! Every stage can be disabled by config and falls back to the previous
//! ordering when its provider fails. Skips and degradations are recorded in
//! [`RetrievalProvenance`].

mod bm25;
mod expansion;
mod fusion;
mod hybrid;
mod orchestrator;
mod rerank;
mod vector;

pub use bm25::Bm25Scorer;
pub use expansion::expand_candidates;
pub use fusion::{FusedEntry, RrfFusion};
pub use hybrid::{HybridOutcome, HybridSearch};
pub use orchestrator::RetrievalOrchestrator;
pub use rerank::{apply_cross_encoder, apply_late_interaction};
pub use vector::{DenseRanking, DenseRetriever};

use crate::index::IndexLevel;
use lodestar_common::errors::AppError;
use lodestar_common::metrics;
use lodestar_common::models::{Chunk, ChunkId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Scores a candidate collected along the pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct StageScores {
    pub dense: Option<f32>,
    pub sparse: Option<f32>,
    /// RRF score, or the decayed seed score for hop-discovered chunks
    pub fused: f32,
    pub reranked: Option<f32>,
    pub late_interaction: Option<f32>,
}

/// Chunk under consideration for one query
#[derive(Debug, Clone)]
pub struct RetrievalCandidate {
    pub chunk: Arc<Chunk>,
    /// Arena index in the snapshot the query runs against
    pub index: usize,
    pub scores: StageScores,
    /// 1-based rank in the dense list, if present
    pub dense_rank: Option<usize>,
    /// 1-based rank in the sparse list, if present
    pub sparse_rank: Option<usize>,
    /// 0 for directly retrieved chunks
    pub hop_depth: usize,
    /// 1-based final rank
    pub rank: usize,
    /// Normalized relevance in [0, 1] used downstream as the retrieval score
    pub relevance: f32,
}

impl RetrievalCandidate {
    pub fn id(&self) -> &ChunkId {
        &self.chunk.id
    }
}

/// Total order used after fusion and expansion: fused desc, dense rank asc
/// (unranked last), chunk id asc
pub(crate) fn fused_order(a: &RetrievalCandidate, b: &RetrievalCandidate) -> std::cmp::Ordering {
    b.scores
        .fused
        .total_cmp(&a.scores.fused)
        .then_with(|| rank_key(a.dense_rank).cmp(&rank_key(b.dense_rank)))
        .then_with(|| a.chunk.id.cmp(&b.chunk.id))
}

pub(crate) fn rank_key(rank: Option<usize>) -> usize {
    rank.unwrap_or(usize::MAX)
}

/// Sentence surfaced by the hierarchical funnel for a final candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedSentence {
    pub chunk_id: ChunkId,
    /// Byte offsets within the chunk text
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone)]
pub struct RetrievalRequest {
    pub query: String,
    /// Expanded query variants from query understanding
    pub expansions: Vec<String>,
    pub top_k: usize,
}

impl RetrievalRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            expansions: Vec::new(),
            top_k,
        }
    }

    pub fn with_expansions(mut self, expansions: Vec<String>) -> Self {
        self.expansions = expansions;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
    pub candidates: Vec<RetrievalCandidate>,
    pub sentences: Vec<RetrievedSentence>,
    pub provenance: RetrievalProvenance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    EmbedQuery,
    Hierarchical,
    Dense,
    Sparse,
    Fusion,
    Expansion,
    Rerank,
    LateInteraction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::EmbedQuery => "embed_query",
            Stage::Hierarchical => "hierarchical",
            Stage::Dense => "dense",
            Stage::Sparse => "sparse",
            Stage::Fusion => "fusion",
            Stage::Expansion => "expansion",
            Stage::Rerank => "rerank",
            Stage::LateInteraction => "late_interaction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Completed,
    /// Disabled by config or nothing to do
    Skipped,
    /// Provider failed or timed out; previous ordering kept
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub stage: Stage,
    pub status: StageStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// What happened during retrieval, reported with the response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalProvenance {
    pub index_version: u64,
    pub stages: Vec<StageRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_level: Option<IndexLevel>,
    pub reranking_skipped: bool,
    pub late_interaction_skipped: bool,
    pub expansion_skipped: bool,
    pub hybrid_degraded: bool,
    pub timed_out: bool,
    pub expanded_count: usize,
    /// Final-length order before reranking
    pub pre_rerank_order: Vec<ChunkId>,
}

impl RetrievalProvenance {
    pub(crate) fn record(&mut self, stage: Stage, status: StageStatus, detail: Option<String>, started: Instant) {
        let elapsed = started.elapsed();
        metrics::record_stage(stage.as_str(), elapsed.as_secs_f64());
        if status != StageStatus::Completed {
            let reason = match status {
                StageStatus::Skipped => "skipped",
                _ => "degraded",
            };
            metrics::record_degradation(stage.as_str(), reason);
        }
        self.stages.push(StageRecord {
            stage,
            status,
            detail,
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    /// Record a provider failure for a stage that then falls back
    pub(crate) fn degrade(&mut self, stage: Stage, error: &AppError, started: Instant) {
        if matches!(error, AppError::RetrievalTimeout { .. }) {
            self.timed_out = true;
        }
        warn!(stage = stage.as_str(), error = %error, "Retrieval stage degraded");
        self.record(stage, StageStatus::Degraded, Some(error.to_string()), started);
    }

    pub fn status_of(&self, stage: Stage) -> Option<StageStatus> {
        self.stages.iter().rev().find(|r| r.stage == stage).map(|r| r.status)
    }
}

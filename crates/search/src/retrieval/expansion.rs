//! Multi-hop expansion along the cross-reference graph
//!
//! The references of the top fused candidates are followed breadth-first up
//! to `max_depth` hops. A chunk reached this way that is not already a
//! candidate joins with `seed.fused × hop_decay^depth`; when several seeds
//! reach it, the best decayed score wins.

use super::{fused_order, RetrievalCandidate, StageScores};
use crate::index::HierarchicalIndex;
use lodestar_common::config::RetrievalConfig;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Add hop-discovered chunks to `candidates` and restore the fused order
///
/// Returns the number of chunks added (at most `max_expanded`).
pub fn expand_candidates(
    index: &HierarchicalIndex,
    candidates: &mut Vec<RetrievalCandidate>,
    config: &RetrievalConfig,
) -> usize {
    if config.max_depth == 0 || config.expansion_top_n == 0 {
        return 0;
    }

    let present: HashSet<usize> = candidates.iter().map(|c| c.index).collect();
    // chunk -> (score, depth)
    let mut discovered: HashMap<usize, (f32, usize)> = HashMap::new();

    for seed in candidates.iter().take(config.expansion_top_n) {
        for reached in index.graph().traverse(seed.index, config.max_depth) {
            if present.contains(&reached.chunk) {
                continue;
            }
            let score = seed.scores.fused * config.hop_decay.powi(reached.depth as i32);
            discovered
                .entry(reached.chunk)
                .and_modify(|(best, depth)| {
                    if score > *best {
                        *best = score;
                        *depth = reached.depth;
                    }
                })
                .or_insert((score, reached.depth));
        }
    }

    let mut added: Vec<RetrievalCandidate> = discovered
        .into_iter()
        .map(|(idx, (score, depth))| RetrievalCandidate {
            chunk: index.chunk(idx).chunk.clone(),
            index: idx,
            scores: StageScores {
                fused: score,
                ..StageScores::default()
            },
            dense_rank: None,
            sparse_rank: None,
            hop_depth: depth,
            rank: 0,
            relevance: 0.0,
        })
        .collect();
    added.sort_by(fused_order);
    added.truncate(config.max_expanded);

    let count = added.len();
    if count > 0 {
        debug!(added = count, max_depth = config.max_depth, "Multi-hop expansion");
        candidates.extend(added);
        candidates.sort_by(fused_order);
    }
    count
}

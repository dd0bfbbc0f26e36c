//! BM25 lexical ranking over the candidate pool
//!
//! Term statistics (document frequencies, average length) come from the
//! snapshot, so scores are comparable across queries on the same version.

use crate::index::{HierarchicalIndex, QueryProbe};
use lodestar_common::config::RetrievalConfig;
use lodestar_common::models::ChunkId;

/// Okapi BM25 scorer
#[derive(Debug, Clone, Copy)]
pub struct Bm25Scorer {
    pub k1: f32,
    pub b: f32,
}

impl Default for Bm25Scorer {
    fn default() -> Self {
        Self { k1: 1.2, b: 0.75 }
    }
}

impl From<&RetrievalConfig> for Bm25Scorer {
    fn from(config: &RetrievalConfig) -> Self {
        Self {
            k1: config.bm25_k1,
            b: config.bm25_b,
        }
    }
}

impl Bm25Scorer {
    /// BM25 score of one chunk; expansion terms count half
    pub fn score(&self, index: &HierarchicalIndex, chunk: usize, probe: &QueryProbe) -> f32 {
        let node = index.chunk(chunk);
        let stats = index.term_stats();
        let avg = if stats.average_length > 0.0 {
            stats.average_length
        } else {
            1.0
        };
        let norm = self.k1 * (1.0 - self.b + self.b * node.length as f32 / avg);

        let weighted = probe
            .terms
            .iter()
            .map(|t| (t, 1.0f32))
            .chain(probe.expansion_terms.iter().map(|t| (t, 0.5f32)));

        weighted
            .map(|(term, weight)| {
                let tf = node.term_freqs.get(term).copied().unwrap_or(0) as f32;
                if tf == 0.0 {
                    return 0.0;
                }
                weight * stats.idf(term) * tf * (self.k1 + 1.0) / (tf + norm)
            })
            .sum()
    }

    /// Rank pool members with a positive score, best first (ties by id)
    pub fn rank(&self, index: &HierarchicalIndex, pool: &[usize], probe: &QueryProbe) -> Vec<(ChunkId, f32)> {
        let mut ranked: Vec<(ChunkId, f32)> = pool
            .iter()
            .map(|&c| (index.chunk(c).chunk.id.clone(), self.score(index, c, probe)))
            .filter(|(_, score)| *score > 0.0)
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::test_support::{corpus, probe};

    #[test]
    fn test_rank_prefers_more_matching_terms() {
        let index = corpus();
        let pool: Vec<usize> = (0..index.chunk_count()).collect();
        let ranked = Bm25Scorer::default().rank(&index, &pool, &probe("GRID architecture"));

        // Three chunks mention GRID; only ARCHITECTURE.md also says architecture
        assert_eq!(ranked.len(), 3);
        let top = index.chunk_index(&ranked[0].0).unwrap();
        assert_eq!(index.chunk(top).chunk.path, "ARCHITECTURE.md");
        assert!(ranked.windows(2).all(|w| w[0].1 >= w[1].1));
    }

    #[test]
    fn test_no_overlap_scores_zero() {
        let index = corpus();
        let pool: Vec<usize> = (0..index.chunk_count()).collect();
        assert!(Bm25Scorer::default().rank(&index, &pool, &probe("quantum")).is_empty());
    }

    #[test]
    fn test_expansion_terms_count_half() {
        let index = corpus();
        let scorer = Bm25Scorer::default();
        let recipes = (0..index.chunk_count())
            .find(|&c| index.chunk(c).chunk.path == "recipes.md")
            .unwrap();
        let direct = scorer.score(&index, recipes, &QueryProbe::new("banana", &[], Vec::new()));
        let expanded = scorer.score(&index, recipes, &QueryProbe::new("cake", &["banana".to_string()], Vec::new()));
        assert!((expanded - 0.5 * direct).abs() < 1e-5);
    }
}

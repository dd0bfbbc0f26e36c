//! Lodestar search
//!
//! - [`index`]: the hierarchical, versioned index over chunked documents
//! - [`retrieval`]: hybrid search, multi-hop expansion and reranking on top
//!   of an index snapshot

pub mod index;
pub mod retrieval;

pub use index::{HierarchicalIndex, IndexEntry, IndexHandle, IndexLevel, IndexStats, QueryProbe};
pub use retrieval::{
    RetrievalCandidate, RetrievalOrchestrator, RetrievalOutcome, RetrievalProvenance, RetrievalRequest,
    RetrievedSentence, Stage, StageStatus,
};

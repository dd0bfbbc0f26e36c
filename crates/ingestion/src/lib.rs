//! Lodestar ingestion
//!
//! Turns `Document`s supplied by the ingestion collaborator into
//! quality-scored, embedded chunks ready for indexing.

pub mod chunker;

pub use chunker::{ChunkingEngine, ChunkingOutcome, ChunkingStrategy, PlannedChunk};

//! Lodestar Context Engine
//!
//! Turns a question into a cited answer over the indexed sources:
//! - Conversation-aware query reconstruction
//! - Query understanding (intent, entities, expansion)
//! - Single-pass or chain-of-retrieval over the hybrid search stages
//! - Evidence extraction with contradiction detection
//! - Reasoning chains and template or language-model synthesis
//!
//! [`QueryEngine`] is the entry point; [`http`] exposes it over axum.

pub mod conversation;
pub mod corag;
pub mod engine;
pub mod evidence;
pub mod http;
pub mod query_parser;
pub mod reasoner;
pub mod synthesizer;

pub use conversation::{ContextSource, ConversationManager, ReconstructedQuery};
pub use corag::{RetrievalChain, RetrievalHop, StopReason};
pub use engine::{AnswerRequest, EngineComponents, IndexReport, QueryEngine, RemovalReport, MAX_TOP_K};
pub use evidence::{Evidence, EvidenceSet, EvidenceStrength, EvidenceType};
pub use query_parser::{QueryIntent, QueryParser, QueryUnderstanding};
pub use reasoner::{ReasoningChain, ReasoningStep, StepKind};
pub use synthesizer::{Citation, ResponseMetadata, SourceRef, SynthesisMode, SynthesizedResponse};

//! Conversational context
//!
//! Each conversation keeps a short window of full-fidelity turns and a
//! buffer of summaries (key facts) for the turns that slid out of it.
//! Summaries are merged when the buffer is full, never dropped.
//!
//! Once `max_conversations` conversations hold a live window, the least
//! recent one is compacted: its window and summaries fold into a single
//! summary that still serves follow-ups. Only compacted conversations past
//! `max_compacted_conversations` are forgotten.
//!
//! `reconstruct_query` only ever appends to the current query: a follow-up
//! such as "how does it schedule jobs?" becomes
//! `how does it schedule jobs? (context: grid architecture)`.

use crate::query_parser::QueryIntent;
use chrono::{DateTime, Utc};
use lodestar_common::config::ConversationConfig;
use lodestar_common::text;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Topic terms appended to a reconstructed query
const MAX_CONTEXT_TERMS: usize = 5;

/// Topic terms kept per summary
const MAX_SUMMARY_TOPICS: usize = 12;

/// Key facts kept per summary
const MAX_SUMMARY_FACTS: usize = 6;

const MAX_FACT_CHARS: usize = 200;

/// Words that point back at an earlier turn
const ANAPHORA: &[&str] = &[
    "it", "its", "this", "that", "these", "those", "they", "them", "their", "there", "he", "she", "one",
];

/// Openers of elliptical follow-ups
const ELLIPSIS_OPENERS: &[&str] = &["and ", "what about", "how about", "also ", "same for", "then "];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub query: String,
    pub answer: String,
    pub timestamp: DateTime<Utc>,
    pub intent: QueryIntent,
    /// Key terms of the query
    pub topics: Vec<String>,
}

/// Key facts of turns that left the window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSummary {
    pub intents: Vec<QueryIntent>,
    pub topics: Vec<String>,
    pub key_facts: Vec<String>,
    /// Number of turns folded into this summary
    pub turns: usize,
    pub last_at: DateTime<Utc>,
}

impl TurnSummary {
    fn from_turn(turn: &ConversationTurn) -> Self {
        let mut topics = turn.topics.clone();
        topics.truncate(MAX_SUMMARY_TOPICS);
        Self {
            intents: vec![turn.intent],
            topics,
            key_facts: key_fact(&turn.answer).into_iter().collect(),
            turns: 1,
            last_at: turn.timestamp,
        }
    }

    /// Fold a newer summary into this one
    fn absorb(&mut self, newer: TurnSummary) {
        for intent in newer.intents {
            if !self.intents.contains(&intent) {
                self.intents.push(intent);
            }
        }
        // Newer topics and facts take precedence when trimming
        let mut topics = newer.topics;
        for topic in self.topics.drain(..) {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        topics.truncate(MAX_SUMMARY_TOPICS);
        self.topics = topics;

        let mut facts = newer.key_facts;
        facts.extend(self.key_facts.drain(..));
        facts.truncate(MAX_SUMMARY_FACTS);
        self.key_facts = facts;

        self.turns += newer.turns;
        self.last_at = newer.last_at;
    }
}

/// Where appended context came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    /// Nothing appended
    None,
    Window,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconstructedQuery {
    /// Always begins with the current query verbatim
    pub query: String,
    pub context_terms: Vec<String>,
    pub source: ContextSource,
}

impl ReconstructedQuery {
    fn unchanged(current: &str) -> Self {
        Self {
            query: current.to_string(),
            context_terms: Vec::new(),
            source: ContextSource::None,
        }
    }
}

#[derive(Debug, Default)]
struct Conversation {
    window: VecDeque<ConversationTurn>,
    summaries: VecDeque<TurnSummary>,
    /// Recency stamp from the manager's clock
    last_seen: u64,
}

impl Conversation {
    fn is_compacted(&self) -> bool {
        self.window.is_empty()
    }

    /// Fold the window and every summary into one summary, oldest first
    fn compact(&mut self) {
        let turns = self.window.drain(..).map(|t| TurnSummary::from_turn(&t));
        let mut folded: Option<TurnSummary> = None;
        for summary in self.summaries.drain(..).chain(turns) {
            match folded.as_mut() {
                Some(acc) => acc.absorb(summary),
                None => folded = Some(summary),
            }
        }
        self.summaries.extend(folded);
    }
}

/// Per-conversation history shared by all queries of an engine
pub struct ConversationManager {
    config: ConversationConfig,
    conversations: RwLock<HashMap<String, Conversation>>,
    clock: AtomicU64,
}

impl ConversationManager {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            conversations: RwLock::new(HashMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    /// Resolve references in `current` against the conversation history
    ///
    /// Context is only appended when the query refers back to an earlier
    /// turn (anaphora, ellipsis, or too few terms to stand alone). The
    /// source is the most recent window turn with the same intent, then the
    /// summary buffer, then the most recent turn.
    pub async fn reconstruct_query(
        &self,
        conversation_id: Option<&str>,
        current: &str,
        intent: QueryIntent,
    ) -> ReconstructedQuery {
        let Some(id) = conversation_id else {
            return ReconstructedQuery::unchanged(current);
        };
        if !needs_context(current) {
            return ReconstructedQuery::unchanged(current);
        }

        let conversations = self.conversations.read().await;
        let Some(conversation) = conversations.get(id) else {
            return ReconstructedQuery::unchanged(current);
        };

        let (topics, source) = if let Some(turn) = conversation.window.iter().rev().find(|t| t.intent == intent) {
            (turn.topics.clone(), ContextSource::Window)
        } else if let Some(summary) = conversation
            .summaries
            .iter()
            .rev()
            .find(|s| s.intents.contains(&intent))
            .or_else(|| conversation.summaries.back())
        {
            (summary.topics.clone(), ContextSource::Summary)
        } else if let Some(turn) = conversation.window.back() {
            (turn.topics.clone(), ContextSource::Window)
        } else {
            return ReconstructedQuery::unchanged(current);
        };

        let present: HashSet<String> = text::key_terms(current).into_iter().collect();
        let context_terms: Vec<String> = topics
            .into_iter()
            .filter(|t| !present.contains(t))
            .take(MAX_CONTEXT_TERMS)
            .collect();

        if context_terms.is_empty() {
            return ReconstructedQuery::unchanged(current);
        }

        let query = format!("{} (context: {})", current, context_terms.join(" "));
        debug!(conversation_id = id, source = ?source, query = %query, "Query reconstructed");
        ReconstructedQuery {
            query,
            context_terms,
            source,
        }
    }

    /// Record a finished turn, sliding the oldest out into a summary
    pub async fn record_turn(&self, conversation_id: &str, query: &str, answer: &str, intent: QueryIntent) {
        let now = Utc::now();
        let turn = ConversationTurn {
            query: query.to_string(),
            answer: answer.to_string(),
            timestamp: now,
            intent,
            topics: text::key_terms(query),
        };

        let mut conversations = self.conversations.write().await;
        let reopening = conversations.get(conversation_id).map_or(true, Conversation::is_compacted);
        if reopening {
            if !conversations.contains_key(conversation_id) {
                forget_compacted_over(&mut conversations, self.config.max_compacted_conversations);
            }
            let live = conversations.values().filter(|c| !c.is_compacted()).count();
            if live >= self.config.max_conversations.max(1) {
                compact_least_recent(&mut conversations);
            }
        }

        let conversation = conversations.entry(conversation_id.to_string()).or_default();
        conversation.last_seen = self.clock.fetch_add(1, Ordering::Relaxed);
        conversation.window.push_back(turn);

        while conversation.window.len() > self.config.window_size.max(1) {
            let Some(oldest) = conversation.window.pop_front() else {
                break;
            };
            conversation.summaries.push_back(TurnSummary::from_turn(&oldest));
        }

        while conversation.summaries.len() > self.config.max_summaries.max(1) {
            // Merge the two oldest summaries
            let (Some(mut oldest), Some(next)) = (conversation.summaries.pop_front(), conversation.summaries.pop_front())
            else {
                break;
            };
            oldest.absorb(next);
            conversation.summaries.push_front(oldest);
        }
    }

    /// Full-fidelity turns, oldest first
    pub async fn turns(&self, conversation_id: &str) -> Vec<ConversationTurn> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.window.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Summaries of turns that left the window, oldest first
    pub async fn summaries(&self, conversation_id: &str) -> Vec<TurnSummary> {
        self.conversations
            .read()
            .await
            .get(conversation_id)
            .map(|c| c.summaries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn conversation_count(&self) -> usize {
        self.conversations.read().await.len()
    }

    /// Conversations that still hold full-fidelity turns
    pub async fn live_conversation_count(&self) -> usize {
        self.conversations
            .read()
            .await
            .values()
            .filter(|c| !c.is_compacted())
            .count()
    }
}

fn compact_least_recent(conversations: &mut HashMap<String, Conversation>) {
    let oldest = conversations
        .iter_mut()
        .filter(|(_, c)| !c.is_compacted())
        .min_by_key(|(_, c)| c.last_seen);
    if let Some((id, conversation)) = oldest {
        debug!(conversation_id = %id, turns = conversation.window.len(), "Compacting least recent conversation");
        conversation.compact();
    }
}

/// Keep room for one more compacted conversation under `limit`
fn forget_compacted_over(conversations: &mut HashMap<String, Conversation>, limit: usize) {
    let compacted = conversations.values().filter(|c| c.is_compacted()).count();
    if compacted < limit.max(1) {
        return;
    }
    let oldest = conversations
        .iter()
        .filter(|(_, c)| c.is_compacted())
        .min_by_key(|(_, c)| c.last_seen)
        .map(|(id, _)| id.clone());
    if let Some(id) = oldest {
        debug!(conversation_id = %id, "Forgetting least recent compacted conversation");
        conversations.remove(&id);
    }
}

/// Whether the query leans on an earlier turn
fn needs_context(query: &str) -> bool {
    let lower = query.trim().to_lowercase();
    if ELLIPSIS_OPENERS.iter().any(|opener| lower.starts_with(opener)) {
        return true;
    }
    if text::tokenize(&lower).iter().any(|t| ANAPHORA.contains(&t.as_str())) {
        return true;
    }
    // A lone term ("and the workers?") cannot stand on its own
    text::key_terms(&lower).len() <= 1
}

/// First sentence of an answer, bounded
fn key_fact(answer: &str) -> Option<String> {
    let first = text::split_sentences(answer).into_iter().next()?;
    let fact: String = first.chars().take(MAX_FACT_CHARS).collect();
    Some(fact)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(window_size: usize, max_summaries: usize) -> ConversationManager {
        ConversationManager::new(ConversationConfig {
            window_size,
            max_summaries,
            max_conversations: 3,
            max_compacted_conversations: 2,
        })
    }

    #[tokio::test]
    async fn test_follow_up_gets_context_appended() {
        let manager = manager(5, 20);
        manager
            .record_turn("c1", "What is the GRID architecture?", "GRID has three layers.", QueryIntent::Architecture)
            .await;

        let current = "How does it schedule jobs?";
        let rebuilt = manager
            .reconstruct_query(Some("c1"), current, QueryIntent::Implementation)
            .await;

        assert!(rebuilt.query.starts_with(current));
        assert_eq!(rebuilt.query, "How does it schedule jobs? (context: grid architecture)");
        assert_eq!(rebuilt.source, ContextSource::Window);
    }

    #[tokio::test]
    async fn test_self_contained_query_is_unchanged() {
        let manager = manager(5, 20);
        manager
            .record_turn("c1", "What is the GRID architecture?", "Three layers.", QueryIntent::Architecture)
            .await;

        let current = "Which file defines the scheduler class?";
        let rebuilt = manager.reconstruct_query(Some("c1"), current, QueryIntent::Location).await;
        assert_eq!(rebuilt.query, current);
        assert_eq!(rebuilt.source, ContextSource::None);

        // Unknown conversation or none at all
        let rebuilt = manager.reconstruct_query(Some("other"), "and it?", QueryIntent::Other).await;
        assert_eq!(rebuilt.query, "and it?");
        let rebuilt = manager.reconstruct_query(None, "and it?", QueryIntent::Other).await;
        assert_eq!(rebuilt.source, ContextSource::None);
    }

    #[tokio::test]
    async fn test_matching_intent_is_preferred() {
        let manager = manager(5, 20);
        manager
            .record_turn("c1", "What is the GRID architecture?", "Layers.", QueryIntent::Architecture)
            .await;
        manager
            .record_turn("c1", "How do I install the client?", "Use pip.", QueryIntent::Usage)
            .await;

        let rebuilt = manager
            .reconstruct_query(Some("c1"), "And its layers?", QueryIntent::Architecture)
            .await;
        assert_eq!(rebuilt.context_terms, vec!["grid", "architecture"]);
    }

    #[tokio::test]
    async fn test_window_slides_into_summaries() {
        let manager = manager(2, 20);
        for (query, answer) in [
            ("What is the GRID scheduler?", "The scheduler assigns jobs. It runs hourly."),
            ("How do workers register?", "Workers register over HTTP."),
            ("Where is the queue defined?", "In queue.py."),
        ] {
            manager.record_turn("c1", query, answer, QueryIntent::Definition).await;
        }

        let turns = manager.turns("c1").await;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[0].query, "How do workers register?");

        let summaries = manager.summaries("c1").await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].key_facts, vec!["The scheduler assigns jobs."]);
        assert!(summaries[0].topics.contains(&"scheduler".to_string()));
    }

    #[tokio::test]
    async fn test_summaries_are_merged_not_dropped() {
        let manager = manager(1, 2);
        for i in 0..5 {
            manager
                .record_turn("c1", &format!("question about topic{}", i), &format!("Fact {}.", i), QueryIntent::Other)
                .await;
        }

        let summaries = manager.summaries("c1").await;
        assert_eq!(summaries.len(), 2);
        let folded: usize = summaries.iter().map(|s| s.turns).sum();
        assert_eq!(folded, 4);
        // The oldest fact survives the merge
        assert!(summaries[0].key_facts.contains(&"Fact 0.".to_string()));
    }

    #[tokio::test]
    async fn test_summary_buffer_is_used_when_window_has_no_match() {
        let manager = manager(1, 5);
        manager
            .record_turn("c1", "What is the GRID architecture?", "Layers.", QueryIntent::Architecture)
            .await;
        manager
            .record_turn("c1", "How do I install the client?", "Use pip.", QueryIntent::Usage)
            .await;

        let rebuilt = manager
            .reconstruct_query(Some("c1"), "What about its layers?", QueryIntent::Architecture)
            .await;
        assert_eq!(rebuilt.source, ContextSource::Summary);
        assert!(rebuilt.context_terms.contains(&"grid".to_string()));
    }

    #[tokio::test]
    async fn test_least_recent_conversation_is_compacted() {
        let manager = manager(5, 20);
        manager
            .record_turn("a", "What is the GRID architecture?", "GRID has three layers.", QueryIntent::Architecture)
            .await;
        manager
            .record_turn("a", "How do workers register?", "Workers register over HTTP.", QueryIntent::Implementation)
            .await;
        for id in ["b", "c", "d"] {
            manager.record_turn(id, "What is GRID?", "A scheduler.", QueryIntent::Definition).await;
        }

        assert_eq!(manager.live_conversation_count().await, 3);
        assert_eq!(manager.conversation_count().await, 4);
        assert!(manager.turns("a").await.is_empty());
        assert_eq!(manager.turns("d").await.len(), 1);

        let summaries = manager.summaries("a").await;
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].turns, 2);
        assert_eq!(
            summaries[0].key_facts,
            vec!["Workers register over HTTP.", "GRID has three layers."]
        );

        // The compacted history still answers follow-ups
        let rebuilt = manager
            .reconstruct_query(Some("a"), "And its layers?", QueryIntent::Architecture)
            .await;
        assert_eq!(rebuilt.source, ContextSource::Summary);
        assert!(rebuilt.context_terms.contains(&"grid".to_string()));
    }

    #[tokio::test]
    async fn test_reopened_conversation_keeps_its_summary() {
        let manager = manager(5, 20);
        for id in ["a", "b", "c", "d"] {
            manager.record_turn(id, "What is GRID?", "A scheduler.", QueryIntent::Definition).await;
        }
        manager
            .record_turn("a", "How do workers register?", "Over HTTP.", QueryIntent::Implementation)
            .await;

        // Reopening "a" compacted "b", the least recent live conversation
        assert_eq!(manager.turns("a").await.len(), 1);
        assert_eq!(manager.summaries("a").await.len(), 1);
        assert!(manager.turns("b").await.is_empty());
        assert_eq!(manager.live_conversation_count().await, 3);
    }

    #[tokio::test]
    async fn test_compacted_conversations_are_bounded() {
        let manager = manager(5, 20);
        for id in ["a", "b", "c", "d", "e", "f"] {
            manager.record_turn(id, "What is GRID?", "A scheduler.", QueryIntent::Definition).await;
        }

        // Three live plus at most two compacted
        assert_eq!(manager.live_conversation_count().await, 3);
        assert_eq!(manager.conversation_count().await, 5);
        assert!(manager.summaries("a").await.is_empty());
        assert_eq!(manager.summaries("b").await.len(), 1);
    }
}

//! # Memory-Augmented Request Pipeline
//!
//! Bidirectional enhancement stage around every request:
//!
//! - **enhance** retrieves semantically relevant records across the
//!   request's dataset hierarchy and prepends a `## Relevant Knowledge:`
//!   block to the system context, bounded by `max_context_injection` and
//!   dropped entirely when it would overflow the upstream's context
//!   window - user content is never truncated to make room;
//! - **ingest** extracts entities and relations from the exchange back
//!   into the store, asynchronously and best-effort;
//! - **feedback** adjusts a record's relevance, clamped to `[0, 1]`.
//!
//! The user-visible path never depends on the store being live: an
//! unreachable store turns the whole pipeline into a no-op with a warning
//! event.

pub mod extract;
pub mod graph;
pub mod store;

use crate::embedding::SharedEmbedder;
use crate::events::{tracing_sink, SharedSink};
use crate::models::{estimate_tokens, ChatRequest, ChatResponse, Message, Role};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use store::{MemoryRecord, MemoryStore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use store::{InMemoryStore, MemoryError, MemoryMatch};

pub const KNOWLEDGE_HEADER: &str = "## Relevant Knowledge:";

#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Top-k hits retrieved per request
    pub top_k: usize,
    /// Minimum blended score for a hit to be injected
    pub relevance_threshold: f64,
    /// Ceiling on injected characters
    pub max_context_injection: usize,
    /// Default dataset hierarchy when the request names none
    pub default_datasets: Vec<String>,
    /// Record TTL enforced by the compaction task
    pub record_ttl: Duration,
    pub compaction_interval: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            relevance_threshold: 0.7,
            max_context_injection: 2048,
            default_datasets: vec!["default".to_string()],
            record_ttl: Duration::from_secs(7 * 24 * 60 * 60),
            compaction_interval: Duration::from_secs(15 * 60),
        }
    }
}

pub struct MemoryPipeline {
    store: Arc<dyn MemoryStore>,
    embedder: SharedEmbedder,
    config: MemoryConfig,
    events: SharedSink,
}

impl MemoryPipeline {
    pub fn new(
        store: Arc<dyn MemoryStore>,
        embedder: SharedEmbedder,
        config: MemoryConfig,
    ) -> Self {
        Self {
            store,
            embedder,
            config,
            events: tracing_sink(),
        }
    }

    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    /// Enrich a request with retrieved context. Infallible by policy: any
    /// store or embedder failure returns the request unchanged.
    pub async fn enhance(
        &self,
        request: ChatRequest,
        upstream_max_context: Option<u32>,
    ) -> ChatRequest {
        let Some(query) = last_user_content(&request) else {
            return request;
        };

        let embedding = match self.embedder.embed(&query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                self.events
                    .warning("memory.enhance_skipped", &format!("embedding failed: {e}"));
                return request;
            }
        };

        let datasets = request
            .extra_params
            .as_ref()
            .and_then(|p| p.datasets.clone())
            .unwrap_or_else(|| self.config.default_datasets.clone());

        // Fan out across the hierarchy, merge by score
        let mut matches: Vec<MemoryMatch> = Vec::new();
        for dataset in &datasets {
            match self
                .store
                .search(dataset, &embedding, self.config.top_k)
                .await
            {
                Ok(found) => matches.extend(found),
                Err(e) => {
                    self.events
                        .warning("memory.enhance_skipped", &format!("store search failed: {e}"));
                    return request;
                }
            }
        }
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.retain(|m| m.score >= self.config.relevance_threshold);
        matches.truncate(self.config.top_k);

        if matches.is_empty() {
            return request;
        }

        // Assemble the injection block, highest scores first; items that
        // would overflow the character budget are dropped, never trimmed
        // mid-fact.
        let mut block = String::from(KNOWLEDGE_HEADER);
        for m in &matches {
            let line = format!("\n- {}", m.record.content);
            if block.len() + line.len() > self.config.max_context_injection {
                break;
            }
            block.push_str(&line);
        }
        if block.len() <= KNOWLEDGE_HEADER.len() {
            return request;
        }

        // If the enhanced prompt would not fit the upstream's declared
        // window, drop the enhancement entirely.
        if let Some(max_context) = upstream_max_context {
            let existing: u32 = request
                .messages
                .iter()
                .map(|m| estimate_tokens(&m.content))
                .sum();
            if existing + estimate_tokens(&block) > max_context {
                self.events.warning(
                    "memory.enhance_dropped",
                    "enhancement would exceed the provider context window",
                );
                return request;
            }
        }

        let mut enhanced = request;
        enhanced.messages.insert(0, Message::system(block));
        enhanced
    }

    /// Extract entities/relations from the exchange into the store. Spawns
    /// a background task; failures are warnings, never surfaced.
    pub fn ingest(&self, request: &ChatRequest, response: &ChatResponse) {
        let store = self.store.clone();
        let embedder = self.embedder.clone();
        let events = self.events.clone();
        let dataset = request
            .extra_params
            .as_ref()
            .and_then(|p| p.datasets.as_ref())
            .and_then(|d| d.first().cloned())
            .unwrap_or_else(|| {
                self.config
                    .default_datasets
                    .first()
                    .cloned()
                    .unwrap_or_else(|| "default".to_string())
            });

        let user_content = last_user_content(request).unwrap_or_default();
        let answer = response.content().to_string();

        tokio::spawn(async move {
            let content = if user_content.is_empty() {
                answer.clone()
            } else {
                format!("{user_content} => {answer}")
            };
            let embedding = match embedder.embed(&content).await {
                Ok(embedding) => embedding,
                Err(e) => {
                    events.warning("memory.ingest_dropped", &format!("embedding failed: {e}"));
                    return;
                }
            };

            let mut entities = extract::extract_entities(&user_content);
            entities.extend(extract::extract_entities(&answer));
            entities.dedup();
            let mut relations = extract::extract_relations(&user_content);
            relations.extend(extract::extract_relations(&answer));

            let record = MemoryRecord {
                id: Uuid::new_v4(),
                dataset,
                content,
                embedding,
                entities,
                relations,
                relevance: 0.5,
                created_at: Utc::now(),
                last_accessed_at: Utc::now(),
            };
            if let Err(e) = store.insert(record).await {
                events.warning("memory.ingest_dropped", &format!("store insert failed: {e}"));
            }
        });
    }

    /// Adjust a record's relevance; the score is clamped to `[0, 1]`.
    pub async fn feedback(&self, record_id: Uuid, score: f64, text: Option<&str>) {
        if let Some(text) = text {
            tracing::debug!(record = %record_id, feedback = text, "memory feedback note");
        }
        if let Err(e) = self
            .store
            .adjust_relevance(record_id, score.clamp(0.0, 1.0))
            .await
        {
            self.events
                .warning("memory.feedback_dropped", &format!("adjust failed: {e}"));
        }
    }

    /// Background TTL compaction.
    pub fn spawn_compaction(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let ttl = self.config.record_ttl;
        let interval = self.config.compaction_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                match store.compact(ttl).await {
                    Ok(removed) if removed > 0 => {
                        tracing::debug!(removed, "memory compaction pass");
                    }
                    _ => {}
                }
            }
        })
    }
}

fn last_user_content(request: &ChatRequest) -> Option<String> {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == Role::User)
        .map(|m| m.content.clone())
}

//! Memory store seam and the in-process reference implementation.
//!
//! Production deployments put a real vector/graph/relational stack behind
//! [`MemoryStore`] (the endpoints arrive as opaque URLs); the in-memory
//! implementation backs tests and single-node runs.

use crate::embedding::cosine_similarity;
use crate::memory::graph::KnowledgeGraph;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// The store cannot be reached; the pipeline degrades to a no-op
    #[error("memory store unavailable: {message}")]
    Unavailable { message: String },

    #[error("memory record not found")]
    NotFound,

    #[error("memory store internal error: {message}")]
    Internal { message: String },
}

/// One remembered fact.
#[derive(Debug, Clone)]
pub struct MemoryRecord {
    pub id: Uuid,
    pub dataset: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub entities: Vec<String>,
    /// (subject, predicate, object)
    pub relations: Vec<(String, String, String)>,
    pub relevance: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
}

/// A retrieval match: value copy of the record plus the query similarity.
#[derive(Debug, Clone)]
pub struct MemoryMatch {
    pub record: MemoryRecord,
    pub similarity: f32,
    /// Blend of similarity and stored relevance used for ranking
    pub score: f64,
}

#[async_trait::async_trait]
pub trait MemoryStore: Send + Sync {
    /// Top-k records of one dataset ranked against the query embedding.
    async fn search(
        &self,
        dataset: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<MemoryMatch>, MemoryError>;

    async fn insert(&self, record: MemoryRecord) -> Result<(), MemoryError>;

    /// Clamp-adjust a record's relevance to `[0, 1]`.
    async fn adjust_relevance(&self, id: Uuid, relevance: f64) -> Result<(), MemoryError>;

    /// Drop records older than `ttl`; returns how many were removed.
    async fn compact(&self, ttl: Duration) -> Result<usize, MemoryError>;
}

/// In-process store: per-dataset record lists plus one shared knowledge
/// graph fed by every ingested relation.
#[derive(Default)]
pub struct InMemoryStore {
    datasets: DashMap<String, Vec<MemoryRecord>>,
    graph: Mutex<KnowledgeGraph>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct graph access for status endpoints and tests.
    pub fn with_graph<R>(&self, f: impl FnOnce(&KnowledgeGraph) -> R) -> R {
        f(&self.graph.lock().unwrap())
    }

    pub fn record_count(&self) -> usize {
        self.datasets.iter().map(|d| d.len()).sum()
    }
}

#[async_trait::async_trait]
impl MemoryStore for InMemoryStore {
    async fn search(
        &self,
        dataset: &str,
        embedding: &[f32],
        k: usize,
    ) -> Result<Vec<MemoryMatch>, MemoryError> {
        let Some(records) = self.datasets.get(dataset) else {
            return Ok(Vec::new());
        };
        let mut matches: Vec<MemoryMatch> = records
            .iter()
            .map(|record| {
                let similarity = cosine_similarity(embedding, &record.embedding);
                MemoryMatch {
                    score: similarity as f64 * 0.7 + record.relevance * 0.3,
                    similarity,
                    record: record.clone(),
                }
            })
            .collect();
        matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        matches.truncate(k);
        Ok(matches)
    }

    async fn insert(&self, record: MemoryRecord) -> Result<(), MemoryError> {
        {
            let mut graph = self.graph.lock().unwrap();
            for entity in &record.entities {
                graph.upsert_entity(entity);
            }
            for (subject, predicate, object) in &record.relations {
                graph.add_relation(subject, predicate, object);
            }
        }
        self.datasets
            .entry(record.dataset.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    async fn adjust_relevance(&self, id: Uuid, relevance: f64) -> Result<(), MemoryError> {
        for mut dataset in self.datasets.iter_mut() {
            if let Some(record) = dataset.iter_mut().find(|r| r.id == id) {
                record.relevance = relevance.clamp(0.0, 1.0);
                record.last_accessed_at = Utc::now();
                return Ok(());
            }
        }
        Err(MemoryError::NotFound)
    }

    async fn compact(&self, ttl: Duration) -> Result<usize, MemoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut removed = 0;
        for mut dataset in self.datasets.iter_mut() {
            let before = dataset.len();
            dataset.retain(|r| r.created_at >= cutoff);
            removed += before - dataset.len();
        }
        self.graph.lock().unwrap().compact();
        Ok(removed)
    }
}

/// Store stub that always fails; exercises the pipeline's no-op policy.
pub struct UnreachableStore;

#[async_trait::async_trait]
impl MemoryStore for UnreachableStore {
    async fn search(
        &self,
        _dataset: &str,
        _embedding: &[f32],
        _k: usize,
    ) -> Result<Vec<MemoryMatch>, MemoryError> {
        Err(MemoryError::Unavailable {
            message: "store offline".to_string(),
        })
    }

    async fn insert(&self, _record: MemoryRecord) -> Result<(), MemoryError> {
        Err(MemoryError::Unavailable {
            message: "store offline".to_string(),
        })
    }

    async fn adjust_relevance(&self, _id: Uuid, _relevance: f64) -> Result<(), MemoryError> {
        Err(MemoryError::Unavailable {
            message: "store offline".to_string(),
        })
    }

    async fn compact(&self, _ttl: Duration) -> Result<usize, MemoryError> {
        Err(MemoryError::Unavailable {
            message: "store offline".to_string(),
        })
    }
}

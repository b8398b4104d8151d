//! # Semantic Cache
//!
//! Embedding-keyed nearest-neighbor reuse of completed responses. Entries
//! are bucketed by embedding model id - a vector produced by one model is
//! never compared against a consumer using another - then ranked by cosine
//! similarity inside the bucket. A single top candidate is served iff its
//! similarity clears the threshold (default 0.85).
//!
//! Eviction is `lru_with_relevance`: the LRU ordering of an `LruCache`
//! supplies recency, and the evictee is the lowest
//! `α·recency + β·hits + γ·similarity_at_last_hit` among the oldest
//! candidates. TTL-expired entries are dropped lazily at lookup and
//! eagerly by the compaction sweep (default every 5 minutes).

use crate::embedding::cosine_similarity;
use crate::events::{tracing_sink, SharedSink};
use crate::models::ChatResponse;
use dashmap::DashMap;
use lru::LruCache;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct SemanticCacheConfig {
    pub similarity_threshold: f32,
    pub max_entries: usize,
    pub ttl: Duration,
    pub compaction_interval: Duration,
    /// Relevance weights: α recency, β hits, γ similarity at last hit
    pub recency_weight: f64,
    pub hit_weight: f64,
    pub similarity_weight: f64,
}

impl Default for SemanticCacheConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.85,
            max_entries: 1000,
            ttl: Duration::from_secs(3600),
            compaction_interval: Duration::from_secs(300),
            recency_weight: 0.5,
            hit_weight: 0.3,
            similarity_weight: 0.2,
        }
    }
}

/// One cached response and its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub embedding: Vec<f32>,
    pub query: String,
    pub response: ChatResponse,
    pub metadata: HashMap<String, String>,
    pub hits: u64,
    pub created_at: Instant,
    pub last_hit_at: Instant,
    pub expires_at: Instant,
    pub similarity_at_last_hit: f32,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    fn relevance(&self, config: &SemanticCacheConfig, ttl: Duration) -> f64 {
        let age = self.last_hit_at.elapsed().as_secs_f64();
        let horizon = ttl.as_secs_f64().max(1.0);
        let recency = (1.0 - age / horizon).clamp(0.0, 1.0);
        let hits = (self.hits as f64 / 10.0).min(1.0);
        config.recency_weight * recency
            + config.hit_weight * hits
            + config.similarity_weight * self.similarity_at_last_hit as f64
    }
}

/// A served hit: value copy of the entry plus the lookup similarity.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub response: ChatResponse,
    pub fingerprint: String,
    pub similarity: f32,
    /// Embedding model that produced both sides of the comparison
    pub embedding_model: String,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

/// Criteria accepted by `invalidate`.
#[derive(Debug, Clone)]
pub enum InvalidateCriteria {
    Fingerprint(String),
    EmbeddingModel(String),
    All,
}

struct Bucket {
    entries: Mutex<LruCache<String, CacheEntry>>,
}

pub struct SemanticCache {
    config: SemanticCacheConfig,
    /// One bucket per embedding model id
    buckets: DashMap<String, Arc<Bucket>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    events: SharedSink,
}

impl SemanticCache {
    pub fn new(config: SemanticCacheConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            events: tracing_sink(),
        }
    }

    fn bucket(&self, embedding_model: &str) -> Arc<Bucket> {
        self.buckets
            .entry(embedding_model.to_string())
            .or_insert_with(|| {
                Arc::new(Bucket {
                    entries: Mutex::new(LruCache::unbounded()),
                })
            })
            .clone()
    }

    /// Deterministic fingerprint over the query text and embedding model.
    pub fn fingerprint(embedding_model: &str, query: &str) -> String {
        let mut hasher = DefaultHasher::new();
        embedding_model.hash(&mut hasher);
        query.hash(&mut hasher);
        format!("sem:{:x}", hasher.finish())
    }

    /// Nearest-neighbor lookup within the model's bucket.
    pub fn get(&self, embedding_model: &str, embedding: &[f32]) -> Option<CacheHit> {
        let bucket = self.bucket(embedding_model);
        let mut entries = bucket.entries.lock().unwrap();

        // Lazy TTL removal on the way through
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, e)| e.is_expired())
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        self.expirations
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        let best = entries
            .iter()
            .map(|(key, entry)| (key.clone(), cosine_similarity(embedding, &entry.embedding)))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        match best {
            Some((key, similarity)) if similarity >= self.config.similarity_threshold => {
                // `get` promotes the entry, keeping LRU order aligned with
                // last_hit_at
                let entry = entries.get_mut(&key).expect("winner still present");
                entry.hits += 1;
                entry.last_hit_at = Instant::now();
                entry.similarity_at_last_hit = similarity;
                let hit = CacheHit {
                    response: entry.response.clone(),
                    fingerprint: entry.fingerprint.clone(),
                    similarity,
                    embedding_model: embedding_model.to_string(),
                };
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(hit)
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert a response; evicts the least relevant entry when full.
    pub fn put(
        &self,
        embedding_model: &str,
        embedding: Vec<f32>,
        query: &str,
        response: ChatResponse,
        metadata: HashMap<String, String>,
    ) {
        let fingerprint = Self::fingerprint(embedding_model, query);
        let now = Instant::now();
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            embedding,
            query: query.to_string(),
            response,
            metadata,
            hits: 0,
            created_at: now,
            last_hit_at: now,
            expires_at: now + self.config.ttl,
            similarity_at_last_hit: 1.0,
        };

        let bucket = self.bucket(embedding_model);
        let mut entries = bucket.entries.lock().unwrap();
        entries.put(fingerprint, entry);

        while entries.len() > self.config.max_entries {
            // LRU tail supplies the eviction candidates; the least relevant
            // of the oldest quarter goes first.
            let tail_len = (entries.len() / 4).max(1);
            let victim = entries
                .iter()
                .rev()
                .take(tail_len)
                .min_by(|a, b| {
                    let ra = a.1.relevance(&self.config, self.config.ttl);
                    let rb = b.1.relevance(&self.config, self.config.ttl);
                    ra.partial_cmp(&rb).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    entries.pop(&key);
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, criteria: InvalidateCriteria) -> usize {
        match criteria {
            InvalidateCriteria::Fingerprint(fingerprint) => {
                let mut removed = 0;
                for bucket in self.buckets.iter() {
                    if bucket.entries.lock().unwrap().pop(&fingerprint).is_some() {
                        removed += 1;
                    }
                }
                removed
            }
            InvalidateCriteria::EmbeddingModel(model) => self
                .buckets
                .remove(&model)
                .map(|(_, bucket)| bucket.entries.lock().unwrap().len())
                .unwrap_or(0),
            InvalidateCriteria::All => {
                let mut removed = 0;
                for bucket in self.buckets.iter() {
                    let mut entries = bucket.entries.lock().unwrap();
                    removed += entries.len();
                    entries.clear();
                }
                removed
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self
                .buckets
                .iter()
                .map(|b| b.entries.lock().unwrap().len())
                .sum(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
        }
    }

    /// Eager TTL sweep; normally driven by [`spawn_compaction`].
    pub fn compact(&self) -> usize {
        let mut removed = 0;
        for bucket in self.buckets.iter() {
            let mut entries = bucket.entries.lock().unwrap();
            let expired: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.is_expired())
                .map(|(k, _)| k.clone())
                .collect();
            for key in &expired {
                entries.pop(key);
            }
            removed += expired.len();
        }
        self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        if removed > 0 {
            self.events.event(
                "cache.compaction",
                &[("removed", &removed.to_string())],
            );
        }
        removed
    }
}

/// Background compaction sweep.
pub fn spawn_compaction(
    cache: Arc<SemanticCache>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let interval = cache.config.compaction_interval;
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }
            cache.compact();
        }
    })
}

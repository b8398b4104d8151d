//! # Embedding Seam
//!
//! The semantic cache, the memory pipeline and the consensus metric all
//! consume embeddings through the [`Embedder`] trait. Production wires a
//! provider-backed embedder; tests and offline deployments use the
//! deterministic trigram embedder, which needs no upstream at all.
//!
//! The embedder's `model_id` is part of every cache bucket key - vectors
//! from different models are never compared.

use crate::error::ProviderError;
use crate::models::{EmbeddingInput, EmbeddingRequest};
use crate::providers::ProviderAdapter;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[async_trait::async_trait]
pub trait Embedder: Send + Sync {
    /// Identifier of the embedding model; part of cache bucket keys.
    fn model_id(&self) -> &str;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError>;
}

pub type SharedEmbedder = Arc<dyn Embedder>;

/// Embedder backed by a provider adapter's embeddings endpoint.
pub struct ProviderEmbedder {
    adapter: Arc<dyn ProviderAdapter>,
    model: String,
}

impl ProviderEmbedder {
    pub fn new(adapter: Arc<dyn ProviderAdapter>, model: impl Into<String>) -> Self {
        Self {
            adapter,
            model: model.into(),
        }
    }
}

#[async_trait::async_trait]
impl Embedder for ProviderEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        let response = self
            .adapter
            .embed(EmbeddingRequest {
                model: self.model.clone(),
                input: EmbeddingInput::String(text.to_string()),
            })
            .await?;
        response
            .data
            .into_iter()
            .next()
            .map(|e| e.embedding)
            .ok_or(ProviderError::Transport {
                message: "embedding response was empty".to_string(),
            })
    }
}

/// Deterministic local embedder: character trigrams hashed into a fixed
/// number of buckets, L2-normalized. Similar texts land on similar
/// vectors, identical texts on identical ones - enough for cache
/// similarity and consensus distance without an upstream call.
pub struct TrigramEmbedder {
    dims: usize,
    model: String,
}

impl TrigramEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            model: format!("trigram-{dims}"),
        }
    }
}

impl Default for TrigramEmbedder {
    fn default() -> Self {
        Self::new(256)
    }
}

#[async_trait::async_trait]
impl Embedder for TrigramEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        Ok(trigram_vector(text, self.dims))
    }
}

pub fn trigram_vector(text: &str, dims: usize) -> Vec<f32> {
    let mut vector = vec![0f32; dims.max(1)];
    let normalized: Vec<char> = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();

    if normalized.len() < 3 {
        if let Some(slot) = vector.get_mut(normalized.len() % dims.max(1)) {
            *slot = 1.0;
        }
        return vector;
    }

    for window in normalized.windows(3) {
        let mut hasher = DefaultHasher::new();
        window.hash(&mut hasher);
        let slot = (hasher.finish() as usize) % vector.len();
        vector[slot] += 1.0;
    }

    l2_normalize(&mut vector);
    vector
}

fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Cosine similarity in [-1, 1]; 0 for mismatched or empty vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.is_empty() || a.len() != b.len() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Levenshtein distance normalized to [0, 1] by the longer length.
/// Fallback distance when no embedder is reachable.
pub fn normalized_levenshtein(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 0.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0usize; b.len() + 1];

    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution
                .min(previous[j + 1] + 1)
                .min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }

    previous[b.len()] as f64 / longest as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn identical_texts_embed_identically() {
        let embedder = TrigramEmbedder::default();
        let a = embedder.embed("What is the capital of France?").await.unwrap();
        let b = embedder.embed("What is the capital of France?").await.unwrap();
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn similar_texts_are_closer_than_unrelated_ones() {
        let embedder = TrigramEmbedder::default();
        let base = embedder.embed("What is the capital of France?").await.unwrap();
        let near = embedder.embed("Capital of France?").await.unwrap();
        let far = embedder
            .embed("How do I configure a Kubernetes ingress controller?")
            .await
            .unwrap();
        assert!(cosine_similarity(&base, &near) > cosine_similarity(&base, &far));
    }

    #[test]
    fn cosine_handles_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 2.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn levenshtein_normalization_bounds() {
        assert_eq!(normalized_levenshtein("", ""), 0.0);
        assert_eq!(normalized_levenshtein("abc", "abc"), 0.0);
        assert_eq!(normalized_levenshtein("abc", "xyz"), 1.0);
        let partial = normalized_levenshtein("kitten", "sitting");
        assert!(partial > 0.0 && partial < 1.0);
    }
}

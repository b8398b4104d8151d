use criterion::{black_box, criterion_group, criterion_main, Criterion};
use helixagent_ensemble::embedding::{cosine_similarity, normalized_levenshtein, trigram_vector};
use helixagent_ensemble::models::{ChatResponse, Choice, Message};
use helixagent_ensemble::semantic_cache::{SemanticCache, SemanticCacheConfig};
use std::collections::HashMap;

fn response(content: &str) -> ChatResponse {
    ChatResponse {
        id: "bench".to_string(),
        object: "chat.completion".to_string(),
        created: 0,
        model: "bench".to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::assistant(content),
            finish_reason: Some("stop".to_string()),
        }],
        usage: None,
    }
}

fn bench_embeddings(c: &mut Criterion) {
    let text = "What is the capital of France and how many people live there?";
    c.bench_function("trigram_vector_256", |b| {
        b.iter(|| trigram_vector(black_box(text), 256))
    });

    let a = trigram_vector(text, 256);
    let other = trigram_vector("Capital of France?", 256);
    c.bench_function("cosine_similarity_256", |b| {
        b.iter(|| cosine_similarity(black_box(&a), black_box(&other)))
    });

    c.bench_function("normalized_levenshtein", |b| {
        b.iter(|| normalized_levenshtein(black_box(text), black_box("Capital of France?")))
    });
}

fn bench_cache_lookup(c: &mut Criterion) {
    let cache = SemanticCache::new(SemanticCacheConfig::default());
    for i in 0..500 {
        let query = format!("query number {i}");
        let embedding = trigram_vector(&query, 256);
        cache.put(
            "bench-model",
            embedding,
            &query,
            response("answer"),
            HashMap::new(),
        );
    }
    let probe = trigram_vector("query number 250", 256);

    c.bench_function("semantic_cache_get_500", |b| {
        b.iter(|| cache.get(black_box("bench-model"), black_box(&probe)))
    });
}

criterion_group!(benches, bench_embeddings, bench_cache_lookup);
criterion_main!(benches);

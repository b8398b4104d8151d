//! Consensus and confidence math.
//!
//! The consensus score is `1 − normalized semantic distance` between the
//! Synthesizer's turns in successive rounds - cosine over embeddings when
//! an embedder answers, normalized Levenshtein otherwise. Confidence is a
//! weighted arithmetic mean of up to four components (consensus,
//! validation pass-rate, response quality, polish delta); components that
//! did not run are omitted and the remaining weights renormalized, so a
//! single-round debate is not dragged down by a bootstrap zero.

use crate::embedding::{cosine_similarity, normalized_levenshtein, SharedEmbedder};

const CONSENSUS_WEIGHT: f64 = 0.30;
const VALIDATION_WEIGHT: f64 = 0.25;
const QUALITY_WEIGHT: f64 = 0.25;
const POLISH_WEIGHT: f64 = 0.20;

/// Semantic similarity of two texts in `[0, 1]`. Identical strings
/// short-circuit to exactly 1 so agreement of echoing providers is not
/// subject to float noise.
pub async fn semantic_similarity(embedder: &SharedEmbedder, a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    match (embedder.embed(a).await, embedder.embed(b).await) {
        (Ok(va), Ok(vb)) => (cosine_similarity(&va, &vb) as f64).clamp(0.0, 1.0),
        _ => 1.0 - normalized_levenshtein(a, b),
    }
}

/// Inter-round consensus: similarity of successive Synthesizer turns.
/// Bootstraps to 0 when there is no previous round.
pub async fn consensus_score(
    embedder: &SharedEmbedder,
    previous: Option<&str>,
    current: &str,
) -> f64 {
    match previous {
        Some(previous) => semantic_similarity(embedder, previous, current).await,
        None => 0.0,
    }
}

/// Confidence inputs; `None` marks a component that did not run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConfidenceInputs {
    pub consensus: Option<f64>,
    pub validation_pass_rate: Option<f64>,
    pub response_quality: Option<f64>,
    pub polish_delta: Option<f64>,
}

/// Weighted arithmetic mean over the components that ran, weights
/// renormalized to the present set. Empty input yields 0.
pub fn aggregate_confidence(inputs: ConfidenceInputs) -> f64 {
    let components = [
        (CONSENSUS_WEIGHT, inputs.consensus),
        (VALIDATION_WEIGHT, inputs.validation_pass_rate),
        (QUALITY_WEIGHT, inputs.response_quality),
        (POLISH_WEIGHT, inputs.polish_delta),
    ];

    let mut weight_sum = 0.0;
    let mut value_sum = 0.0;
    for (weight, value) in components {
        if let Some(value) = value {
            weight_sum += weight;
            value_sum += weight * value.clamp(0.0, 1.0);
        }
    }

    if weight_sum == 0.0 {
        0.0
    } else {
        value_sum / weight_sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TrigramEmbedder;
    use std::sync::Arc;

    fn embedder() -> SharedEmbedder {
        Arc::new(TrigramEmbedder::default())
    }

    #[tokio::test]
    async fn identical_synth_turns_reach_full_consensus() {
        let score = consensus_score(&embedder(), Some("the answer is 4"), "the answer is 4").await;
        assert_eq!(score, 1.0);
    }

    #[tokio::test]
    async fn first_round_bootstraps_to_zero() {
        let score = consensus_score(&embedder(), None, "anything").await;
        assert_eq!(score, 0.0);
    }

    #[tokio::test]
    async fn diverging_turns_score_low() {
        let close = consensus_score(
            &embedder(),
            Some("the capital of France is Paris"),
            "Paris is the capital of France",
        )
        .await;
        let far = consensus_score(
            &embedder(),
            Some("the capital of France is Paris"),
            "use a B-tree for range scans",
        )
        .await;
        assert!(close > far);
    }

    #[test]
    fn missing_components_renormalize() {
        // Quality alone: confidence equals the quality value
        let confidence = aggregate_confidence(ConfidenceInputs {
            response_quality: Some(0.9),
            ..Default::default()
        });
        assert!((confidence - 0.9).abs() < 1e-9);
    }

    #[test]
    fn all_components_blend_with_default_weights() {
        let confidence = aggregate_confidence(ConfidenceInputs {
            consensus: Some(1.0),
            validation_pass_rate: Some(1.0),
            response_quality: Some(1.0),
            polish_delta: Some(0.0),
        });
        // 0.30 + 0.25 + 0.25 over a total weight of 1.0
        assert!((confidence - 0.80).abs() < 1e-9);
    }

    #[test]
    fn empty_inputs_yield_zero() {
        assert_eq!(aggregate_confidence(ConfidenceInputs::default()), 0.0);
    }

    #[test]
    fn out_of_range_components_are_clamped() {
        let confidence = aggregate_confidence(ConfidenceInputs {
            response_quality: Some(7.0),
            ..Default::default()
        });
        assert_eq!(confidence, 1.0);
    }
}

//! # Provider Scoring
//!
//! Each provider carries a composite score in `[0, 10]` built from five
//! components: speed, efficiency, cost, capability and recency. The router
//! sorts its eligible pool by this composite. Component weights are
//! validated to sum to 1 within 10⁻³ at configuration time.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SCORE_MAX: f64 = 10.0;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// Weights for the five score components. Must sum to 1.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub speed: f64,
    pub efficiency: f64,
    pub cost: f64,
    pub capability: f64,
    pub recency: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            speed: 0.25,
            efficiency: 0.20,
            cost: 0.25,
            capability: 0.20,
            recency: 0.10,
        }
    }
}

impl ScoreWeights {
    /// Reject weight sets that do not sum to 1 ± 10⁻³.
    pub fn validate(&self) -> Result<(), String> {
        let sum = self.speed + self.efficiency + self.cost + self.capability + self.recency;
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(format!(
                "scoring weights must sum to 1.0 (±{WEIGHT_SUM_TOLERANCE}), got {sum}"
            ));
        }
        if [
            self.speed,
            self.efficiency,
            self.cost,
            self.capability,
            self.recency,
        ]
        .iter()
        .any(|w| *w < 0.0)
        {
            return Err("scoring weights must be non-negative".to_string());
        }
        Ok(())
    }
}

/// Per-provider score components, each in `[0, 10]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderScore {
    pub speed: f64,
    pub efficiency: f64,
    pub cost: f64,
    pub capability: f64,
    pub recency: f64,
    pub composite: f64,
}

impl ProviderScore {
    fn compute(weights: &ScoreWeights, inputs: &ScoreInputs) -> Self {
        let speed = latency_score(inputs.p50_latency);
        let efficiency = inputs.success_rate.clamp(0.0, 1.0) * SCORE_MAX;
        let cost = cost_score(inputs.cost_per_million_tokens);
        let capability = inputs.verification_overall.clamp(0.0, 1.0) * SCORE_MAX;
        let recency = recency_score(inputs.since_last_success);

        let composite = (weights.speed * speed
            + weights.efficiency * efficiency
            + weights.cost * cost
            + weights.capability * capability
            + weights.recency * recency)
            .clamp(0.0, SCORE_MAX);

        Self {
            speed,
            efficiency,
            cost,
            capability,
            recency,
            composite,
        }
    }
}

/// Raw observations feeding a score update.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub p50_latency: Duration,
    /// Rolling success rate in [0, 1]
    pub success_rate: f64,
    /// Blended input/output price in USD per million tokens
    pub cost_per_million_tokens: f64,
    /// Latest verification overall in [0, 1]
    pub verification_overall: f64,
    /// Time since the last successful call; `None` means never
    pub since_last_success: Option<Duration>,
}

/// Sub-second medians score 10; the score decays to 0 at 30 s.
fn latency_score(latency: Duration) -> f64 {
    let ms = latency.as_millis() as f64;
    if ms <= 1_000.0 {
        return SCORE_MAX;
    }
    let ceiling = 30_000.0;
    ((ceiling - ms.min(ceiling)) / (ceiling - 1_000.0)) * SCORE_MAX
}

/// Free providers score 10; the score decays to 0 at $100 per million.
fn cost_score(per_million: f64) -> f64 {
    let ceiling = 100.0;
    ((ceiling - per_million.clamp(0.0, ceiling)) / ceiling) * SCORE_MAX
}

/// Full marks within five minutes of a success, decaying to 0 after a day.
fn recency_score(since: Option<Duration>) -> f64 {
    let Some(since) = since else { return 0.0 };
    let secs = since.as_secs() as f64;
    if secs <= 300.0 {
        return SCORE_MAX;
    }
    let ceiling = 86_400.0;
    ((ceiling - secs.min(ceiling)) / (ceiling - 300.0)) * SCORE_MAX
}

/// Shared scoreboard: single writer per provider (whoever observed the
/// inputs), snapshot reads for the router.
pub struct ScoreBoard {
    weights: ScoreWeights,
    scores: DashMap<String, ProviderScore>,
}

impl ScoreBoard {
    pub fn new(weights: ScoreWeights) -> Result<Self, String> {
        weights.validate()?;
        Ok(Self {
            weights,
            scores: DashMap::new(),
        })
    }

    pub fn weights(&self) -> ScoreWeights {
        self.weights
    }

    /// Recompute a provider's score from fresh observations.
    pub fn update(&self, provider_id: &str, inputs: ScoreInputs) -> ProviderScore {
        let score = ProviderScore::compute(&self.weights, &inputs);
        self.scores.insert(provider_id.to_string(), score);
        score
    }

    /// Composite for ranking; unseen providers sit mid-scale so a fresh
    /// provider is neither first pick nor starved.
    pub fn composite(&self, provider_id: &str) -> f64 {
        self.scores
            .get(provider_id)
            .map(|s| s.composite)
            .unwrap_or(SCORE_MAX / 2.0)
    }

    pub fn get(&self, provider_id: &str) -> Option<ProviderScore> {
        self.scores.get(provider_id).map(|s| *s)
    }

    /// Best-first ranking, ties broken by id for determinism.
    pub fn top(&self, limit: usize) -> Vec<(String, ProviderScore)> {
        let mut entries: Vec<(String, ProviderScore)> = self
            .scores
            .iter()
            .map(|e| (e.key().clone(), *e.value()))
            .collect();
        entries.sort_by(|a, b| {
            b.1.composite
                .partial_cmp(&a.1.composite)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        entries.truncate(limit);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_weights_sum_to_one() {
        ScoreWeights::default().validate().unwrap();
    }

    #[test]
    fn drifted_weights_are_rejected() {
        let weights = ScoreWeights {
            speed: 0.5,
            efficiency: 0.5,
            cost: 0.5,
            capability: 0.0,
            recency: 0.0,
        };
        assert!(weights.validate().is_err());
    }

    #[test]
    fn tolerance_allows_tiny_drift() {
        let weights = ScoreWeights {
            speed: 0.2505,
            efficiency: 0.20,
            cost: 0.25,
            capability: 0.20,
            recency: 0.0998,
        };
        weights.validate().unwrap();
    }

    #[test]
    fn composite_stays_in_range() {
        let board = ScoreBoard::new(ScoreWeights::default()).unwrap();
        let score = board.update(
            "fast-cheap",
            ScoreInputs {
                p50_latency: Duration::from_millis(200),
                success_rate: 1.0,
                cost_per_million_tokens: 0.0,
                verification_overall: 1.0,
                since_last_success: Some(Duration::from_secs(10)),
            },
        );
        assert!(score.composite > 9.0 && score.composite <= SCORE_MAX);

        let score = board.update(
            "slow-broken",
            ScoreInputs {
                p50_latency: Duration::from_secs(60),
                success_rate: 0.0,
                cost_per_million_tokens: 500.0,
                verification_overall: 0.0,
                since_last_success: None,
            },
        );
        assert!(score.composite >= 0.0 && score.composite < 1.0);
    }

    #[test]
    fn top_ranking_is_deterministic_on_ties() {
        let board = ScoreBoard::new(ScoreWeights::default()).unwrap();
        let inputs = ScoreInputs {
            p50_latency: Duration::from_millis(100),
            success_rate: 1.0,
            cost_per_million_tokens: 1.0,
            verification_overall: 0.9,
            since_last_success: Some(Duration::from_secs(1)),
        };
        board.update("bravo", inputs);
        board.update("alpha", inputs);
        let top = board.top(2);
        assert_eq!(top[0].0, "alpha");
        assert_eq!(top[1].0, "bravo");
    }

    #[test]
    fn unseen_provider_scores_mid_scale() {
        let board = ScoreBoard::new(ScoreWeights::default()).unwrap();
        assert_eq!(board.composite("nobody"), 5.0);
    }
}

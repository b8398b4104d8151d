//! Per-turn quality scoring.
//!
//! A turn's score blends three signals: content length inside the
//! configured band, presence of role-appropriate markers, and absence of
//! assistant boilerplate. Turns under the threshold force a re-roll
//! against the role's fallback provider.

use crate::debate::session::DebateRole;
use serde::{Deserialize, Serialize};

const LENGTH_WEIGHT: f64 = 0.4;
const MARKER_WEIGHT: f64 = 0.2;
const BOILERPLATE_WEIGHT: f64 = 0.4;

const BOILERPLATE_MARKERS: [&str; 5] = [
    "as an ai",
    "as a language model",
    "i cannot assist",
    "i'm sorry, but",
    "i am unable to",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityConfig {
    pub min_len: usize,
    pub max_len: usize,
    pub threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_len: 1,
            max_len: 6000,
            threshold: 0.5,
        }
    }
}

fn role_markers(role: DebateRole) -> &'static [&'static str] {
    match role {
        DebateRole::Analyst => &["analy", "fact", "evidence", "context", "observ", "constraint"],
        DebateRole::Proposer => &["propos", "recommend", "suggest", "solution", "answer", "approach"],
        DebateRole::Critic => &["concern", "issue", "risk", "flaw", "however", "weakness"],
        DebateRole::Synthesizer => &["synthes", "combin", "overall", "consensus", "summary", "together"],
        DebateRole::Mediator => &["final", "conclu", "resol", "verdict", "position", "agree"],
    }
}

/// Score a turn's content in `[0, 1]`.
pub fn score_turn(role: DebateRole, content: &str, config: &QualityConfig) -> f64 {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return 0.0;
    }

    let len = trimmed.len();
    let length_score = if len < config.min_len {
        len as f64 / config.min_len as f64
    } else if len > config.max_len {
        config.max_len as f64 / len as f64
    } else {
        1.0
    };

    let lower = trimmed.to_lowercase();
    let marker_hits = role_markers(role)
        .iter()
        .filter(|m| lower.contains(*m))
        .count();
    let marker_score = (marker_hits as f64 / 2.0).min(1.0);

    let boilerplate_score = if BOILERPLATE_MARKERS.iter().any(|m| lower.contains(m)) {
        0.0
    } else {
        1.0
    };

    LENGTH_WEIGHT * length_score
        + MARKER_WEIGHT * marker_score
        + BOILERPLATE_WEIGHT * boilerplate_score
}

//! Debate session state: roles, phases, turns, and the transcript
//! invariants.

use crate::error::EnsembleError;
use crate::registry::RegisteredProvider;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// The five debate roles, in dispatch and transcript order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebateRole {
    Analyst,
    Proposer,
    Critic,
    Synthesizer,
    Mediator,
}

impl DebateRole {
    pub const ALL: [DebateRole; 5] = [
        DebateRole::Analyst,
        DebateRole::Proposer,
        DebateRole::Critic,
        DebateRole::Synthesizer,
        DebateRole::Mediator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DebateRole::Analyst => "analyst",
            DebateRole::Proposer => "proposer",
            DebateRole::Critic => "critic",
            DebateRole::Synthesizer => "synthesizer",
            DebateRole::Mediator => "mediator",
        }
    }

    /// Position in dispatch and transcript order.
    pub fn order(&self) -> usize {
        Self::ALL.iter().position(|r| r == self).unwrap_or(0)
    }
}

/// Multi-pass validation phases, strictly ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DebatePhase {
    Initial,
    Validate,
    Polish,
    Final,
    Done,
}

/// Theatrical streaming styles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DebateStyle {
    Theater,
    Novel,
    Screenplay,
    #[default]
    Minimal,
}

impl DebateStyle {
    pub fn parse(s: &str) -> DebateStyle {
        match s {
            "theater" => DebateStyle::Theater,
            "novel" => DebateStyle::Novel,
            "screenplay" => DebateStyle::Screenplay,
            _ => DebateStyle::Minimal,
        }
    }
}

/// One participant's output in one round. Immutable once appended.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub round: u32,
    pub role: DebateRole,
    pub content: String,
    pub provider_used: String,
    #[serde(with = "duration_millis")]
    pub latency: Duration,
    pub quality_score: f64,
    pub emitted_at: DateTime<Utc>,
}

mod duration_millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

/// A role bound to its ordered provider chain for the session's lifetime.
/// The `Arc` handles pin the providers: a provider turning inadmissible
/// mid-session does not unbind it.
#[derive(Clone)]
#[derive(Debug)]
pub struct BoundParticipant {
    pub role: DebateRole,
    /// `[primary, fallback₁, …]`; never empty
    pub chain: Vec<Arc<RegisteredProvider>>,
    pub weight: f64,
    pub temperature: f32,
    pub quality_threshold: f64,
}

/// Debate configuration, resolved from server defaults plus per-request
/// `extra_params`.
#[derive(Debug, Clone)]
pub struct DebateConfig {
    pub rounds_max: u32,
    pub consensus_threshold: f64,
    pub min_confidence: f64,
    pub enable_multi_pass_validation: bool,
    pub min_confidence_to_skip: f64,
    pub max_validation_rounds: u32,
    pub validate_timeout: Duration,
    pub polish_timeout: Duration,
    pub participant_timeout: Duration,
    pub max_fallbacks: usize,
    pub style: DebateStyle,
}

impl Default for DebateConfig {
    fn default() -> Self {
        Self {
            rounds_max: 3,
            consensus_threshold: 0.75,
            min_confidence: 0.8,
            enable_multi_pass_validation: false,
            min_confidence_to_skip: 0.9,
            max_validation_rounds: 3,
            validate_timeout: Duration::from_secs(120),
            polish_timeout: Duration::from_secs(60),
            participant_timeout: Duration::from_secs(60),
            max_fallbacks: 4,
            style: DebateStyle::Minimal,
        }
    }
}

impl DebateConfig {
    /// Overlay per-request extras on the server defaults.
    pub fn with_extra_params(mut self, extra: Option<&crate::models::ExtraParams>) -> Self {
        let Some(extra) = extra else { return self };
        if let Some(rounds) = extra.rounds {
            self.rounds_max = rounds.max(1);
        }
        if let Some(enabled) = extra.enable_multi_pass_validation {
            self.enable_multi_pass_validation = enabled;
        }
        if let Some(style) = &extra.style {
            self.style = DebateStyle::parse(style);
        }
        if let Some(validation) = &extra.validation_config {
            if let Some(rounds) = validation
                .get("max_validation_rounds")
                .and_then(|v| v.as_u64())
            {
                self.max_validation_rounds = rounds.max(1) as u32;
            }
            if let Some(skip) = validation
                .get("min_confidence_to_skip")
                .and_then(|v| v.as_f64())
            {
                self.min_confidence_to_skip = skip;
            }
        }
        self
    }
}

/// Aggregate statistics returned alongside the consensus.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DebateStats {
    pub rounds_completed: u32,
    pub rejected_turns: u32,
    pub retries: u32,
    pub issues_found: u32,
    pub issues_resolved: u32,
    pub skipped_phases: u32,
    pub initial_confidence: f64,
    pub final_confidence: f64,
    /// Provider that served each role in the last round
    pub provider_used: HashMap<String, String>,
}

/// The orchestrator's return value.
#[derive(Debug, Clone, Serialize)]
pub struct DebateOutcome {
    pub consensus: String,
    pub confidence: f64,
    pub consensus_score: f64,
    pub transcript: Vec<Turn>,
    pub stats: DebateStats,
    pub phase: DebatePhase,
    /// False for the soft no-consensus result
    pub reached: bool,
}

/// Mutable state of one debate, request-scoped.
#[derive(Debug)]
pub struct DebateSession {
    pub id: Uuid,
    pub topic: String,
    pub style: DebateStyle,
    pub rounds_max: u32,
    pub participants: Vec<BoundParticipant>,
    pub round_idx: u32,
    transcript: Vec<Turn>,
    pub consensus: f64,
    pub confidence: f64,
    phase: DebatePhase,
    pub created_at: DateTime<Utc>,
}

impl DebateSession {
    /// Exactly five roles, one participant each, in role order.
    pub fn new(
        topic: impl Into<String>,
        config: &DebateConfig,
        participants: Vec<BoundParticipant>,
    ) -> Result<Self, EnsembleError> {
        let roles: Vec<DebateRole> = participants.iter().map(|p| p.role).collect();
        if roles != DebateRole::ALL {
            return Err(EnsembleError::Internal {
                message: format!("debate requires the five roles in order, got {roles:?}"),
            });
        }
        if participants.iter().any(|p| p.chain.is_empty()) {
            return Err(EnsembleError::Internal {
                message: "every participant needs at least one provider".to_string(),
            });
        }
        Ok(Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            style: config.style,
            rounds_max: config.rounds_max,
            participants,
            round_idx: 0,
            transcript: Vec::new(),
            consensus: 0.0,
            confidence: 0.0,
            phase: DebatePhase::Initial,
            created_at: Utc::now(),
        })
    }

    pub fn phase(&self) -> DebatePhase {
        self.phase
    }

    pub fn transcript(&self) -> &[Turn] {
        &self.transcript
    }

    /// Close a round: turns are reordered into role order and re-stamped so
    /// `round` and `emitted_at` stay monotonically non-decreasing no matter
    /// which participant finished first.
    pub fn append_round(&mut self, round: u32, mut turns: Vec<Turn>) -> Result<(), EnsembleError> {
        if round < self.round_idx {
            return Err(EnsembleError::Internal {
                message: format!("round {round} appended after round {}", self.round_idx),
            });
        }
        turns.sort_by_key(|t| t.role.order());
        let stamp = Utc::now();
        for mut turn in turns {
            turn.round = round;
            turn.emitted_at = stamp;
            self.transcript.push(turn);
        }
        self.round_idx = round;
        Ok(())
    }

    /// Phases only ever move forward; skipping over a phase is a forward
    /// move too.
    pub fn advance_phase(&mut self, next: DebatePhase) -> Result<(), EnsembleError> {
        if next <= self.phase {
            return Err(EnsembleError::Internal {
                message: format!("phase cannot move {:?} -> {next:?}", self.phase),
            });
        }
        self.phase = next;
        Ok(())
    }

    /// All turns of one round, in role order.
    pub fn round_turns(&self, round: u32) -> Vec<&Turn> {
        self.transcript.iter().filter(|t| t.round == round).collect()
    }

    pub fn synthesizer_turn(&self, round: u32) -> Option<&Turn> {
        self.transcript
            .iter()
            .find(|t| t.round == round && t.role == DebateRole::Synthesizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(round: u32, role: DebateRole) -> Turn {
        Turn {
            round,
            role,
            content: format!("{} speaks", role.as_str()),
            provider_used: "mock".to_string(),
            latency: Duration::from_millis(10),
            quality_score: 0.9,
            emitted_at: Utc::now(),
        }
    }

    fn participants() -> Vec<BoundParticipant> {
        // Sessions under test never dereference the chain, so an empty
        // registry handle list is built through the orchestrator tests;
        // here we only exercise transcript mechanics with a stub chain.
        Vec::new()
    }

    #[test]
    fn five_roles_are_required() {
        let err = DebateSession::new("t", &DebateConfig::default(), participants()).unwrap_err();
        assert!(matches!(err, EnsembleError::Internal { .. }));
    }

    #[test]
    fn rounds_are_reordered_into_role_order() {
        let mut session = session_with_roles();
        let out_of_order = vec![
            turn(1, DebateRole::Mediator),
            turn(1, DebateRole::Analyst),
            turn(1, DebateRole::Synthesizer),
            turn(1, DebateRole::Proposer),
            turn(1, DebateRole::Critic),
        ];
        session.append_round(1, out_of_order).unwrap();
        let roles: Vec<DebateRole> = session.transcript().iter().map(|t| t.role).collect();
        assert_eq!(roles, DebateRole::ALL.to_vec());
    }

    #[test]
    fn emitted_at_is_monotonic_across_rounds() {
        let mut session = session_with_roles();
        session.append_round(1, vec![turn(1, DebateRole::Analyst)]).unwrap();
        session.append_round(2, vec![turn(2, DebateRole::Analyst)]).unwrap();
        let transcript = session.transcript();
        assert!(transcript[0].emitted_at <= transcript[1].emitted_at);
        assert!(transcript[0].round <= transcript[1].round);
    }

    #[test]
    fn stale_round_is_rejected() {
        let mut session = session_with_roles();
        session.append_round(2, vec![turn(2, DebateRole::Analyst)]).unwrap();
        assert!(session.append_round(1, vec![turn(1, DebateRole::Analyst)]).is_err());
    }

    #[test]
    fn phases_only_advance_forward() {
        let mut session = session_with_roles();
        session.advance_phase(DebatePhase::Validate).unwrap();
        session.advance_phase(DebatePhase::Final).unwrap(); // skipping Polish is forward
        assert!(session.advance_phase(DebatePhase::Polish).is_err());
        session.advance_phase(DebatePhase::Done).unwrap();
    }

    /// Session with the five roles and empty chains, for transcript tests
    /// only.
    fn session_with_roles() -> DebateSession {
        let participants = DebateRole::ALL
            .iter()
            .map(|role| BoundParticipant {
                role: *role,
                chain: vec![dummy_provider(role.as_str())],
                weight: 1.0,
                temperature: 0.7,
                quality_threshold: 0.5,
            })
            .collect();
        DebateSession::new("topic", &DebateConfig::default(), participants).unwrap()
    }

    fn dummy_provider(name: &str) -> Arc<RegisteredProvider> {
        futures::executor::block_on(async {
            let registry = crate::registry::test_support::registry_with(vec![
                crate::registry::test_support::StaticAdapter::answering(name, "x"),
            ])
            .await;
            registry.get(name).unwrap()
        })
    }

    #[test]
    fn style_parsing_defaults_to_minimal() {
        assert_eq!(DebateStyle::parse("theater"), DebateStyle::Theater);
        assert_eq!(DebateStyle::parse("unknown"), DebateStyle::Minimal);
    }

    #[test]
    fn extra_params_overlay_defaults() {
        let extra = crate::models::ExtraParams {
            rounds: Some(1),
            enable_multi_pass_validation: Some(true),
            style: Some("screenplay".to_string()),
            validation_config: Some(serde_json::json!({"max_validation_rounds": 2})),
            datasets: None,
        };
        let config = DebateConfig::default().with_extra_params(Some(&extra));
        assert_eq!(config.rounds_max, 1);
        assert!(config.enable_multi_pass_validation);
        assert_eq!(config.style, DebateStyle::Screenplay);
        assert_eq!(config.max_validation_rounds, 2);
    }
}

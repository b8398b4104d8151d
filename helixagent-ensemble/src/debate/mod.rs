//! # Debate Orchestrator
//!
//! Multi-round, role-based deliberation across the provider federation.
//! Each round dispatches the five roles (Analyst → Proposer → Critic →
//! Synthesizer → Mediator) in parallel, reorders their turns into role
//! order at round close, measures inter-round convergence on the
//! Synthesizer's output, and terminates early once consensus and
//! confidence clear their thresholds.
//!
//! With multi-pass validation enabled the round loop becomes the *Initial*
//! phase of a four-phase state machine: *Validate* (every participant
//! annotates the candidate), *Polish* (the Synthesizer rewrites while
//! issues remain), and *Final* (the Mediator emits the consensus). Phases
//! are skipped, never revisited, when the going confidence already clears
//! `min_confidence_to_skip`.

pub mod consensus;
pub mod prompts;
pub mod quality;
pub mod session;
pub mod streaming;

use crate::context::RequestContext;
use crate::embedding::SharedEmbedder;
use crate::error::{EnsembleError, ProviderError};
use crate::events::{tracing_sink, SharedSink};
use crate::models::{ChatRequest, Message, Role};
use crate::providers::CapabilityRequirements;
use crate::registry::ProviderRegistry;
use crate::router::{call_chain, RetryPolicy};
use consensus::{aggregate_confidence, semantic_similarity, ConfidenceInputs};
use quality::QualityConfig;
use session::{
    BoundParticipant, DebateConfig, DebateOutcome, DebatePhase, DebateRole, DebateSession,
    DebateStats, Turn,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::Instrument;

pub use session::{DebateStyle, Turn as DebateTurn};
pub use streaming::{TheatricalChunk, TheatricalStream};

/// Per-role sampling temperature: exploratory early roles, conservative
/// closing roles.
fn role_temperature(role: DebateRole) -> f32 {
    match role {
        DebateRole::Analyst => 0.3,
        DebateRole::Proposer => 0.7,
        DebateRole::Critic => 0.6,
        DebateRole::Synthesizer => 0.4,
        DebateRole::Mediator => 0.2,
    }
}

pub struct DebateOrchestrator {
    pub(crate) registry: Arc<ProviderRegistry>,
    pub(crate) embedder: SharedEmbedder,
    pub(crate) events: SharedSink,
    pub(crate) retry_policy: RetryPolicy,
    pub(crate) quality: QualityConfig,
    pub(crate) defaults: DebateConfig,
}

impl DebateOrchestrator {
    pub fn new(registry: Arc<ProviderRegistry>, embedder: SharedEmbedder) -> Self {
        Self {
            registry,
            embedder,
            events: tracing_sink(),
            retry_policy: RetryPolicy::default(),
            quality: QualityConfig::default(),
            defaults: DebateConfig::default(),
        }
    }

    pub fn with_events(mut self, events: SharedSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn with_quality(mut self, quality: QualityConfig) -> Self {
        self.quality = quality;
        self
    }

    pub fn with_defaults(mut self, defaults: DebateConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn defaults(&self) -> &DebateConfig {
        &self.defaults
    }

    /// Resolve the effective config for a request.
    pub fn config_for(&self, request: &ChatRequest) -> DebateConfig {
        self.defaults
            .clone()
            .with_extra_params(request.extra_params.as_ref())
    }

    /// Bind each role to an ordered `[primary, fallbacks…]` chain picked by
    /// score from the eligible pool. Fixed for the session's lifetime: the
    /// chains hold `Arc` handles, so a provider going inadmissible
    /// mid-session stays pinned.
    pub fn bind_participants(
        &self,
        config: &DebateConfig,
    ) -> Result<Vec<BoundParticipant>, EnsembleError> {
        let pool = self
            .registry
            .eligible_pool(&CapabilityRequirements::default(), &HashSet::new());
        if pool.is_empty() {
            return Err(EnsembleError::NoEligibleProvider {
                message: "debate requires at least one admissible provider".to_string(),
            });
        }

        let participants = DebateRole::ALL
            .iter()
            .enumerate()
            .map(|(i, role)| {
                // Rotate the pool per role so the ensemble spreads across
                // providers instead of piling onto the top scorer.
                let mut chain = Vec::with_capacity(1 + config.max_fallbacks);
                for offset in 0..pool.len().min(1 + config.max_fallbacks) {
                    chain.push(pool[(i + offset) % pool.len()].clone());
                }
                BoundParticipant {
                    role: *role,
                    chain,
                    weight: 1.0,
                    temperature: role_temperature(*role),
                    quality_threshold: self.quality.threshold,
                }
            })
            .collect();
        Ok(participants)
    }

    /// Run a debate to completion.
    ///
    /// Fails with `NoEligibleProvider` before the first round when the pool
    /// is empty, `Timeout` when the request deadline expires (no partial
    /// transcript is returned as final), and `NoConsensus` only when no
    /// synthesis was produced at all; rounds exhausting below the
    /// consensus threshold return a soft outcome with `reached = false`.
    #[tracing::instrument(name = "debate", skip_all, fields(request_id = %ctx.id()))]
    pub async fn run(
        &self,
        request: &ChatRequest,
        config: DebateConfig,
        ctx: &RequestContext,
    ) -> Result<DebateOutcome, EnsembleError> {
        let topic = debate_topic(request);
        let participants = self.bind_participants(&config)?;
        let mut session = DebateSession::new(topic, &config, participants)?;
        let mut stats = DebateStats::default();

        let mut consensus_score = 0.0;
        let mut confidence = 0.0;
        let mut response_quality = None;

        for round in 1..=config.rounds_max {
            if ctx.is_cancelled() {
                return Err(EnsembleError::Timeout);
            }

            let round_result = self
                .run_round(&session, round, &config, ctx, &mut stats)
                .await?;
            session.append_round(round, round_result)?;
            stats.rounds_completed = round;

            let turns = session.round_turns(round);
            stats.provider_used = turns
                .iter()
                .map(|t| (t.role.as_str().to_string(), t.provider_used.clone()))
                .collect();

            // Inter-round consensus on the Synthesizer's turns
            let current_synth = session
                .synthesizer_turn(round)
                .map(|t| t.content.clone());
            let previous_synth = (round > 1)
                .then(|| session.synthesizer_turn(round - 1).map(|t| t.content.clone()))
                .flatten();
            if let Some(current) = &current_synth {
                consensus_score = consensus::consensus_score(
                    &self.embedder,
                    previous_synth.as_deref(),
                    current,
                )
                .await;
            }
            session.consensus = consensus_score;

            response_quality = self
                .round_response_quality(&session, round, current_synth.as_deref())
                .await;
            confidence = aggregate_confidence(ConfidenceInputs {
                consensus: (round > 1).then_some(consensus_score),
                validation_pass_rate: None,
                response_quality,
                polish_delta: None,
            });
            session.confidence = confidence;

            self.events.gauge(
                "debate.round_confidence",
                confidence,
                &[("round", &round.to_string())],
            );

            if round < config.rounds_max
                && consensus_score >= config.consensus_threshold
                && confidence >= config.min_confidence
            {
                tracing::debug!(round, consensus_score, confidence, "early termination");
                break;
            }
        }

        stats.initial_confidence = confidence;

        let Some(mut candidate) = session
            .synthesizer_turn(session.round_idx)
            .map(|t| t.content.clone())
        else {
            return Err(EnsembleError::NoConsensus { confidence });
        };

        let mut validation_pass_rate = None;
        let mut polish_delta = None;

        if config.enable_multi_pass_validation {
            if confidence >= config.min_confidence_to_skip {
                stats.skipped_phases += 1;
                self.events.event(
                    "debate.phase_skipped",
                    &[("phase", "validate"), ("session", &session.id.to_string())],
                );
            } else {
                session.advance_phase(DebatePhase::Validate)?;
                let mut polished = false;

                for validation_round in 1..=config.max_validation_rounds {
                    let vctx = ctx.with_timeout(config.validate_timeout);
                    let (issues, pass_rate) =
                        self.run_validate_pass(&session, &candidate, &vctx).await;
                    validation_pass_rate = Some(pass_rate);
                    if validation_round == 1 {
                        stats.issues_found = issues.len() as u32;
                    }

                    if issues.is_empty() {
                        break;
                    }

                    if !polished {
                        session.advance_phase(DebatePhase::Polish)?;
                        polished = true;
                    }
                    let pctx = ctx.with_timeout(config.polish_timeout);
                    if let Some(rewritten) =
                        self.run_polish_pass(&session, &candidate, &issues, &pctx).await
                    {
                        candidate = rewritten;
                        stats.issues_resolved += issues.len() as u32;
                    } else {
                        break;
                    }
                }

                if stats.issues_found > 0 {
                    polish_delta = Some(
                        stats.issues_resolved as f64 / stats.issues_found as f64,
                    );
                }
            }
        }

        if session.phase() < DebatePhase::Final {
            session.advance_phase(DebatePhase::Final)?;
        }
        let final_answer = if config.enable_multi_pass_validation {
            let fctx = ctx.with_timeout(config.participant_timeout);
            self.run_final_pass(&session, &candidate, &fctx)
                .await
                .unwrap_or_else(|| candidate.clone())
        } else {
            candidate.clone()
        };

        confidence = aggregate_confidence(ConfidenceInputs {
            consensus: (stats.rounds_completed > 1).then_some(consensus_score),
            validation_pass_rate,
            response_quality,
            polish_delta,
        });
        stats.final_confidence = confidence;

        let outcome = DebateOutcome {
            consensus: final_answer,
            confidence,
            consensus_score,
            transcript: session.transcript().to_vec(),
            stats,
            phase: DebatePhase::Final,
            reached: consensus_score >= config.consensus_threshold
                || confidence >= config.min_confidence,
        };
        session.advance_phase(DebatePhase::Done)?;
        Ok(outcome)
    }

    /// Dispatch all five roles in parallel and collect their turns.
    async fn run_round(
        &self,
        session: &DebateSession,
        round: u32,
        config: &DebateConfig,
        ctx: &RequestContext,
        stats: &mut DebateStats,
    ) -> Result<Vec<Turn>, EnsembleError> {
        let prior: Vec<Turn> = if round > 1 {
            session
                .round_turns(round - 1)
                .into_iter()
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut tasks: JoinSet<Result<ParticipantOutcome, ProviderError>> = JoinSet::new();
        for participant in session.participants.clone() {
            let topic = session.topic.clone();
            let prior = prior.clone();
            let quality = self.quality.clone();
            let retry_policy = self.retry_policy.clone();
            let participant_ctx = ctx.with_timeout(config.participant_timeout);
            // Spawned tasks keep the debate span so router and breaker
            // logs stay correlated to the request id
            tasks.spawn(
                async move {
                    run_participant(
                        participant,
                        topic,
                        round,
                        prior,
                        quality,
                        retry_policy,
                        participant_ctx,
                    )
                    .await
                }
                .instrument(tracing::Span::current()),
            );
        }

        let mut turns = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined.map_err(|e| EnsembleError::Internal {
                message: format!("participant task panicked: {e}"),
            })?;
            match outcome {
                Ok(outcome) => {
                    stats.retries += outcome.retries;
                    stats.rejected_turns += outcome.rejected;
                    if let Some(turn) = outcome.turn {
                        turns.push(turn);
                    }
                }
                Err(error) => {
                    tasks.abort_all();
                    if ctx.is_cancelled() {
                        return Err(EnsembleError::Timeout);
                    }
                    return Err(EnsembleError::Provider(error));
                }
            }
        }
        Ok(turns)
    }

    /// Blend of average turn quality and cross-role agreement with the
    /// Synthesizer's answer.
    async fn round_response_quality(
        &self,
        session: &DebateSession,
        round: u32,
        synth_content: Option<&str>,
    ) -> Option<f64> {
        let turns = session.round_turns(round);
        if turns.is_empty() {
            return None;
        }
        let avg_quality =
            turns.iter().map(|t| t.quality_score).sum::<f64>() / turns.len() as f64;

        let agreement = match synth_content {
            Some(synth) => {
                let others: Vec<&&Turn> = turns
                    .iter()
                    .filter(|t| t.role != DebateRole::Synthesizer)
                    .collect();
                if others.is_empty() {
                    1.0
                } else {
                    let mut sum = 0.0;
                    for turn in &others {
                        sum += semantic_similarity(&self.embedder, &turn.content, synth).await;
                    }
                    sum / others.len() as f64
                }
            }
            None => 0.0,
        };

        Some(0.5 * avg_quality + 0.5 * agreement)
    }

    /// Validate phase: every participant annotates the candidate. Returns
    /// the collected issues and the fraction of clean verdicts.
    async fn run_validate_pass(
        &self,
        session: &DebateSession,
        candidate: &str,
        ctx: &RequestContext,
    ) -> (Vec<String>, f64) {
        let mut tasks: JoinSet<Option<Vec<String>>> = JoinSet::new();
        for participant in session.participants.clone() {
            let topic = session.topic.clone();
            let candidate = candidate.to_string();
            let retry_policy = self.retry_policy.clone();
            let ctx = ctx.child();
            tasks.spawn(
                async move {
                    let messages =
                        prompts::validation_messages(&topic, participant.role, &candidate);
                    let request = debate_request(messages, participant.temperature);
                    call_chain(&participant.chain, &retry_policy, &ctx, move |provider| {
                        let request = request.clone();
                        Box::pin(async move { provider.adapter.complete(request).await })
                    })
                    .await
                    .ok()
                    .map(|outcome| prompts::count_issues(outcome.value.content()))
                }
                .instrument(tracing::Span::current()),
            );
        }

        let mut issues = Vec::new();
        let mut verdicts = 0u32;
        let mut clean = 0u32;
        while let Some(joined) = tasks.join_next().await {
            if let Ok(Some(found)) = joined {
                verdicts += 1;
                if found.is_empty() {
                    clean += 1;
                }
                issues.extend(found);
            }
        }

        let pass_rate = if verdicts == 0 {
            // Nobody validated; treat as a failed pass, not a clean one
            0.0
        } else {
            clean as f64 / verdicts as f64
        };
        (issues, pass_rate)
    }

    /// Polish phase: the Synthesizer rewrites the candidate with the
    /// validation notes.
    async fn run_polish_pass(
        &self,
        session: &DebateSession,
        candidate: &str,
        issues: &[String],
        ctx: &RequestContext,
    ) -> Option<String> {
        let synthesizer = session
            .participants
            .iter()
            .find(|p| p.role == DebateRole::Synthesizer)?
            .clone();
        let messages = prompts::polish_messages(&session.topic, candidate, issues);
        let request = debate_request(messages, synthesizer.temperature);
        match call_chain(&synthesizer.chain, &self.retry_policy, ctx, move |provider| {
            let request = request.clone();
            Box::pin(async move { provider.adapter.complete(request).await })
        })
        .await
        {
            Ok(outcome) => Some(outcome.value.content().to_string()),
            Err(e) => {
                self.events
                    .warning("debate.polish_failed", &format!("polish pass failed: {e}"));
                None
            }
        }
    }

    /// Final phase: the Mediator emits the consensus.
    async fn run_final_pass(
        &self,
        session: &DebateSession,
        candidate: &str,
        ctx: &RequestContext,
    ) -> Option<String> {
        let mediator = session
            .participants
            .iter()
            .find(|p| p.role == DebateRole::Mediator)?
            .clone();
        let messages = prompts::final_messages(&session.topic, candidate);
        let request = debate_request(messages, mediator.temperature);
        match call_chain(&mediator.chain, &self.retry_policy, ctx, move |provider| {
            let request = request.clone();
            Box::pin(async move { provider.adapter.complete(request).await })
        })
        .await
        {
            Ok(outcome) => Some(outcome.value.content().to_string()),
            Err(e) => {
                self.events
                    .warning("debate.final_failed", &format!("final pass failed: {e}"));
                None
            }
        }
    }
}

struct ParticipantOutcome {
    turn: Option<Turn>,
    rejected: u32,
    retries: u32,
}

/// Run one participant for one round, re-rolling against fallbacks while
/// the turn quality sits below the threshold. If no attempt clears the
/// threshold the best turn is still dropped and counted as rejected.
async fn run_participant(
    participant: BoundParticipant,
    topic: String,
    round: u32,
    prior: Vec<Turn>,
    quality: QualityConfig,
    retry_policy: RetryPolicy,
    ctx: RequestContext,
) -> Result<ParticipantOutcome, ProviderError> {
    let prior_refs: Vec<&Turn> = prior.iter().collect();
    let messages = prompts::participant_messages(&topic, participant.role, round, &prior_refs);
    let request = debate_request(messages, participant.temperature);

    let mut retries = 0u32;
    let max_rolls = 1 + retry_policy.max_retries.min(participant.chain.len() as u32 - 1);

    for roll in 0..max_rolls {
        // Re-rolls go to the fallback chain for the same role
        let chain = &participant.chain[(roll as usize).min(participant.chain.len() - 1)..];
        let start = Instant::now();
        let outcome = call_chain(chain, &retry_policy, &ctx, {
            let request = request.clone();
            move |provider| {
                let request = request.clone();
                Box::pin(async move { provider.adapter.complete(request).await })
            }
        })
        .await?;

        retries += outcome.retries;
        let content = outcome.value.content().to_string();
        let score = quality::score_turn(participant.role, &content, &quality);
        let turn = Turn {
            round,
            role: participant.role,
            content,
            provider_used: outcome.provider_id,
            latency: start.elapsed(),
            quality_score: score,
            emitted_at: chrono::Utc::now(),
        };

        if score >= participant.quality_threshold {
            return Ok(ParticipantOutcome {
                turn: Some(turn),
                rejected: 0,
                retries,
            });
        }
        retries += 1;
        tracing::debug!(
            role = participant.role.as_str(),
            score,
            roll,
            "turn rejected for quality, re-rolling"
        );
    }

    // Every roll fell below the threshold: the turn is dropped and counted
    // against the transcript.
    Ok(ParticipantOutcome {
        turn: None,
        rejected: 1,
        retries,
    })
}

fn debate_request(messages: Vec<Message>, temperature: f32) -> ChatRequest {
    ChatRequest {
        model: "ensemble".to_string(),
        messages,
        temperature: Some(temperature),
        ..Default::default()
    }
}

/// The debate topic is the request's user-visible conversation, enhanced
/// system context included.
fn debate_topic(request: &ChatRequest) -> String {
    let mut parts = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => parts.push(format!("[context] {}", message.content)),
            Role::User => parts.push(message.content.clone()),
            Role::Assistant => parts.push(format!("[assistant] {}", message.content)),
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TrigramEmbedder;
    use crate::models::ExtraParams;
    use crate::registry::test_support::{registry_with, StaticAdapter};
    use std::time::Duration;

    fn orchestrator(registry: Arc<ProviderRegistry>) -> DebateOrchestrator {
        DebateOrchestrator::new(registry, Arc::new(TrigramEmbedder::default()))
            .with_retry_policy(RetryPolicy {
                initial_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                ..Default::default()
            })
    }

    fn simple_request(content: &str, rounds: u32, multi_pass: bool) -> ChatRequest {
        ChatRequest {
            model: "ensemble".to_string(),
            messages: vec![Message::user(content)],
            extra_params: Some(ExtraParams {
                rounds: Some(rounds),
                enable_multi_pass_validation: Some(multi_pass),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn single_round_debate_reaches_final_phase() {
        let registry = registry_with(vec![
            StaticAdapter::answering("a", "4"),
            StaticAdapter::answering("b", "4"),
            StaticAdapter::answering("c", "4"),
        ])
        .await;
        let orchestrator = orchestrator(registry);

        let request = simple_request("What is 2+2?", 1, false);
        let config = orchestrator.config_for(&request);
        let outcome = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.stats.rounds_completed, 1);
        assert_eq!(outcome.phase, DebatePhase::Final);
        assert_eq!(outcome.consensus, "4");
        assert!(outcome.confidence >= 0.8, "confidence {}", outcome.confidence);
        assert_eq!(outcome.transcript.len(), 5);
    }

    #[tokio::test]
    async fn transcript_length_matches_rounds_times_roles() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "same answer")]).await;
        let orchestrator = orchestrator(registry);

        let request = simple_request("topic", 2, false);
        let config = orchestrator.config_for(&request);
        let outcome = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap();

        let expected = outcome.stats.rounds_completed * 5 - outcome.stats.rejected_turns;
        assert_eq!(outcome.transcript.len() as u32, expected);
    }

    #[tokio::test]
    async fn identical_answers_converge_and_terminate_early() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "the answer is 4")]).await;
        let orchestrator = orchestrator(registry);

        let request = simple_request("What is 2+2?", 5, false);
        let config = orchestrator.config_for(&request);
        let outcome = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap();

        assert!(outcome.reached);
        // Identical synth turns give consensus 1.0 by round 2
        assert!(outcome.stats.rounds_completed <= 3);
        assert_eq!(outcome.consensus_score, 1.0);
    }

    #[tokio::test]
    async fn empty_pool_fails_before_any_round() {
        let registry = registry_with(vec![]).await;
        let orchestrator = orchestrator(registry);
        let request = simple_request("topic", 3, false);
        let config = orchestrator.config_for(&request);
        let err = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnsembleError::NoEligibleProvider { .. }));
    }

    #[tokio::test]
    async fn deadline_before_first_turn_yields_timeout() {
        let registry =
            registry_with(vec![StaticAdapter::slow("slow", "late", Duration::from_secs(1))]).await;
        let orchestrator = orchestrator(registry);
        let request = simple_request("topic", 1, false);
        let config = orchestrator.config_for(&request);
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(100));

        let start = Instant::now();
        let err = orchestrator.run(&request, config, &ctx).await.unwrap_err();
        assert!(matches!(err, EnsembleError::Timeout));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test]
    async fn content_filtered_aborts_the_debate() {
        let registry = registry_with(vec![StaticAdapter::failing("filtered", || {
            ProviderError::ContentFiltered {
                reason: "policy".into(),
            }
        })])
        .await;
        let orchestrator = orchestrator(registry);
        let request = simple_request("topic", 2, false);
        let config = orchestrator.config_for(&request);
        let err = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EnsembleError::Provider(ProviderError::ContentFiltered { .. })
        ));
    }

    #[tokio::test]
    async fn multi_pass_runs_phases_forward() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "NO ISSUES")]).await;
        let orchestrator = orchestrator(registry);
        let request = simple_request("topic", 1, true);
        let config = orchestrator.config_for(&request);
        let outcome = orchestrator
            .run(&request, config, &RequestContext::new())
            .await
            .unwrap();

        assert_eq!(outcome.phase, DebatePhase::Final);
        assert_eq!(outcome.stats.issues_found, 0);
        assert!(outcome.stats.final_confidence > 0.0);
    }
}

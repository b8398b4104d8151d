//! Theatrical streaming.
//!
//! `run_streaming` produces the same deliberation as `run`, but emits
//! chunks tagged `(phase, round, role, provider)` while it happens, with a
//! style banner opening each role's segment. Within a round the roles run
//! in parallel, each writing into its own bounded channel; a merger drains
//! those channels strictly in role order, so chunks for a given `(phase,
//! round, role)` are contiguous and roles appear in order no matter who
//! finished first. All channels are bounded (100 chunks) and every send is
//! cancellation-aware, so a slow client throttles producers instead of
//! growing buffers.

use crate::context::RequestContext;
use crate::debate::consensus;
use crate::debate::prompts;
use crate::debate::quality::{self, QualityConfig};
use crate::debate::session::{
    BoundParticipant, DebateConfig, DebatePhase, DebateRole, DebateSession, DebateStyle, Turn,
};
use crate::debate::DebateOrchestrator;
use crate::error::{EnsembleError, ProviderError};
use crate::models::{ChatRequest, Message};
use crate::router::{call_chain, RetryPolicy};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::pin::Pin;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

/// Bounded channel size for every streaming stage.
const STREAM_BUFFER: usize = 100;

/// One emitted streaming unit.
#[derive(Debug, Clone, Serialize)]
pub struct TheatricalChunk {
    pub phase: DebatePhase,
    pub round: u32,
    pub role: DebateRole,
    pub provider: String,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub banner: Option<String>,
}

pub type TheatricalStream =
    Pin<Box<dyn Stream<Item = Result<TheatricalChunk, EnsembleError>> + Send>>;

fn banner(style: DebateStyle, round: u32, role: DebateRole, provider: &str) -> Option<String> {
    match style {
        DebateStyle::Theater => Some(format!(
            "=== ACT {round}, SCENE {}: THE {} ({provider}) ===",
            role.order() + 1,
            role.as_str().to_uppercase()
        )),
        DebateStyle::Novel => Some(format!(
            "Chapter {round}.{} - in which the {} speaks",
            role.order() + 1,
            role.as_str()
        )),
        DebateStyle::Screenplay => Some(format!(
            "INT. DEBATE CHAMBER - ROUND {round}\n{} ({provider}):",
            role.as_str().to_uppercase()
        )),
        DebateStyle::Minimal => None,
    }
}

impl DebateOrchestrator {
    /// Streaming variant of [`DebateOrchestrator::run`]. Eligibility is
    /// checked before the stream is returned, so `NoEligibleProvider`
    /// surfaces as an error and never as a broken stream.
    #[tracing::instrument(name = "debate_stream", skip_all, fields(request_id = %ctx.id()))]
    pub async fn run_streaming(
        &self,
        request: &ChatRequest,
        config: DebateConfig,
        ctx: &RequestContext,
    ) -> Result<TheatricalStream, EnsembleError> {
        let participants = self.bind_participants(&config)?;
        let topic = super::debate_topic(request);
        let session = DebateSession::new(topic, &config, participants)?;

        let (tx, rx) = mpsc::channel::<Result<TheatricalChunk, EnsembleError>>(STREAM_BUFFER);
        let driver = StreamDriver {
            embedder: self.embedder.clone(),
            retry_policy: self.retry_policy.clone(),
            quality: self.quality.clone(),
            config,
            ctx: ctx.child(),
        };
        // The detached driver keeps the request span so every log line it
        // emits stays correlated to the request id
        tokio::spawn(driver.drive(session, tx).instrument(tracing::Span::current()));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

struct StreamDriver {
    embedder: crate::embedding::SharedEmbedder,
    retry_policy: RetryPolicy,
    quality: QualityConfig,
    config: DebateConfig,
    ctx: RequestContext,
}

impl StreamDriver {
    async fn drive(
        self,
        mut session: DebateSession,
        tx: mpsc::Sender<Result<TheatricalChunk, EnsembleError>>,
    ) {
        let mut consensus_score = 0.0;

        for round in 1..=self.config.rounds_max {
            if self.ctx.is_cancelled() {
                let _ = tx.send(Err(EnsembleError::Timeout)).await;
                return;
            }

            match self.stream_round(&session, round, &tx).await {
                Ok(turns) => {
                    if session.append_round(round, turns).is_err() {
                        return;
                    }
                }
                Err(error) => {
                    let _ = tx.send(Err(error)).await;
                    return;
                }
            }

            let current = session.synthesizer_turn(round).map(|t| t.content.clone());
            let previous = (round > 1)
                .then(|| session.synthesizer_turn(round - 1).map(|t| t.content.clone()))
                .flatten();
            if let Some(current) = &current {
                consensus_score =
                    consensus::consensus_score(&self.embedder, previous.as_deref(), current).await;
            }

            if consensus_score >= self.config.consensus_threshold && round < self.config.rounds_max
            {
                break;
            }
        }

        // Closing chunk: the Mediator's final consensus
        let candidate = session
            .synthesizer_turn(session.round_idx)
            .map(|t| t.content.clone());
        let Some(candidate) = candidate else {
            let _ = tx
                .send(Err(EnsembleError::NoConsensus { confidence: 0.0 }))
                .await;
            return;
        };

        let final_chunk = TheatricalChunk {
            phase: DebatePhase::Final,
            round: session.round_idx,
            role: DebateRole::Mediator,
            provider: "ensemble".to_string(),
            content: candidate,
            banner: banner(
                session.style,
                session.round_idx,
                DebateRole::Mediator,
                "ensemble",
            ),
        };
        let _ = tx.send(Ok(final_chunk)).await;
    }

    /// Run one round with per-role producers and an in-order merger.
    async fn stream_round(
        &self,
        session: &DebateSession,
        round: u32,
        tx: &mpsc::Sender<Result<TheatricalChunk, EnsembleError>>,
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

        // Launch all producers up front so roles overlap; the merger below
        // fixes emission order.
        let mut segments = Vec::new();
        for participant in session.participants.clone() {
            let (ptx, prx) = mpsc::channel::<TheatricalChunk>(STREAM_BUFFER);
            let producer = RoleProducer {
                participant,
                topic: session.topic.clone(),
                style: session.style,
                round,
                prior: prior.clone(),
                retry_policy: self.retry_policy.clone(),
                ctx: self.ctx.with_timeout(self.config.participant_timeout),
            };
            let handle =
                tokio::spawn(producer.produce(ptx).instrument(tracing::Span::current()));
            segments.push((prx, handle));
        }

        let mut turns = Vec::new();
        for (mut prx, handle) in segments {
            // Drain this role to completion before touching the next one;
            // contiguity falls out of the channel discipline.
            while let Some(chunk) = prx.recv().await {
                if tx.send(Ok(chunk)).await.is_err() {
                    return Err(EnsembleError::Timeout);
                }
            }
            match handle.await {
                Ok(Ok(turn)) => {
                    let score = quality::score_turn(turn.role, &turn.content, &self.quality);
                    turns.push(Turn {
                        quality_score: score,
                        ..turn
                    });
                }
                Ok(Err(error)) => {
                    if self.ctx.is_cancelled() {
                        return Err(EnsembleError::Timeout);
                    }
                    return Err(EnsembleError::Provider(error));
                }
                Err(join_error) => {
                    return Err(EnsembleError::Internal {
                        message: format!("stream producer panicked: {join_error}"),
                    });
                }
            }
        }
        Ok(turns)
    }
}

struct RoleProducer {
    participant: BoundParticipant,
    topic: String,
    style: DebateStyle,
    round: u32,
    prior: Vec<Turn>,
    retry_policy: RetryPolicy,
    ctx: RequestContext,
}

impl RoleProducer {
    /// Stream one role's turn into its channel; returns the assembled turn.
    async fn produce(self, ptx: mpsc::Sender<TheatricalChunk>) -> Result<Turn, ProviderError> {
        let prior_refs: Vec<&Turn> = self.prior.iter().collect();
        let messages = prompts::participant_messages(
            &self.topic,
            self.participant.role,
            self.round,
            &prior_refs,
        );
        let request = request_for(messages, self.participant.temperature);
        let started = std::time::Instant::now();

        // Walk the chain looking for a provider whose stream starts; a
        // provider that cannot stream at all falls back to its one-shot
        // completion.
        let mut last_error = ProviderError::Timeout;
        for provider in &self.participant.chain {
            let provider_id = provider.config.id.clone();
            let adapter = provider.adapter.clone();
            let breaker = provider.breaker.clone();
            let attempt_request = request.clone();
            let stream_attempt = self
                .ctx
                .run(breaker.call(move || async move {
                    adapter.complete_stream(attempt_request).await
                }))
                .await;

            match stream_attempt {
                Ok(mut chunks) => {
                    self.emit_banner(&ptx, &provider_id).await?;
                    let mut content = String::new();
                    while let Some(item) = self.ctx.run(next_chunk(&mut chunks)).await? {
                        match item {
                            Ok(chunk) => {
                                let Some(delta) = chunk
                                    .choices
                                    .first()
                                    .and_then(|c| c.delta.content.clone())
                                else {
                                    continue;
                                };
                                content.push_str(&delta);
                                self.send(
                                    &ptx,
                                    TheatricalChunk {
                                        phase: DebatePhase::Initial,
                                        round: self.round,
                                        role: self.participant.role,
                                        provider: provider_id.clone(),
                                        content: delta,
                                        banner: None,
                                    },
                                )
                                .await?;
                            }
                            Err(error) => return Err(error),
                        }
                    }
                    return Ok(Turn {
                        round: self.round,
                        role: self.participant.role,
                        content,
                        provider_used: provider_id,
                        latency: started.elapsed(),
                        quality_score: 0.0,
                        emitted_at: chrono::Utc::now(),
                    });
                }
                Err(error) if error.is_retryable() => {
                    last_error = error;
                    continue;
                }
                Err(ProviderError::InvalidRequest { .. }) => {
                    // Streaming unsupported; run the one-shot completion
                    // through the normal chain machinery instead.
                    return self.produce_unstreamed(&ptx, request, started).await;
                }
                Err(fatal) => return Err(fatal),
            }
        }
        Err(last_error)
    }

    /// Non-streaming fallback: one completion, emitted as a single chunk.
    async fn produce_unstreamed(
        &self,
        ptx: &mpsc::Sender<TheatricalChunk>,
        request: ChatRequest,
        started: std::time::Instant,
    ) -> Result<Turn, ProviderError> {
        let outcome = call_chain(
            &self.participant.chain,
            &self.retry_policy,
            &self.ctx,
            move |provider| {
                let request = request.clone();
                Box::pin(async move { provider.adapter.complete(request).await })
            },
        )
        .await?;

        self.emit_banner(ptx, &outcome.provider_id).await?;
        let content = outcome.value.content().to_string();
        self.send(
            ptx,
            TheatricalChunk {
                phase: DebatePhase::Initial,
                round: self.round,
                role: self.participant.role,
                provider: outcome.provider_id.clone(),
                content: content.clone(),
                banner: None,
            },
        )
        .await?;

        Ok(Turn {
            round: self.round,
            role: self.participant.role,
            content,
            provider_used: outcome.provider_id,
            latency: started.elapsed(),
            quality_score: 0.0,
            emitted_at: chrono::Utc::now(),
        })
    }

    async fn emit_banner(
        &self,
        ptx: &mpsc::Sender<TheatricalChunk>,
        provider: &str,
    ) -> Result<(), ProviderError> {
        let Some(text) = banner(self.style, self.round, self.participant.role, provider) else {
            return Ok(());
        };
        self.send(
            ptx,
            TheatricalChunk {
                phase: DebatePhase::Initial,
                round: self.round,
                role: self.participant.role,
                provider: provider.to_string(),
                content: String::new(),
                banner: Some(text),
            },
        )
        .await
    }

    /// Cancellation-aware bounded send; a gone receiver ends the producer.
    async fn send(
        &self,
        ptx: &mpsc::Sender<TheatricalChunk>,
        chunk: TheatricalChunk,
    ) -> Result<(), ProviderError> {
        self.ctx
            .run(async {
                ptx.send(chunk)
                    .await
                    .map_err(|_| ProviderError::Timeout)
            })
            .await
    }
}

async fn next_chunk(
    chunks: &mut crate::providers::ChunkStream,
) -> Result<Option<Result<crate::models::StreamChunk, ProviderError>>, ProviderError> {
    Ok(chunks.next().await)
}

fn request_for(messages: Vec<Message>, temperature: f32) -> ChatRequest {
    ChatRequest {
        model: "ensemble".to_string(),
        messages,
        temperature: Some(temperature),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::TrigramEmbedder;
    use crate::models::ExtraParams;
    use crate::registry::test_support::{registry_with, StaticAdapter};
    use std::sync::Arc;
    use std::time::Duration;

    async fn collect_chunks(
        reply: &str,
        style: &str,
    ) -> Vec<TheatricalChunk> {
        let registry = registry_with(vec![StaticAdapter::answering("solo", reply)]).await;
        let orchestrator =
            DebateOrchestrator::new(registry, Arc::new(TrigramEmbedder::default()));
        let request = ChatRequest {
            model: "ensemble".to_string(),
            messages: vec![Message::user("What is 2+2?")],
            extra_params: Some(ExtraParams {
                rounds: Some(1),
                style: Some(style.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = orchestrator.config_for(&request);
        let stream = orchestrator
            .run_streaming(&request, config, &RequestContext::new())
            .await
            .unwrap();
        stream
            .map(|c| c.expect("stream item"))
            .collect::<Vec<_>>()
            .await
    }

    #[tokio::test]
    async fn chunks_arrive_in_role_order_and_contiguously() {
        let chunks = collect_chunks("the answer is 4", "minimal").await;

        // Per (phase, round, role) contiguity: once a role stops, it never
        // reappears within the same phase+round.
        let mut seen: Vec<(DebatePhase, u32, DebateRole)> = Vec::new();
        for chunk in &chunks {
            let key = (chunk.phase, chunk.round, chunk.role);
            if seen.last() != Some(&key) {
                assert!(!seen.contains(&key), "role segment split: {key:?}");
                seen.push(key);
            }
        }

        // Role order within round 1 of the initial phase
        let round_roles: Vec<DebateRole> = seen
            .iter()
            .filter(|(phase, round, _)| *phase == DebatePhase::Initial && *round == 1)
            .map(|(_, _, role)| *role)
            .collect();
        assert_eq!(round_roles, DebateRole::ALL.to_vec());

        // The closing chunk is the mediated final consensus
        let last = chunks.last().unwrap();
        assert_eq!(last.phase, DebatePhase::Final);
        assert!(last.content.contains('4'));
    }

    #[tokio::test]
    async fn theater_style_carries_banners() {
        let chunks = collect_chunks("the answer is 4", "theater").await;
        let banners: Vec<&TheatricalChunk> =
            chunks.iter().filter(|c| c.banner.is_some()).collect();
        assert!(!banners.is_empty());
        assert!(banners[0].banner.as_ref().unwrap().contains("ACT 1"));
    }

    #[tokio::test]
    async fn minimal_style_has_no_banners_in_rounds() {
        let chunks = collect_chunks("the answer is 4", "minimal").await;
        assert!(chunks
            .iter()
            .filter(|c| c.phase == DebatePhase::Initial)
            .all(|c| c.banner.is_none()));
    }

    #[tokio::test]
    async fn empty_pool_errors_before_streaming() {
        let registry = registry_with(vec![]).await;
        let orchestrator =
            DebateOrchestrator::new(registry, Arc::new(TrigramEmbedder::default()));
        let request = ChatRequest {
            model: "ensemble".to_string(),
            messages: vec![Message::user("q")],
            ..Default::default()
        };
        let config = orchestrator.config_for(&request);
        let err = orchestrator
            .run_streaming(&request, config, &RequestContext::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EnsembleError::NoEligibleProvider { .. }));
    }

    #[tokio::test]
    async fn cancelled_context_ends_the_stream_with_timeout() {
        let registry = registry_with(vec![StaticAdapter::slow(
            "slow",
            "late",
            Duration::from_secs(2),
        )])
        .await;
        let orchestrator =
            DebateOrchestrator::new(registry, Arc::new(TrigramEmbedder::default()));
        let request = ChatRequest {
            model: "ensemble".to_string(),
            messages: vec![Message::user("q")],
            extra_params: Some(ExtraParams {
                rounds: Some(1),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = orchestrator.config_for(&request);
        let ctx = RequestContext::new().with_timeout(Duration::from_millis(80));
        let stream = orchestrator.run_streaming(&request, config, &ctx).await.unwrap();
        let items: Vec<_> = stream.collect().await;
        assert!(items.iter().any(|i| matches!(i, Err(EnsembleError::Timeout))));
    }
}

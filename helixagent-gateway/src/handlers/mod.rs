//! # HTTP Handlers
//!
//! The OpenAI-compatible completion surface plus the operational
//! endpoints: models, asynchronous debates, verification triggers, health
//! snapshots and the scored ranking.
//!
//! A completion request flows: parse → semantic-cache lookup (hit ⇒
//! return) → memory enhancement → debate orchestration → cache put +
//! memory ingest → response. Streaming requests run the same pipeline but
//! emit theatrical chunks over SSE, one JSON delta per `data:` line,
//! terminated by `data: [DONE]`.

use crate::gateway_error::GatewayError;
use crate::request_context::context_from_headers;
use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use helixagent_ensemble::context::RequestContext;
use helixagent_ensemble::debate::streaming::TheatricalChunk;
use helixagent_ensemble::models::{
    estimate_tokens, ChatRequest, ChatResponse, Choice, Message, Usage,
};
use helixagent_ensemble::semantic_cache::CacheHit;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

/// `POST /v1/chat/completions`
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Response, GatewayError> {
    validate_chat_request(&request)?;
    let ctx = context_from_headers(
        &headers,
        Duration::from_secs(state.config.server.request_timeout_secs),
    );

    // One span per request carries the correlation id; everything the
    // pipeline logs below it inherits the field
    let span = tracing::info_span!("chat_completion", request_id = %ctx.id());
    if request.stream.unwrap_or(false) {
        return stream_chat_completions(state, request, ctx).instrument(span).await;
    }
    complete_chat(state, request, ctx).instrument(span).await
}

/// Non-streaming completion pipeline: cache lookup, memory enhancement,
/// debate, cache put and memory ingest.
async fn complete_chat(
    state: AppState,
    request: ChatRequest,
    ctx: RequestContext,
) -> Result<Response, GatewayError> {
    // Semantic cache: embedding-keyed nearest-neighbor reuse
    let query_text = last_user_text(&request);
    let mut query_embedding = None;
    if let (Some(cache), Some(query)) = (&state.cache, &query_text) {
        match state.embedder.embed(query).await {
            Ok(embedding) => {
                if let Some(hit) = cache.get(state.embedder.model_id(), &embedding) {
                    // The request id rides on the surrounding span
                    tracing::debug!(
                        similarity = hit.similarity as f64,
                        "semantic cache hit"
                    );
                    return Ok(Json(cached_response_body(hit)?).into_response());
                }
                query_embedding = Some(embedding);
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache lookup skipped, embedding failed");
            }
        }
    }

    // Memory enhancement, bounded by the pool's tightest context window
    let enhanced = match &state.memory {
        Some(memory) => {
            memory
                .enhance(request.clone(), pool_max_context(&state))
                .await
        }
        None => request.clone(),
    };

    let config = state.orchestrator.config_for(&enhanced);
    let outcome = state.orchestrator.run(&enhanced, config, &ctx).await?;

    let response = outcome_to_response(&request.model, &outcome);

    if let Some(memory) = &state.memory {
        memory.ingest(&request, &response);
    }
    if let (Some(cache), Some(query), Some(embedding)) =
        (&state.cache, &query_text, query_embedding)
    {
        cache.put(
            state.embedder.model_id(),
            embedding,
            query,
            response.clone(),
            [(
                "confidence".to_string(),
                format!("{:.3}", outcome.confidence),
            )]
            .into(),
        );
    }

    let mut body = serde_json::to_value(&response)?;
    body["debate"] = json!({
        "session_stats": outcome.stats,
        "confidence": outcome.confidence,
        "consensus_score": outcome.consensus_score,
        "phase": outcome.phase,
        "reached": outcome.reached,
    });
    Ok(Json(body).into_response())
}

/// Streaming variant: theatrical chunks as OpenAI-wire deltas over SSE.
async fn stream_chat_completions(
    state: AppState,
    request: ChatRequest,
    ctx: RequestContext,
) -> Result<Response, GatewayError> {
    let enhanced = match &state.memory {
        Some(memory) => {
            memory
                .enhance(request.clone(), pool_max_context(&state))
                .await
        }
        None => request.clone(),
    };

    let config = state.orchestrator.config_for(&enhanced);
    let stream = state
        .orchestrator
        .run_streaming(&enhanced, config, &ctx)
        .await?;

    let completion_id = format!("chatcmpl-{}", Uuid::new_v4());
    let model = request.model.clone();

    let events = stream
        .map(move |item| -> Result<Event, Infallible> {
            match item {
                Ok(chunk) => Ok(Event::default().data(
                    delta_json(&completion_id, &model, &chunk).to_string(),
                )),
                Err(error) => Ok(Event::default().data(
                    json!({
                        "error": {
                            "kind": error.kind(),
                            "message": error.to_string(),
                        }
                    })
                    .to_string(),
                )),
            }
        })
        .chain(futures::stream::iter(vec![Ok(Event::default()
            .data("[DONE]"))]));

    Ok(Sse::new(events)
        .keep_alive(axum::response::sse::KeepAlive::default())
        .into_response())
}

fn delta_json(completion_id: &str, model: &str, chunk: &TheatricalChunk) -> Value {
    let mut content = String::new();
    if let Some(banner) = &chunk.banner {
        content.push_str(banner);
        content.push('\n');
    }
    content.push_str(&chunk.content);

    json!({
        "id": completion_id,
        "object": "chat.completion.chunk",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "delta": {"role": "assistant", "content": content},
            "finish_reason": null,
        }],
        "helix": {
            "phase": chunk.phase,
            "round": chunk.round,
            "role": chunk.role,
            "provider": chunk.provider,
        },
    })
}

fn validate_chat_request(request: &ChatRequest) -> Result<(), GatewayError> {
    if request.model.trim().is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "model is required".to_string(),
        });
    }
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest {
            message: "messages must not be empty".to_string(),
        });
    }
    if let Some(temperature) = request.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest {
                message: "temperature must be in [0, 2]".to_string(),
            });
        }
    }
    Ok(())
}

fn last_user_text(request: &ChatRequest) -> Option<String> {
    request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == helixagent_ensemble::models::Role::User)
        .map(|m| m.content.clone())
}

/// Tightest declared context window across the eligible pool.
fn pool_max_context(state: &AppState) -> Option<u32> {
    state
        .registry
        .eligible_pool(&Default::default(), &Default::default())
        .iter()
        .map(|p| p.adapter.capabilities().max_context)
        .min()
}

fn outcome_to_response(
    model: &str,
    outcome: &helixagent_ensemble::debate::session::DebateOutcome,
) -> ChatResponse {
    let prompt_tokens = outcome
        .transcript
        .iter()
        .map(|t| estimate_tokens(&t.content))
        .sum::<u32>();
    let completion_tokens = estimate_tokens(&outcome.consensus);

    ChatResponse {
        id: format!("chatcmpl-{}", Uuid::new_v4()),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp() as u64,
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: Message::assistant(outcome.consensus.clone()),
            finish_reason: Some("stop".to_string()),
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }),
    }
}

fn cached_response_body(hit: CacheHit) -> Result<Value, GatewayError> {
    let mut body = serde_json::to_value(&hit.response)?;
    body["cache"] = json!({
        "cache_hit": true,
        "hit_similarity": hit.similarity,
        "embedding_model": hit.embedding_model,
        "fingerprint": hit.fingerprint,
    });
    Ok(body)
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started_at.elapsed().as_secs(),
        "providers": state.registry.all().len(),
    }))
}

/// `GET /v1/models` - every registered provider's models.
pub async fn list_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .registry
        .all()
        .iter()
        .map(|p| {
            json!({
                "id": p.config.id,
                "object": "model",
                "owned_by": p.adapter.kind().as_str(),
                "capabilities": p.adapter.capabilities(),
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// `GET /v1/models/verified` - admissible providers only.
pub async fn list_verified_models(State(state): State<AppState>) -> Json<Value> {
    let data: Vec<Value> = state
        .registry
        .all()
        .iter()
        .filter(|p| state.registry.admissible(p))
        .map(|p| {
            let verification = state.registry.verification(&p.config.id);
            json!({
                "id": p.config.id,
                "object": "model",
                "owned_by": p.adapter.kind().as_str(),
                "verification": verification,
            })
        })
        .collect();
    Json(json!({"object": "list", "data": data}))
}

/// `POST /v1/debates` - asynchronous debate job.
pub async fn create_debate(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<Value>, GatewayError> {
    validate_chat_request(&request)?;
    let job_id = state.jobs.start();

    let orchestrator = state.orchestrator.clone();
    let jobs = state.jobs.clone();
    let timeout = Duration::from_secs(state.config.server.request_timeout_secs);
    let ctx = RequestContext::new().with_timeout(timeout);
    let span = tracing::info_span!("debate_job", request_id = %ctx.id(), job_id = %job_id);
    tokio::spawn(
        async move {
            let config = orchestrator.config_for(&request);
            match orchestrator.run(&request, config, &ctx).await {
                Ok(outcome) => jobs.complete(job_id, outcome),
                Err(error) => jobs.fail(job_id, error.kind(), error.to_string()),
            }
        }
        .instrument(span),
    );

    Ok(Json(json!({"id": job_id, "status": "running"})))
}

/// `GET /v1/debates/{id}`
pub async fn get_debate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, GatewayError> {
    let job = state.jobs.get(&id).ok_or_else(|| GatewayError::NotFound {
        message: format!("debate {id} not found"),
    })?;
    Ok(Json(json!({"id": id, "job": job})))
}

/// `GET /v1/debates/{id}/status`
pub async fn debate_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, GatewayError> {
    let job = state.jobs.get(&id).ok_or_else(|| GatewayError::NotFound {
        message: format!("debate {id} not found"),
    })?;
    let status = match &job {
        crate::debate_jobs::JobState::Running => "running",
        crate::debate_jobs::JobState::Completed { .. } => "completed",
        crate::debate_jobs::JobState::Failed { .. } => "failed",
    };
    Ok(Json(json!({"id": id, "status": status})))
}

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub provider: String,
}

/// `POST /v1/verification/verify`
pub async fn verify_provider(
    State(state): State<AppState>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<Value>, GatewayError> {
    let provider = state
        .registry
        .get(&body.provider)
        .ok_or_else(|| GatewayError::NotFound {
            message: format!("provider {} not registered", body.provider),
        })?;

    let result = state.verifier.verify(provider.adapter.as_ref()).await;
    state
        .registry
        .record_verification(&body.provider, result.clone());
    state.registry.refresh_score(&body.provider);
    Ok(Json(json!({"provider": body.provider, "result": result})))
}

/// `POST /v1/verification/batch` - verify every registered provider.
pub async fn verify_batch(State(state): State<AppState>) -> Json<Value> {
    let mut results = Vec::new();
    for provider in state.registry.all() {
        let result = state.verifier.verify(provider.adapter.as_ref()).await;
        state
            .registry
            .record_verification(&provider.config.id, result.clone());
        state.registry.refresh_score(&provider.config.id);
        results.push(json!({"provider": provider.config.id, "result": result}));
    }
    Json(json!({"results": results}))
}

/// `GET /v1/providers/status`
pub async fn providers_status(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = state
        .registry
        .all()
        .iter()
        .map(|p| {
            json!({
                "id": p.config.id,
                "kind": p.adapter.kind().as_str(),
                "enabled": p.enabled(),
                "admissible": state.registry.admissible(p),
                "health": state.registry.health_record(&p.config.id),
                "score": state.registry.scores().get(&p.config.id),
                "verification": state.registry.verification(&p.config.id),
            })
        })
        .collect();
    Json(json!({"providers": providers}))
}

/// `GET /v1/providers/{name}/health`
pub async fn provider_health(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    let record = state
        .registry
        .health_record(&name)
        .ok_or_else(|| GatewayError::NotFound {
            message: format!("provider {name} not registered"),
        })?;
    Ok(Json(json!({"provider": name, "health": record})))
}

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default = "default_limit")]
    pub limit: usize,
}

fn default_limit() -> usize {
    10
}

/// `GET /v1/scoring/top?limit=N`
pub async fn scoring_top(
    State(state): State<AppState>,
    Query(query): Query<TopQuery>,
) -> Json<Value> {
    let ranking: Vec<Value> = state
        .registry
        .scores()
        .top(query.limit)
        .into_iter()
        .map(|(id, score)| json!({"provider": id, "score": score}))
        .collect();
    Json(json!({"ranking": ranking}))
}

//! # HTTP Server Assembly
//!
//! Builds the axum application: wires the provider registry, health
//! engine, verifier, debate orchestrator, semantic cache and memory
//! pipeline into the shared [`AppState`], then mounts the route table and
//! middleware stack (CORS → trace → timeout).

use crate::config::Config;
use crate::debate_jobs::DebateJobs;
use crate::handlers;
use axum::routing::{get, post};
use axum::Router;
use helixagent_ensemble::debate::DebateOrchestrator;
use helixagent_ensemble::embedding::{SharedEmbedder, TrigramEmbedder};
use helixagent_ensemble::health::HealthEngine;
use helixagent_ensemble::memory::{InMemoryStore, MemoryPipeline};
use helixagent_ensemble::registry::ProviderRegistry;
use helixagent_ensemble::semantic_cache::{spawn_compaction, SemanticCache};
use helixagent_ensemble::snapshots::InMemorySnapshotStore;
use helixagent_ensemble::verification::{spawn_refresh_task, Verifier};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<ProviderRegistry>,
    pub orchestrator: Arc<DebateOrchestrator>,
    pub verifier: Arc<Verifier>,
    pub cache: Option<Arc<SemanticCache>>,
    pub memory: Option<Arc<MemoryPipeline>>,
    pub embedder: SharedEmbedder,
    pub jobs: Arc<DebateJobs>,
    pub started_at: Instant,
}

/// Background machinery torn down on shutdown.
pub struct GatewayRuntime {
    pub cancel: CancellationToken,
    health_engine: Option<HealthEngine>,
}

impl GatewayRuntime {
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(engine) = self.health_engine.take() {
            engine.shutdown().await;
        }
    }
}

/// Create the registry from configuration, register every enabled
/// provider, and start admission verification plus the health engine.
pub async fn create_app_state(config: Config) -> anyhow::Result<(AppState, GatewayRuntime)> {
    let registry = Arc::new(
        ProviderRegistry::new(
            config.scoring.to_weights(),
            config.health.to_health_config(),
            config.circuit_breaker.to_breaker_config(),
            config.verifier.to_verifier_config(),
        )
        .map_err(|e| anyhow::anyhow!(e.to_string()))?
        .with_snapshot_store(Arc::new(InMemorySnapshotStore::new())),
    );

    for (id, provider) in &config.providers {
        if !provider.enabled {
            continue;
        }
        match registry.register(provider.to_provider_config(id)).await {
            Ok(()) => {
                registry.set_cost(id, provider.cost_per_million_tokens);
                tracing::info!(
                    provider = %id,
                    kind = ?provider.effective_kind(),
                    "provider registered"
                );
            }
            Err(e) => {
                tracing::error!(provider = %id, error = %e, "provider registration failed");
            }
        }
    }

    let verifier = Arc::new(Verifier::new(config.verifier.to_verifier_config()));
    let cancel = CancellationToken::new();

    // Admission verification runs in the background; a provider serves no
    // traffic until its result lands.
    {
        let registry = registry.clone();
        let verifier = verifier.clone();
        tokio::spawn(async move {
            for provider in registry.all() {
                if registry.verification(&provider.config.id).is_some() {
                    continue;
                }
                let result = verifier.verify(provider.adapter.as_ref()).await;
                registry.record_verification(&provider.config.id, result);
                registry.refresh_score(&provider.config.id);
            }
        });
    }
    spawn_refresh_task(registry.clone(), verifier.clone(), cancel.child_token());

    let health_engine = HealthEngine::spawn(registry.clone());
    let runtime = GatewayRuntime {
        cancel: cancel.clone(),
        health_engine: Some(health_engine),
    };

    let state = assemble_state(config, registry, verifier, cancel);
    Ok((state, runtime))
}

/// Wire the request-path components over an existing registry. Also the
/// seam the integration tests use to inject scripted providers.
pub fn assemble_state(
    config: Config,
    registry: Arc<ProviderRegistry>,
    verifier: Arc<Verifier>,
    cancel: CancellationToken,
) -> AppState {
    let embedder: SharedEmbedder = Arc::new(TrigramEmbedder::default());

    let cache = config.cache.enabled.then(|| {
        let cache = Arc::new(SemanticCache::new(config.cache.to_cache_config()));
        spawn_compaction(cache.clone(), cancel.child_token());
        cache
    });

    let memory = config.memory.enabled.then(|| {
        let pipeline = Arc::new(MemoryPipeline::new(
            Arc::new(InMemoryStore::new()),
            embedder.clone(),
            config.memory.to_memory_config(),
        ));
        pipeline.spawn_compaction(cancel.child_token());
        pipeline
    });

    let orchestrator = Arc::new(
        DebateOrchestrator::new(registry.clone(), embedder.clone())
            .with_defaults(config.debate.to_debate_config())
            .with_retry_policy(config.retry.to_retry_policy()),
    );

    AppState {
        config: Arc::new(config),
        registry,
        orchestrator,
        verifier,
        cache,
        memory,
        embedder,
        jobs: Arc::new(DebateJobs::new()),
        started_at: Instant::now(),
    }
}

/// Full assembly: state plus router.
pub async fn create_server(config: Config) -> anyhow::Result<(Router, GatewayRuntime)> {
    let (state, runtime) = create_app_state(config).await?;
    Ok((router_for(state), runtime))
}

/// Mount the route table and middleware over prepared state.
pub fn router_for(state: AppState) -> Router {
    let cors = cors_layer(&state.config);
    let request_timeout = Duration::from_secs(state.config.server.request_timeout_secs);

    let mut app = Router::new()
        // OpenAI-compatible surface
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        .route("/v1/models/verified", get(handlers::list_verified_models))
        // Debate jobs
        .route("/v1/debates", post(handlers::create_debate))
        .route("/v1/debates/{id}", get(handlers::get_debate))
        .route("/v1/debates/{id}/status", get(handlers::debate_status))
        // Verification
        .route("/v1/verification/verify", post(handlers::verify_provider))
        .route("/v1/verification/batch", post(handlers::verify_batch))
        // Health and scoring
        .route("/health", get(handlers::health_check))
        .route("/v1/providers/status", get(handlers::providers_status))
        .route(
            "/v1/providers/{name}/health",
            get(handlers::provider_health),
        )
        .route("/v1/scoring/top", get(handlers::scoring_top))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                // The HTTP-level timeout backstops the ambient deadline;
                // the deadline fires first and maps to 504.
                .layer(TimeoutLayer::new(request_timeout + Duration::from_secs(5))),
        )
        .with_state(state);

    if let Some(cors) = cors {
        app = app.layer(cors);
    }
    app
}

fn cors_layer(config: &Config) -> Option<CorsLayer> {
    if !config.server.cors.enabled {
        return None;
    }
    let layer = if config.server.cors.allowed_origins.iter().any(|o| o == "*") {
        tracing::warn!(
            "CORS is enabled with wildcard origins; configure explicit allowed_origins for production"
        );
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config
            .server
            .cors
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins))
    };
    Some(layer)
}

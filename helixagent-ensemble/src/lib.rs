//! # HelixAgent Ensemble
//!
//! Core library of the HelixAgent orchestration gateway: a uniform
//! federation over heterogeneous LLM providers, a multi-round role-based
//! debate engine, and a memory-augmented request pipeline.
//!
//! ## Subsystems
//!
//! - **Provider federation** ([`providers`], [`registry`], [`router`],
//!   [`circuit_breaker`], [`health`], [`verification`], [`scoring`]):
//!   adapters translate the crate's OpenAI-shaped types to each upstream's
//!   wire format and normalize failures into one taxonomy; the registry
//!   owns the providers, their breakers and their verification state; the
//!   router executes fallback chains over the score-ranked eligible pool.
//!   A provider serves traffic only after passing the capability
//!   verification suite - the "do you see my code?" protocol.
//! - **Debate orchestration** ([`debate`]): five fixed roles (Analyst,
//!   Proposer, Critic, Synthesizer, Mediator) deliberate across rounds,
//!   with inter-round convergence measured on the Synthesizer's output,
//!   optional four-phase validation (Initial → Validate → Polish → Final),
//!   and theatrical streaming.
//! - **Memory pipeline** ([`memory`], [`semantic_cache`], [`embedding`]):
//!   pre-request context retrieval and prompt augmentation, post-response
//!   entity/relation extraction into an arena-backed knowledge graph, and
//!   an embedding-keyed semantic response cache.
//!
//! ## Example
//!
//! ```rust,no_run
//! use helixagent_ensemble::context::RequestContext;
//! use helixagent_ensemble::debate::DebateOrchestrator;
//! use helixagent_ensemble::embedding::TrigramEmbedder;
//! use helixagent_ensemble::models::{ChatRequest, Message};
//! use helixagent_ensemble::registry::ProviderRegistry;
//! use std::sync::Arc;
//!
//! # async fn example(registry: Arc<ProviderRegistry>) -> helixagent_ensemble::Result<()> {
//! let orchestrator =
//!     DebateOrchestrator::new(registry, Arc::new(TrigramEmbedder::default()));
//! let request = ChatRequest {
//!     model: "ensemble".to_string(),
//!     messages: vec![Message::user("What is 2+2?")],
//!     ..Default::default()
//! };
//! let config = orchestrator.config_for(&request);
//! let outcome = orchestrator
//!     .run(&request, config, &RequestContext::new())
//!     .await?;
//! println!("{} (confidence {:.2})", outcome.consensus, outcome.confidence);
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod context;
pub mod debate;
pub mod embedding;
pub mod error;
pub mod events;
pub mod health;
pub mod memory;
pub mod models;
pub mod providers;
pub mod registry;
pub mod router;
pub mod scoring;
pub mod semantic_cache;
pub mod snapshots;
pub mod verification;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use context::RequestContext;
pub use debate::session::{DebateConfig, DebateOutcome, DebatePhase, DebateRole, DebateStyle};
pub use debate::DebateOrchestrator;
pub use embedding::{Embedder, TrigramEmbedder};
pub use error::{EnsembleError, ProviderError};
pub use health::{HealthConfig, HealthEngine, HealthStatus};
pub use memory::{MemoryConfig, MemoryPipeline};
pub use models::{ChatRequest, ChatResponse, Choice, Message, Role, StreamChunk, Usage};
pub use providers::{
    create_adapter, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};
pub use registry::ProviderRegistry;
pub use router::RetryPolicy;
pub use scoring::{ProviderScore, ScoreWeights};
pub use semantic_cache::{SemanticCache, SemanticCacheConfig};
pub use verification::{VerificationResult, Verifier, VerifierConfig};

/// Result type for ensemble operations.
pub type Result<T> = std::result::Result<T, EnsembleError>;

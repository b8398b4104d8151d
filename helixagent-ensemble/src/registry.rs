//! # Provider Registry
//!
//! Owns every provider for the lifetime of the process: the adapter trait
//! object, its circuit breaker, its enabled flag, and the latest
//! verification result. Registration and de-registration are rare writes
//! behind a `RwLock`; the hot path is `pick`, which reads a snapshot of the
//! eligible pool.
//!
//! A provider enters a request's effective pool only if its health status
//! is not unhealthy, its circuit is not open, and its last verification is
//! admissible.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::EnsembleError;
use crate::health::{HealthConfig, HealthLedger, HealthSnapshot, HealthStatus};
use crate::providers::{
    create_adapter, CapabilityRequirements, ProviderAdapter, ProviderConfig,
};
use crate::scoring::{ProviderScore, ScoreBoard, ScoreWeights};
use crate::snapshots::{Observation, SharedSnapshotStore};
use crate::verification::{VerificationResult, VerifierConfig};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A provider as owned by the registry.
pub struct RegisteredProvider {
    pub adapter: Arc<dyn ProviderAdapter>,
    pub config: ProviderConfig,
    pub breaker: Arc<CircuitBreaker>,
    enabled: AtomicBool,
}

impl RegisteredProvider {
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for RegisteredProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredProvider")
            .field("adapter", &self.adapter.id())
            .field("config", &self.config)
            .field("breaker", &self.breaker)
            .field("enabled", &self.enabled())
            .finish()
    }
}

/// Combined health view for the status endpoints: ledger data plus the
/// breaker state.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthRecord {
    #[serde(flatten)]
    pub snapshot: Option<HealthSnapshot>,
    pub circuit_state: CircuitState,
    pub opened_for_secs: Option<u64>,
}

pub struct ProviderRegistry {
    providers: RwLock<HashMap<String, Arc<RegisteredProvider>>>,
    verifications: DashMap<String, VerificationResult>,
    health: Arc<HealthLedger>,
    scores: Arc<ScoreBoard>,
    breaker_config: CircuitBreakerConfig,
    verifier_config: VerifierConfig,
    snapshots: Option<SharedSnapshotStore>,
    /// Blended USD per million tokens, by provider id; feeds the cost
    /// component of the score
    cost_table: DashMap<String, f64>,
}

impl ProviderRegistry {
    pub fn new(
        weights: ScoreWeights,
        health_config: HealthConfig,
        breaker_config: CircuitBreakerConfig,
        verifier_config: VerifierConfig,
    ) -> Result<Self, EnsembleError> {
        let scores = ScoreBoard::new(weights).map_err(|message| EnsembleError::Internal {
            message,
        })?;
        Ok(Self {
            providers: RwLock::new(HashMap::new()),
            verifications: DashMap::new(),
            health: Arc::new(HealthLedger::new(health_config)),
            scores: Arc::new(scores),
            breaker_config,
            verifier_config,
            snapshots: None,
            cost_table: DashMap::new(),
        })
    }

    pub fn with_snapshot_store(mut self, store: SharedSnapshotStore) -> Self {
        self.snapshots = Some(store);
        self
    }

    /// Create and register the adapter for a configuration.
    pub async fn register(&self, config: ProviderConfig) -> Result<(), EnsembleError> {
        let adapter = create_adapter(config.clone())?;
        let provider = Arc::new(RegisteredProvider {
            breaker: Arc::new(CircuitBreaker::new(
                config.id.clone(),
                self.breaker_config.clone(),
            )),
            enabled: AtomicBool::new(config.enabled),
            adapter,
            config,
        });
        let mut providers = self.providers.write().await;
        let id = provider.config.id.clone();
        if providers.insert(id.clone(), provider).is_some() {
            tracing::warn!(provider = %id, "re-registered existing provider");
        }
        Ok(())
    }

    /// Register an already-built adapter (tests, custom integrations).
    pub async fn register_adapter(
        &self,
        config: ProviderConfig,
        adapter: Arc<dyn ProviderAdapter>,
    ) {
        let provider = Arc::new(RegisteredProvider {
            breaker: Arc::new(CircuitBreaker::new(
                config.id.clone(),
                self.breaker_config.clone(),
            )),
            enabled: AtomicBool::new(config.enabled),
            adapter,
            config,
        });
        let mut providers = self.providers.write().await;
        providers.insert(provider.config.id.clone(), provider);
    }

    pub async fn deregister(&self, id: &str) -> bool {
        let removed = self.providers.write().await.remove(id).is_some();
        if removed {
            self.verifications.remove(id);
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<RegisteredProvider>> {
        // Hot path: `blocking_read` is not available on the runtime, so a
        // try_read miss (a registration in progress) is treated as absent
        // for this call.
        self.providers
            .try_read()
            .ok()
            .and_then(|map| map.get(id).cloned())
    }

    pub fn all(&self) -> Vec<Arc<RegisteredProvider>> {
        self.providers
            .try_read()
            .map(|map| map.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let providers = self.providers.read().await;
        let Some(provider) = providers.get(id) else {
            return false;
        };
        provider.enabled.store(enabled, Ordering::Relaxed);
        if let Some(store) = &self.snapshots {
            store.set_enabled(id, enabled).await;
        }
        true
    }

    pub fn health_ledger(&self) -> Arc<HealthLedger> {
        self.health.clone()
    }

    pub fn scores(&self) -> Arc<ScoreBoard> {
        self.scores.clone()
    }

    pub fn set_cost(&self, id: &str, usd_per_million_tokens: f64) {
        self.cost_table.insert(id.to_string(), usd_per_million_tokens);
    }

    /// Record a verification outcome and snapshot it append-only.
    pub fn record_verification(&self, id: &str, result: VerificationResult) {
        if let Some(store) = &self.snapshots {
            let store = store.clone();
            let observation = Observation {
                provider_id: id.to_string(),
                observed_at: result.verified_at,
                value: result.clone(),
            };
            tokio::spawn(async move {
                store.record_verification(observation).await;
            });
        }
        self.verifications.insert(id.to_string(), result);
    }

    pub fn verification(&self, id: &str) -> Option<VerificationResult> {
        self.verifications.get(id).map(|v| v.clone())
    }

    /// Refresh a provider's score from current health and verification.
    pub fn refresh_score(&self, id: &str) -> Option<ProviderScore> {
        let overall = self
            .verifications
            .get(id)
            .map(|v| v.overall)
            .unwrap_or(0.0);
        let cost = self.cost_table.get(id).map(|c| *c).unwrap_or(10.0);
        let inputs = self.health.score_inputs(id, cost, overall);
        let score = self.scores.update(id, inputs);
        if let Some(store) = &self.snapshots {
            let store = store.clone();
            let observation = Observation {
                provider_id: id.to_string(),
                observed_at: chrono::Utc::now(),
                value: score,
            };
            tokio::spawn(async move {
                store.record_score(observation).await;
            });
        }
        Some(score)
    }

    /// The admissibility predicate.
    pub fn admissible(&self, provider: &RegisteredProvider) -> bool {
        if !provider.enabled() {
            return false;
        }
        if self.health.status(&provider.config.id) == HealthStatus::Unhealthy {
            return false;
        }
        if provider.breaker.state() == CircuitState::Open {
            return false;
        }
        self.verifications
            .get(&provider.config.id)
            .map(|v| v.admissible(self.verifier_config.min_overall))
            .unwrap_or(false)
    }

    /// Eligible pool for a request, sorted by composite score descending,
    /// ties broken by p50 latency ascending, then id lexicographic.
    pub fn eligible_pool(
        &self,
        required: &CapabilityRequirements,
        excluded: &HashSet<String>,
    ) -> Vec<Arc<RegisteredProvider>> {
        let mut pool: Vec<Arc<RegisteredProvider>> = self
            .all()
            .into_iter()
            .filter(|p| !excluded.contains(&p.config.id))
            .filter(|p| required.satisfied_by(&p.adapter.capabilities()))
            .filter(|p| self.admissible(p))
            .collect();

        pool.sort_by(|a, b| {
            let score_a = self.scores.composite(&a.config.id);
            let score_b = self.scores.composite(&b.config.id);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.health
                        .p50(&a.config.id)
                        .cmp(&self.health.p50(&b.config.id))
                })
                .then_with(|| a.config.id.cmp(&b.config.id))
        });
        pool
    }

    /// Selection policy: head of the eligible pool or `NoEligibleProvider`.
    pub fn pick(
        &self,
        required: &CapabilityRequirements,
        excluded: &HashSet<String>,
    ) -> Result<Arc<RegisteredProvider>, EnsembleError> {
        self.eligible_pool(required, excluded)
            .into_iter()
            .next()
            .ok_or_else(|| EnsembleError::NoEligibleProvider {
                message: "no admissible provider matches the requested capabilities".to_string(),
            })
    }

    /// Health record for the status endpoints.
    pub fn health_record(&self, id: &str) -> Option<HealthRecord> {
        let provider = self.get(id)?;
        let breaker = provider.breaker.snapshot();
        Some(HealthRecord {
            snapshot: self.health.snapshot(id),
            circuit_state: breaker.state,
            opened_for_secs: breaker.opened_at.map(|t| t.elapsed().as_secs()),
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::models::{ChatRequest, ChatResponse, Choice, Message, Usage};
    use crate::providers::{ChunkStream, ProbeReport, ProviderCapabilities, ProviderKind};
    use crate::verification::VerificationResult;
    use std::sync::atomic::AtomicU64;
    use std::time::Duration;

    /// Scripted test adapter: a fixed reply, an optional scripted error,
    /// and a call counter.
    pub struct StaticAdapter {
        pub name: String,
        pub reply: String,
        pub fail_with: Option<fn() -> crate::error::ProviderError>,
        pub calls: AtomicU64,
        pub delay: Duration,
    }

    impl StaticAdapter {
        pub fn answering(name: &str, reply: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                reply: reply.to_string(),
                fail_with: None,
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
            })
        }

        pub fn failing(name: &str, error: fn() -> crate::error::ProviderError) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                reply: String::new(),
                fail_with: Some(error),
                calls: AtomicU64::new(0),
                delay: Duration::ZERO,
            })
        }

        pub fn slow(name: &str, reply: &str, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                reply: reply.to_string(),
                fail_with: None,
                calls: AtomicU64::new(0),
                delay,
            })
        }
    }

    #[async_trait::async_trait]
    impl ProviderAdapter for StaticAdapter {
        fn id(&self) -> &str {
            &self.name
        }

        fn kind(&self) -> ProviderKind {
            ProviderKind::Local
        }

        fn capabilities(&self) -> ProviderCapabilities {
            ProviderCapabilities::default()
        }

        async fn complete(
            &self,
            request: ChatRequest,
        ) -> Result<ChatResponse, crate::error::ProviderError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(make_error) = self.fail_with {
                return Err(make_error());
            }
            let prompt_tokens = request
                .messages
                .iter()
                .map(|m| crate::models::estimate_tokens(&m.content))
                .sum();
            Ok(ChatResponse {
                id: format!("{}-resp", self.name),
                object: "chat.completion".to_string(),
                created: chrono::Utc::now().timestamp() as u64,
                model: self.name.clone(),
                choices: vec![Choice {
                    index: 0,
                    message: Message::assistant(self.reply.clone()),
                    finish_reason: Some("stop".to_string()),
                }],
                usage: Some(Usage {
                    prompt_tokens,
                    completion_tokens: crate::models::estimate_tokens(&self.reply),
                    total_tokens: prompt_tokens
                        + crate::models::estimate_tokens(&self.reply),
                }),
            })
        }

        async fn complete_stream(
            &self,
            request: ChatRequest,
        ) -> Result<ChunkStream, crate::error::ProviderError> {
            let response = self.complete(request).await?;
            let chunk = crate::models::StreamChunk {
                id: response.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: response.created,
                model: response.model.clone(),
                choices: vec![crate::models::StreamChoice {
                    index: 0,
                    delta: crate::models::Delta {
                        role: None,
                        content: Some(response.content().to_string()),
                    },
                    finish_reason: Some("stop".to_string()),
                }],
            };
            Ok(Box::pin(futures::stream::iter(vec![Ok(chunk)])))
        }

        async fn probe(&self) -> Result<ProbeReport, crate::error::ProviderError> {
            Ok(ProbeReport {
                latency: Duration::from_millis(1),
                detail: None,
            })
        }
    }

    /// Registry with default configs and a set of pre-admitted adapters.
    pub async fn registry_with(
        adapters: Vec<Arc<StaticAdapter>>,
    ) -> Arc<ProviderRegistry> {
        let registry = Arc::new(
            ProviderRegistry::new(
                ScoreWeights::default(),
                HealthConfig::default(),
                CircuitBreakerConfig::default(),
                VerifierConfig::default(),
            )
            .unwrap(),
        );
        for adapter in adapters {
            let config = ProviderConfig::new(adapter.name.clone(), ProviderKind::Local);
            registry
                .register_adapter(config, adapter.clone() as Arc<dyn ProviderAdapter>)
                .await;
            admit(&registry, &adapter.name);
        }
        registry
    }

    /// Mark a provider verified-admissible without running the suite.
    pub fn admit(registry: &ProviderRegistry, id: &str) {
        registry.record_verification(
            id,
            VerificationResult {
                code_visible: true,
                sub_scores: Default::default(),
                overall: 0.95,
                verified_at: chrono::Utc::now(),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn unverified_providers_are_not_eligible() {
        let registry = registry_with(vec![]).await;
        registry
            .register_adapter(
                ProviderConfig::new("fresh", crate::providers::ProviderKind::Local),
                StaticAdapter::answering("fresh", "hi") as Arc<dyn ProviderAdapter>,
            )
            .await;

        let pool = registry.eligible_pool(&CapabilityRequirements::default(), &HashSet::new());
        assert!(pool.is_empty());

        admit(&registry, "fresh");
        let pool = registry.eligible_pool(&CapabilityRequirements::default(), &HashSet::new());
        assert_eq!(pool.len(), 1);
    }

    #[tokio::test]
    async fn open_circuit_removes_provider_from_pool() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "x")]).await;
        registry.get("a").unwrap().breaker.force_open();
        let err = registry
            .pick(&CapabilityRequirements::default(), &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, EnsembleError::NoEligibleProvider { .. }));
    }

    #[tokio::test]
    async fn unhealthy_provider_is_filtered() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "x")]).await;
        let ledger = registry.health_ledger();
        ledger.apply_probe("a", Ok(std::time::Duration::from_millis(10)));
        for _ in 0..6 {
            ledger.apply_probe("a", Err(()));
        }
        assert_eq!(ledger.status("a"), HealthStatus::Unhealthy);
        assert!(registry
            .pick(&CapabilityRequirements::default(), &HashSet::new())
            .is_err());
    }

    #[tokio::test]
    async fn pick_is_deterministic_under_equal_scores() {
        let registry = registry_with(vec![
            StaticAdapter::answering("zulu", "z"),
            StaticAdapter::answering("alpha", "a"),
        ])
        .await;
        let picked = registry
            .pick(&CapabilityRequirements::default(), &HashSet::new())
            .unwrap();
        assert_eq!(picked.config.id, "alpha");
    }

    #[tokio::test]
    async fn excluded_providers_are_skipped() {
        let registry = registry_with(vec![
            StaticAdapter::answering("alpha", "a"),
            StaticAdapter::answering("bravo", "b"),
        ])
        .await;
        let mut excluded = HashSet::new();
        excluded.insert("alpha".to_string());
        let picked = registry.pick(&CapabilityRequirements::default(), &excluded).unwrap();
        assert_eq!(picked.config.id, "bravo");
    }

    #[tokio::test]
    async fn disabled_provider_is_inadmissible() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "x")]).await;
        registry.set_enabled("a", false).await;
        assert!(registry
            .pick(&CapabilityRequirements::default(), &HashSet::new())
            .is_err());
        registry.set_enabled("a", true).await;
        assert!(registry
            .pick(&CapabilityRequirements::default(), &HashSet::new())
            .is_ok());
    }

    #[tokio::test]
    async fn deregister_removes_provider() {
        let registry = registry_with(vec![StaticAdapter::answering("a", "x")]).await;
        assert!(registry.deregister("a").await);
        assert!(registry.get("a").is_none());
    }
}

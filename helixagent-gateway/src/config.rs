//! # Gateway Configuration
//!
//! TOML configuration with environment-variable overrides, validated at
//! startup. A missing file yields the defaults (one local Ollama provider)
//! so a bare `helixagent serve` comes up for development.
//!
//! ## Environment overrides
//!
//! - `HOST` / `PORT` - bind address.
//! - `LOG_LEVEL` - tracing filter.
//! - `<PROVIDER>_API_KEY` - credential for a configured provider (the id
//!   uppercased, dashes as underscores).
//! - `<PROVIDER>_USE_OAUTH_CREDENTIALS=true` - switch a provider to its
//!   CLI-proxied OAuth mode.
//! - `VERIFIER_INTERVAL_HOURS`, `VERIFIER_MIN_OVERALL` - verification
//!   schedule and admission floor.
//! - Store endpoints (`REDIS_URL`, `POSTGRES_URL`, …) are consumed by the
//!   external collaborators wired behind the store traits, not parsed
//!   here.

use helixagent_ensemble::circuit_breaker::CircuitBreakerConfig;
use helixagent_ensemble::debate::session::DebateConfig;
use helixagent_ensemble::health::HealthConfig;
use helixagent_ensemble::memory::MemoryConfig;
use helixagent_ensemble::providers::{ProviderConfig, ProviderKind};
use helixagent_ensemble::router::RetryPolicy;
use helixagent_ensemble::scoring::ScoreWeights;
use helixagent_ensemble::semantic_cache::SemanticCacheConfig;
use helixagent_ensemble::verification::VerifierConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    /// Providers keyed by id
    #[serde(default)]
    pub providers: HashMap<String, ProviderToml>,
    #[serde(default)]
    pub debate: DebateToml,
    #[serde(default)]
    pub cache: CacheToml,
    #[serde(default)]
    pub memory: MemoryToml,
    #[serde(default)]
    pub verifier: VerifierToml,
    #[serde(default)]
    pub scoring: ScoringToml,
    #[serde(default)]
    pub health: HealthToml,
    #[serde(default)]
    pub retry: RetryToml,
    #[serde(default)]
    pub circuit_breaker: BreakerToml,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Whole-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub cors: CorsConfig,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    300
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allowed_origins: Vec::new(),
        }
    }
}

/// Provider entry as written in TOML; folded into the SDK's
/// [`ProviderConfig`] at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderToml {
    pub kind: ProviderKind,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Blended USD per million tokens, feeds the cost score component
    #[serde(default = "default_cost")]
    pub cost_per_million_tokens: f64,
    /// Prefer the CLI-proxied OAuth mode over a direct API key
    #[serde(default)]
    pub use_oauth_credentials: bool,
}

fn default_provider_timeout() -> u64 {
    30
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_cost() -> f64 {
    10.0
}

impl ProviderToml {
    pub fn to_provider_config(&self, id: &str) -> ProviderConfig {
        let kind = self.effective_kind();
        ProviderConfig {
            id: id.to_string(),
            kind,
            api_key: self.api_key.clone(),
            base_url: self.base_url.clone(),
            timeout: Duration::from_secs(self.timeout_secs),
            model_mapping: self.model_mapping.clone(),
            headers: self.headers.clone(),
            weight: self.weight,
            enabled: self.enabled,
            capabilities: None,
        }
    }

    /// OAuth mode swaps direct-API kinds for their CLI proxies.
    pub fn effective_kind(&self) -> ProviderKind {
        if !self.use_oauth_credentials {
            return self.kind;
        }
        match self.kind {
            ProviderKind::Anthropic => ProviderKind::ClaudeCli,
            ProviderKind::Qwen => ProviderKind::QwenCli,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebateToml {
    #[serde(default = "default_rounds")]
    pub rounds_max: u32,
    #[serde(default = "default_consensus_threshold")]
    pub consensus_threshold: f64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
    #[serde(default)]
    pub enable_multi_pass_validation: bool,
    #[serde(default = "default_skip_confidence")]
    pub min_confidence_to_skip: f64,
    #[serde(default = "default_participant_timeout")]
    pub participant_timeout_secs: u64,
}

fn default_rounds() -> u32 {
    3
}

fn default_consensus_threshold() -> f64 {
    0.75
}

fn default_min_confidence() -> f64 {
    0.8
}

fn default_skip_confidence() -> f64 {
    0.9
}

fn default_participant_timeout() -> u64 {
    60
}

impl Default for DebateToml {
    fn default() -> Self {
        Self {
            rounds_max: default_rounds(),
            consensus_threshold: default_consensus_threshold(),
            min_confidence: default_min_confidence(),
            enable_multi_pass_validation: false,
            min_confidence_to_skip: default_skip_confidence(),
            participant_timeout_secs: default_participant_timeout(),
        }
    }
}

impl DebateToml {
    pub fn to_debate_config(&self) -> DebateConfig {
        DebateConfig {
            rounds_max: self.rounds_max,
            consensus_threshold: self.consensus_threshold,
            min_confidence: self.min_confidence,
            enable_multi_pass_validation: self.enable_multi_pass_validation,
            min_confidence_to_skip: self.min_confidence_to_skip,
            participant_timeout: Duration::from_secs(self.participant_timeout_secs),
            ..DebateConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheToml {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_similarity")]
    pub similarity_threshold: f32,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

fn default_similarity() -> f32 {
    0.85
}

fn default_cache_entries() -> usize {
    1000
}

fn default_cache_ttl() -> u64 {
    3600
}

impl Default for CacheToml {
    fn default() -> Self {
        Self {
            enabled: true,
            similarity_threshold: default_similarity(),
            max_entries: default_cache_entries(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheToml {
    pub fn to_cache_config(&self) -> SemanticCacheConfig {
        SemanticCacheConfig {
            similarity_threshold: self.similarity_threshold,
            max_entries: self.max_entries,
            ttl: Duration::from_secs(self.ttl_secs),
            ..SemanticCacheConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryToml {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_relevance")]
    pub relevance_threshold: f64,
    #[serde(default = "default_injection")]
    pub max_context_injection: usize,
}

fn default_top_k() -> usize {
    10
}

fn default_relevance() -> f64 {
    0.7
}

fn default_injection() -> usize {
    2048
}

impl Default for MemoryToml {
    fn default() -> Self {
        Self {
            enabled: true,
            top_k: default_top_k(),
            relevance_threshold: default_relevance(),
            max_context_injection: default_injection(),
        }
    }
}

impl MemoryToml {
    pub fn to_memory_config(&self) -> MemoryConfig {
        MemoryConfig {
            top_k: self.top_k,
            relevance_threshold: self.relevance_threshold,
            max_context_injection: self.max_context_injection,
            ..MemoryConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierToml {
    #[serde(default = "default_verifier_hours")]
    pub interval_hours: u64,
    #[serde(default = "default_min_overall")]
    pub min_overall: f64,
}

fn default_verifier_hours() -> u64 {
    24
}

fn default_min_overall() -> f64 {
    0.6
}

impl Default for VerifierToml {
    fn default() -> Self {
        Self {
            interval_hours: default_verifier_hours(),
            min_overall: default_min_overall(),
        }
    }
}

impl VerifierToml {
    pub fn to_verifier_config(&self) -> VerifierConfig {
        VerifierConfig {
            refresh_interval: Duration::from_secs(self.interval_hours * 3600),
            min_overall: self.min_overall,
            ..VerifierConfig::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringToml {
    #[serde(default = "default_speed_weight")]
    pub speed: f64,
    #[serde(default = "default_efficiency_weight")]
    pub efficiency: f64,
    #[serde(default = "default_cost_weight")]
    pub cost: f64,
    #[serde(default = "default_capability_weight")]
    pub capability: f64,
    #[serde(default = "default_recency_weight")]
    pub recency: f64,
}

fn default_speed_weight() -> f64 {
    0.25
}

fn default_efficiency_weight() -> f64 {
    0.20
}

fn default_cost_weight() -> f64 {
    0.25
}

fn default_capability_weight() -> f64 {
    0.20
}

fn default_recency_weight() -> f64 {
    0.10
}

impl Default for ScoringToml {
    fn default() -> Self {
        Self {
            speed: default_speed_weight(),
            efficiency: default_efficiency_weight(),
            cost: default_cost_weight(),
            capability: default_capability_weight(),
            recency: default_recency_weight(),
        }
    }
}

impl ScoringToml {
    pub fn to_weights(&self) -> ScoreWeights {
        ScoreWeights {
            speed: self.speed,
            efficiency: self.efficiency,
            cost: self.cost,
            capability: self.capability,
            recency: self.recency,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HealthToml {
    #[serde(default)]
    pub probe_interval_secs: Option<u64>,
}

impl HealthToml {
    pub fn to_health_config(&self) -> HealthConfig {
        let mut config = HealthConfig::default();
        if let Some(secs) = self.probe_interval_secs {
            config.probe_interval = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetryToml {
    #[serde(default)]
    pub max_retries: Option<u32>,
    #[serde(default)]
    pub initial_delay_secs: Option<u64>,
}

impl RetryToml {
    pub fn to_retry_policy(&self) -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Some(max) = self.max_retries {
            policy.max_retries = max;
        }
        if let Some(secs) = self.initial_delay_secs {
            policy.initial_delay = Duration::from_secs(secs);
        }
        policy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BreakerToml {
    #[serde(default)]
    pub failure_threshold: Option<u32>,
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

impl BreakerToml {
    pub fn to_breaker_config(&self) -> CircuitBreakerConfig {
        let mut config = CircuitBreakerConfig::default();
        if let Some(threshold) = self.failure_threshold {
            config.failure_threshold = threshold;
        }
        if let Some(secs) = self.cooldown_secs {
            config.cooldown = Duration::from_secs(secs);
        }
        config
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from a TOML file, apply env overrides, validate. A missing
    /// file falls back to defaults with a local Ollama provider.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => toml::from_str::<Config>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(path, "config file not found, using defaults");
                Config::default_dev()
            }
            Err(e) => return Err(e.into()),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Development defaults: one keyless Ollama provider.
    pub fn default_dev() -> Self {
        let mut providers = HashMap::new();
        providers.insert(
            "ollama".to_string(),
            ProviderToml {
                kind: ProviderKind::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434".to_string()),
                timeout_secs: default_provider_timeout(),
                model_mapping: HashMap::new(),
                headers: HashMap::new(),
                weight: 1.0,
                enabled: true,
                cost_per_million_tokens: 0.0,
                use_oauth_credentials: false,
            },
        );
        Self {
            server: ServerConfig::default(),
            providers,
            debate: DebateToml::default(),
            cache: CacheToml::default(),
            memory: MemoryToml::default(),
            verifier: VerifierToml::default(),
            scoring: ScoringToml::default(),
            health: HealthToml::default(),
            retry: RetryToml::default(),
            circuit_breaker: BreakerToml::default(),
            logging: LoggingConfig::default(),
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(host) = env::var("HOST") {
            self.server.host = host;
        }
        if let Ok(port) = env::var("PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
            }
        }
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Ok(hours) = env::var("VERIFIER_INTERVAL_HOURS") {
            if let Ok(hours) = hours.parse() {
                self.verifier.interval_hours = hours;
            }
        }
        if let Ok(min) = env::var("VERIFIER_MIN_OVERALL") {
            if let Ok(min) = min.parse() {
                self.verifier.min_overall = min;
            }
        }

        for (id, provider) in self.providers.iter_mut() {
            let prefix = id.to_uppercase().replace('-', "_");
            if let Ok(key) = env::var(format!("{prefix}_API_KEY")) {
                provider.api_key = Some(key);
            }
            if let Ok(flag) = env::var(format!("{prefix}_USE_OAUTH_CREDENTIALS")) {
                provider.use_oauth_credentials = flag.eq_ignore_ascii_case("true");
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("server.port must be non-zero");
        }
        if self.providers.is_empty() {
            anyhow::bail!("at least one provider must be configured");
        }
        self.scoring
            .to_weights()
            .validate()
            .map_err(|e| anyhow::anyhow!(e))?;
        if !(0.0..=1.0).contains(&self.debate.consensus_threshold) {
            anyhow::bail!("debate.consensus_threshold must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.verifier.min_overall) {
            anyhow::bail!("verifier.min_overall must be in [0, 1]");
        }
        if !(0.0f32..=1.0).contains(&self.cache.similarity_threshold) {
            anyhow::bail!("cache.similarity_threshold must be in [0, 1]");
        }
        for (id, provider) in &self.providers {
            let needs_key = matches!(
                provider.effective_kind(),
                ProviderKind::Anthropic | ProviderKind::Gemini
            );
            if needs_key && provider.api_key.is_none() && provider.enabled {
                anyhow::bail!(
                    "provider {id} requires an API key (set {}_API_KEY or use_oauth_credentials)",
                    id.to_uppercase().replace('-', "_")
                );
            }
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_dev()
    }
}

//! # Provider Federation Layer
//!
//! Uniform façade over heterogeneous upstream LLM APIs. Every upstream is
//! wrapped by a [`ProviderAdapter`]: a thin wire translator that maps the
//! crate's OpenAI-shaped types onto the provider's own format and
//! normalizes every failure into the [`ProviderError`] taxonomy.
//!
//! ## Supported upstreams
//!
//! - **Anthropic** - native messages API.
//! - **Gemini** - native `generateContent` API.
//! - **DeepSeek, Qwen, Mistral, OpenRouter, local servers** - OpenAI-wire
//!   compatible endpoints sharing one codec ([`openai_compat`]).
//! - **Ollama** - native `/api/chat`.
//! - **CLI proxies** - OAuth-gated provider CLIs driven over subprocess IPC
//!   ([`cli_proxy`]).
//!
//! Adapters are created through [`create_adapter`] from a declarative
//! [`ProviderConfig`] and owned by the registry as `Arc<dyn ProviderAdapter>`
//! trait objects.

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamChunk};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

pub mod anthropic;
pub mod cli_proxy;
pub mod deepseek;
pub mod gemini;
pub mod http_client;
pub mod local;
pub mod mistral;
pub mod ollama;
pub mod openai_compat;
pub mod openrouter;
pub mod qwen;

/// Lazy, finite, non-restartable sequence of streamed chunks.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Uniform contract implemented by every upstream adapter.
///
/// Wire translation is adapter-local: role mapping, stop sequences,
/// temperature bounds and max-token caps are clamped to provider limits
/// silently, with a warning event.
#[async_trait::async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable provider identifier (registry key).
    fn id(&self) -> &str;

    /// Which upstream family this adapter speaks to.
    fn kind(&self) -> ProviderKind;

    /// Declared capabilities. Verification only scores capability tests the
    /// adapter declares.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Single-shot completion.
    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Streaming completion. The returned stream terminates with the last
    /// chunk or an error variant; it cannot be restarted.
    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError>;

    /// Cheap liveness call with no billing side effects where avoidable.
    async fn probe(&self) -> Result<ProbeReport, ProviderError>;

    /// Embedding generation. Only meaningful when
    /// `capabilities().embeddings` is declared.
    async fn embed(&self, _request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        Err(ProviderError::InvalidRequest {
            message: format!("{} does not support embeddings", self.id()),
        })
    }
}

/// Outcome of a liveness probe.
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub latency: Duration,
    pub detail: Option<String>,
}

/// Upstream families the factory knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    Anthropic,
    Gemini,
    Deepseek,
    Qwen,
    Mistral,
    Openrouter,
    Ollama,
    /// OpenAI-wire local server, optional device-id-only free tier
    Local,
    /// Claude CLI relayed over subprocess IPC
    ClaudeCli,
    /// Qwen CLI relayed over subprocess IPC
    QwenCli,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Deepseek => "deepseek",
            ProviderKind::Qwen => "qwen",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Openrouter => "openrouter",
            ProviderKind::Ollama => "ollama",
            ProviderKind::Local => "local",
            ProviderKind::ClaudeCli => "claude-cli",
            ProviderKind::QwenCli => "qwen-cli",
        }
    }
}

/// Declared feature set of a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub streaming: bool,
    pub function_calling: bool,
    pub vision: bool,
    pub embeddings: bool,
    /// Maximum context window in tokens
    pub max_context: u32,
    pub languages: Vec<String>,
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            streaming: true,
            function_calling: false,
            vision: false,
            embeddings: false,
            max_context: 128_000,
            languages: vec!["en".to_string()],
        }
    }
}

/// Capability filter used by the router's `pick`.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRequirements {
    pub streaming: bool,
    pub function_calling: bool,
    pub vision: bool,
    pub embeddings: bool,
}

impl CapabilityRequirements {
    pub fn satisfied_by(&self, caps: &ProviderCapabilities) -> bool {
        (!self.streaming || caps.streaming)
            && (!self.function_calling || caps.function_calling)
            && (!self.vision || caps.vision)
            && (!self.embeddings || caps.embeddings)
    }
}

/// Declarative configuration for one provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Registry key; unique per instance
    pub id: String,
    pub kind: ProviderKind,
    /// API key; absent for CLI proxies and keyless local servers
    #[serde(default)]
    pub api_key: Option<String>,
    /// Override for the upstream endpoint
    #[serde(default)]
    pub base_url: Option<String>,
    /// HTTP request timeout
    #[serde(default = "default_timeout", with = "duration_secs")]
    pub timeout: Duration,
    /// Client alias → provider model name
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    /// Extra HTTP headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Relative weight used by scoring
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Capability declaration override; defaults per kind
    #[serde(default)]
    pub capabilities: Option<ProviderCapabilities>,
}

fn default_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_weight() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl ProviderConfig {
    pub fn new(id: impl Into<String>, kind: ProviderKind) -> Self {
        Self {
            id: id.into(),
            kind,
            api_key: None,
            base_url: None,
            timeout: default_timeout(),
            model_mapping: HashMap::new(),
            headers: HashMap::new(),
            weight: default_weight(),
            enabled: true,
            capabilities: None,
        }
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_model_mapping(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.model_mapping.insert(from.into(), to.into());
        self
    }

    /// Resolve a client model alias through the mapping table.
    pub fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }
}

/// Serde helper for durations expressed in whole seconds.
pub(crate) mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Build the adapter for a configuration.
///
/// CLI-proxy kinds are built when the corresponding binary exists on PATH;
/// a missing binary is a configuration error so the operator learns at
/// startup, not at first request.
pub fn create_adapter(config: ProviderConfig) -> Result<Arc<dyn ProviderAdapter>, ProviderError> {
    match config.kind {
        ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicAdapter::new(config)?)),
        ProviderKind::Gemini => Ok(Arc::new(gemini::GeminiAdapter::new(config)?)),
        ProviderKind::Deepseek => Ok(Arc::new(deepseek::DeepseekAdapter::new(config)?)),
        ProviderKind::Qwen => Ok(Arc::new(qwen::QwenAdapter::new(config)?)),
        ProviderKind::Mistral => Ok(Arc::new(mistral::MistralAdapter::new(config)?)),
        ProviderKind::Openrouter => Ok(Arc::new(openrouter::OpenRouterAdapter::new(config)?)),
        ProviderKind::Ollama => Ok(Arc::new(ollama::OllamaAdapter::new(config)?)),
        ProviderKind::Local => Ok(Arc::new(local::LocalServerAdapter::new(config)?)),
        ProviderKind::ClaudeCli => Ok(Arc::new(cli_proxy::CliProxyAdapter::claude(config)?)),
        ProviderKind::QwenCli => Ok(Arc::new(cli_proxy::CliProxyAdapter::qwen(config)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_requirements_filter() {
        let caps = ProviderCapabilities {
            streaming: true,
            function_calling: false,
            vision: false,
            embeddings: true,
            ..Default::default()
        };
        let needs_streaming = CapabilityRequirements {
            streaming: true,
            ..Default::default()
        };
        assert!(needs_streaming.satisfied_by(&caps));

        let needs_vision = CapabilityRequirements {
            vision: true,
            ..Default::default()
        };
        assert!(!needs_vision.satisfied_by(&caps));
    }

    #[test]
    fn model_mapping_falls_through() {
        let config = ProviderConfig::new("anthropic", ProviderKind::Anthropic)
            .with_model_mapping("claude", "claude-sonnet-4-20250514");
        assert_eq!(config.map_model("claude"), "claude-sonnet-4-20250514");
        assert_eq!(config.map_model("unknown"), "unknown");
    }

    #[test]
    fn provider_kind_serde_is_kebab_case() {
        let kind: ProviderKind = serde_json::from_str("\"claude-cli\"").unwrap();
        assert_eq!(kind, ProviderKind::ClaudeCli);
        assert_eq!(
            serde_json::to_string(&ProviderKind::Openrouter).unwrap(),
            "\"openrouter\""
        );
    }
}

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse};
use crate::providers::openai_compat::OpenAiCompatAdapter;
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};

/// OpenRouter multiplexes many models behind one OpenAI-wire endpoint.
/// Attribution headers are recommended by their API docs.
pub struct OpenRouterAdapter {
    inner: OpenAiCompatAdapter,
}

impl OpenRouterAdapter {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config
            .model_mapping
            .entry("ensemble".to_string())
            .or_insert_with(|| "openrouter/auto".to_string());
        config
            .headers
            .entry("HTTP-Referer".to_string())
            .or_insert_with(|| "https://github.com/helixagent/helixagent".to_string());
        config
            .headers
            .entry("X-Title".to_string())
            .or_insert_with(|| "HelixAgent".to_string());
        let capabilities = ProviderCapabilities {
            streaming: true,
            function_calling: true,
            vision: true,
            embeddings: false,
            max_context: 200_000,
            languages: vec!["en".to_string()],
        };
        let inner = OpenAiCompatAdapter::new(
            config,
            ProviderKind::Openrouter,
            "https://openrouter.ai/api",
            capabilities,
            2.0,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenRouterAdapter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Openrouter
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.inner.capabilities()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.inner.complete(request).await
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        self.inner.complete_stream(request).await
    }

    async fn probe(&self) -> Result<ProbeReport, ProviderError> {
        self.inner.probe().await
    }
}

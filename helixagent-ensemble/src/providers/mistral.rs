use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::providers::openai_compat::OpenAiCompatAdapter;
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};

/// Mistral's platform API is OpenAI-wire compatible.
pub struct MistralAdapter {
    inner: OpenAiCompatAdapter,
}

impl MistralAdapter {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        for alias in ["mistral", "ensemble"] {
            config
                .model_mapping
                .entry(alias.to_string())
                .or_insert_with(|| "mistral-large-latest".to_string());
        }
        let capabilities = ProviderCapabilities {
            streaming: true,
            function_calling: true,
            vision: false,
            embeddings: true,
            max_context: 128_000,
            languages: vec!["en".to_string(), "fr".to_string(), "de".to_string()],
        };
        let inner = OpenAiCompatAdapter::new(
            config,
            ProviderKind::Mistral,
            "https://api.mistral.ai",
            capabilities,
            1.0,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for MistralAdapter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Mistral
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

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        self.inner.embed(request).await
    }
}

use crate::error::ProviderError;
use crate::models::{ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse};
use crate::providers::openai_compat::OpenAiCompatAdapter;
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};
use uuid::Uuid;

/// Local OpenAI-compatible server (LM Studio, llamafile, vendor desktop
/// apps). When no API key is configured the adapter falls back to the
/// device-id-only free tier: a stable per-process device id sent as a
/// header instead of a credential.
pub struct LocalServerAdapter {
    inner: OpenAiCompatAdapter,
}

impl LocalServerAdapter {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_none() {
            config
                .headers
                .entry("X-Device-Id".to_string())
                .or_insert_with(|| Uuid::new_v4().to_string());
        }
        let capabilities = ProviderCapabilities {
            streaming: true,
            function_calling: false,
            vision: false,
            embeddings: true,
            max_context: 32_768,
            languages: vec!["en".to_string()],
        };
        let inner = OpenAiCompatAdapter::new(
            config,
            ProviderKind::Local,
            "http://localhost:1234",
            capabilities,
            2.0,
        )?;
        Ok(Self { inner })
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for LocalServerAdapter {
    fn id(&self) -> &str {
        self.inner.id()
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
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

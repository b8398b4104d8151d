//! Shared codec for OpenAI-wire upstreams.
//!
//! DeepSeek, Qwen (DashScope compatible mode), Mistral, OpenRouter and
//! local OpenAI-compatible servers all speak the same chat-completions wire
//! format; each gets its own adapter type carrying only its defaults while
//! the request/response/stream handling lives here.

use crate::error::ProviderError;
use crate::events::{tracing_sink, SharedSink};
use crate::models::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, StreamChunk,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};
use async_stream::stream;
use serde::Serialize;
use std::time::Instant;

/// Hard output-token ceiling applied when a request asks for more than the
/// wire format tolerates.
const MAX_OUTPUT_TOKENS: u32 = 32_768;

/// Wire request: our [`ChatRequest`] minus the ensemble extensions.
#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: String,
    messages: &'a [crate::models::Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
}

/// Generic adapter over an OpenAI-wire endpoint.
pub struct OpenAiCompatAdapter {
    http: HttpProviderClient,
    config: ProviderConfig,
    kind: ProviderKind,
    capabilities: ProviderCapabilities,
    temperature_max: f32,
    events: SharedSink,
}

impl OpenAiCompatAdapter {
    pub fn new(
        config: ProviderConfig,
        kind: ProviderKind,
        default_base: &str,
        default_capabilities: ProviderCapabilities,
        temperature_max: f32,
    ) -> Result<Self, ProviderError> {
        let auth = match &config.api_key {
            Some(key) => AuthStrategy::Bearer { token: key.clone() },
            None => AuthStrategy::None,
        };
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            default_base,
            &config.headers,
            auth,
        )?;
        let capabilities = config.capabilities.clone().unwrap_or(default_capabilities);
        Ok(Self {
            http,
            config,
            kind,
            capabilities,
            temperature_max,
            events: tracing_sink(),
        })
    }

    /// Clamp request parameters to what this upstream accepts, warning once
    /// per clamp.
    fn clamp<'a>(&self, request: &'a ChatRequest) -> WireRequest<'a> {
        let temperature = request.temperature.map(|t| {
            let clamped = t.clamp(0.0, self.temperature_max);
            if clamped != t {
                self.events.warning(
                    "provider.param_clamped",
                    &format!("{}: temperature {t} clamped to {clamped}", self.config.id),
                );
            }
            clamped
        });
        let max_tokens = request.max_tokens.map(|m| {
            let clamped = m.min(MAX_OUTPUT_TOKENS);
            if clamped != m {
                self.events.warning(
                    "provider.param_clamped",
                    &format!("{}: max_tokens {m} clamped to {clamped}", self.config.id),
                );
            }
            clamped
        });
        WireRequest {
            model: self.config.map_model(&request.model),
            messages: &request.messages,
            temperature,
            max_tokens,
            stream: None,
            top_p: request.top_p,
            stop: request.stop.as_ref(),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OpenAiCompatAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let wire = self.clamp(&request);
        self.http.post_json("/v1/chat/completions", &wire).await
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let mut wire = self.clamp(&request);
        wire.stream = Some(true);
        let response = self.http.post_json_raw("/v1/chat/completions", &wire).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }
        Ok(sse_chunk_stream(response))
    }

    async fn probe(&self) -> Result<ProbeReport, ProviderError> {
        let start = Instant::now();
        let _: serde_json::Value = self.http.get_json("/v1/models").await?;
        Ok(ProbeReport {
            latency: start.elapsed(),
            detail: None,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        if !self.capabilities.embeddings {
            return Err(ProviderError::InvalidRequest {
                message: format!("{} does not support embeddings", self.config.id),
            });
        }
        self.http.post_json("/v1/embeddings", &request).await
    }
}

/// Decode an OpenAI-wire SSE body into a chunk stream. Terminates on
/// `data: [DONE]`, stream end, or the first transport/parse error.
pub fn sse_chunk_stream(response: reqwest::Response) -> ChunkStream {
    Box::pin(stream! {
        let mut bytes_stream = response.bytes_stream();
        let mut buffer = String::new();

        while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
            match chunk_result {
                Ok(chunk) => {
                    buffer.push_str(&String::from_utf8_lossy(&chunk));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer = buffer[line_end + 1..].to_string();

                        if let Some(json_str) = line.strip_prefix("data: ") {
                            if json_str == "[DONE]" {
                                return;
                            }
                            match serde_json::from_str::<StreamChunk>(json_str) {
                                Ok(parsed) => yield Ok(parsed),
                                Err(e) => {
                                    yield Err(ProviderError::from(e));
                                    return;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    yield Err(ProviderError::from(e));
                    return;
                }
            }
        }
    })
}

use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, EmbeddingRequest, EmbeddingResponse, Embedding,
    Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Ollama's native `/api/chat`. Keyless; streaming is newline-delimited
/// JSON rather than SSE.
pub struct OllamaAdapter {
    http: HttpProviderClient,
    config: ProviderConfig,
    capabilities: ProviderCapabilities,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<OllamaOptions>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    model: String,
    message: OllamaMessage,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

impl OllamaAdapter {
    pub fn new(mut config: ProviderConfig) -> Result<Self, ProviderError> {
        config
            .model_mapping
            .entry("ensemble".to_string())
            .or_insert_with(|| "llama3.2".to_string());
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "http://localhost:11434",
            &config.headers,
            AuthStrategy::None,
        )?;
        let capabilities = config.capabilities.clone().unwrap_or(ProviderCapabilities {
            streaming: true,
            function_calling: false,
            vision: false,
            embeddings: true,
            max_context: 32_768,
            languages: vec!["en".to_string()],
        });

        Ok(Self {
            http,
            config,
            capabilities,
        })
    }

    fn convert_request(&self, request: &ChatRequest, stream: bool) -> OllamaRequest {
        OllamaRequest {
            model: self.config.map_model(&request.model),
            messages: request
                .messages
                .iter()
                .map(|m| OllamaMessage {
                    role: match m.role {
                        Role::System => "system",
                        Role::User => "user",
                        Role::Assistant => "assistant",
                    }
                    .to_string(),
                    content: m.content.clone(),
                })
                .collect(),
            stream,
            options: Some(OllamaOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
                stop: request.stop.clone(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for OllamaAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let wire = self.convert_request(&request, false);
        let response: OllamaResponse = self.http.post_json("/api/chat", &wire).await?;

        let prompt_tokens = response.prompt_eval_count.unwrap_or(0);
        let completion_tokens = response.eval_count.unwrap_or(0);
        Ok(ChatResponse {
            id: format!("ollama-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: response.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(response.message.content),
                finish_reason: Some("stop".to_string()),
            }],
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        })
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let wire = self.convert_request(&request, true);
        let response = self.http.post_json_raw("/api/chat", &wire).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        let stream = Box::pin(stream! {
            let mut bytes_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = futures::StreamExt::next(&mut bytes_stream).await {
                match chunk_result {
                    Ok(chunk) => {
                        buffer.push_str(&String::from_utf8_lossy(&chunk));

                        while let Some(line_end) = buffer.find('\n') {
                            let line = buffer[..line_end].trim().to_string();
                            buffer = buffer[line_end + 1..].to_string();
                            if line.is_empty() {
                                continue;
                            }
                            match serde_json::from_str::<OllamaResponse>(&line) {
                                Ok(parsed) => {
                                    let done = parsed.done;
                                    yield Ok(StreamChunk {
                                        id: "ollama-stream".to_string(),
                                        object: "chat.completion.chunk".to_string(),
                                        created: chrono::Utc::now().timestamp() as u64,
                                        model: parsed.model,
                                        choices: vec![StreamChoice {
                                            index: 0,
                                            delta: Delta {
                                                role: None,
                                                content: Some(parsed.message.content),
                                            },
                                            finish_reason: done.then(|| "stop".to_string()),
                                        }],
                                    });
                                    if done {
                                        return;
                                    }
                                }
                                Err(e) => {
                                    yield Err(ProviderError::from(e));
                                    return;
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
        });

        Ok(stream)
    }

    async fn probe(&self) -> Result<ProbeReport, ProviderError> {
        let start = Instant::now();
        let _: serde_json::Value = self.http.get_json("/api/tags").await?;
        Ok(ProbeReport {
            latency: start.elapsed(),
            detail: None,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        let text = match &request.input {
            crate::models::EmbeddingInput::String(s) => s.clone(),
            crate::models::EmbeddingInput::StringArray(v) => v.join("\n"),
        };
        let wire = serde_json::json!({
            "model": self.config.map_model(&request.model),
            "prompt": text,
        });
        let response: serde_json::Value = self.http.post_json("/api/embeddings", &wire).await?;
        let values = response
            .get("embedding")
            .and_then(|v| v.as_array())
            .ok_or(ProviderError::Transport {
                message: "embedding response missing vector".to_string(),
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect::<Vec<f32>>();

        Ok(EmbeddingResponse {
            object: "list".to_string(),
            data: vec![Embedding {
                object: "embedding".to_string(),
                embedding: values,
                index: 0,
            }],
            model: request.model,
            usage: Usage::default(),
        })
    }
}

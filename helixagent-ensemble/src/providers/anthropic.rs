use crate::error::ProviderError;
use crate::models::{
    ChatRequest, ChatResponse, Choice, Delta, Message, Role, StreamChoice, StreamChunk, Usage,
};
use crate::providers::http_client::{map_error_response, AuthStrategy, HttpProviderClient};
use crate::providers::{
    ChunkStream, ProbeReport, ProviderAdapter, ProviderCapabilities, ProviderConfig, ProviderKind,
};
use async_stream::stream;
use serde::{Deserialize, Serialize};
use std::time::Instant;

#[derive(Debug)]
pub struct AnthropicAdapter {
    http: HttpProviderClient,
    config: ProviderConfig,
    capabilities: ProviderCapabilities,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    id: String,
    content: Vec<AnthropicContent>,
    model: String,
    stop_reason: Option<String>,
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
struct AnthropicContent {
    text: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: u32,
    output_tokens: u32,
}

impl AnthropicAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Unauthenticated {
                message: format!("{}: no API key configured", config.id),
            })?;
        let mut headers = config.headers.clone();
        headers.insert("anthropic-version".to_string(), "2023-06-01".to_string());
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://api.anthropic.com",
            &headers,
            AuthStrategy::Header {
                name: "x-api-key".to_string(),
                value: api_key,
            },
        )?;
        let capabilities = config.capabilities.clone().unwrap_or(ProviderCapabilities {
            streaming: true,
            function_calling: true,
            vision: true,
            embeddings: false,
            max_context: 200_000,
            languages: vec!["en".to_string()],
        });

        Ok(Self {
            http,
            config,
            capabilities,
        })
    }

    fn map_model(&self, model: &str) -> String {
        self.config
            .model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| match model {
                "claude" | "claude-sonnet" | "ensemble" => "claude-sonnet-4-20250514".to_string(),
                "claude-opus" => "claude-opus-4-20250514".to_string(),
                "claude-haiku" => "claude-3-5-haiku-20241022".to_string(),
                _ => model.to_string(),
            })
    }

    /// Anthropic takes system text as a top-level field and alternating
    /// user/assistant turns in the message list.
    fn convert_request(&self, request: &ChatRequest, stream: bool) -> AnthropicRequest {
        let mut system = String::new();
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&msg.content);
                }
                Role::User => messages.push(AnthropicMessage {
                    role: "user".to_string(),
                    content: msg.content.clone(),
                }),
                Role::Assistant => messages.push(AnthropicMessage {
                    role: "assistant".to_string(),
                    content: msg.content.clone(),
                }),
            }
        }

        // The API rejects an empty message list
        if messages.is_empty() {
            messages.push(AnthropicMessage {
                role: "user".to_string(),
                content: if system.is_empty() {
                    "Hello".to_string()
                } else {
                    system.clone()
                },
            });
        }

        AnthropicRequest {
            model: self.map_model(&request.model),
            max_tokens: request.max_tokens.unwrap_or(4096),
            messages,
            system: (!system.is_empty()).then_some(system),
            temperature: request.temperature.map(|t| t.clamp(0.0, 1.0)),
            stop_sequences: request.stop.clone(),
            stream: stream.then_some(true),
        }
    }

    fn convert_response(&self, response: AnthropicResponse) -> ChatResponse {
        let content = response
            .content
            .into_iter()
            .map(|c| c.text)
            .collect::<Vec<_>>()
            .join("");

        ChatResponse {
            id: response.id,
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: response.model,
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason: response.stop_reason,
            }],
            usage: Some(Usage {
                prompt_tokens: response.usage.input_tokens,
                completion_tokens: response.usage.output_tokens,
                total_tokens: response.usage.input_tokens + response.usage.output_tokens,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let wire = self.convert_request(&request, false);
        let response: AnthropicResponse = self.http.post_json("/v1/messages", &wire).await?;
        Ok(self.convert_response(response))
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let wire = self.convert_request(&request, true);
        let response = self.http.post_json_raw("/v1/messages", &wire).await?;
        if !response.status().is_success() {
            return Err(map_error_response(response).await);
        }

        // Anthropic's SSE events carry text under delta.text; re-emit as
        // OpenAI-wire chunks.
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

                            let Some(json_str) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let Ok(event) = serde_json::from_str::<serde_json::Value>(json_str)
                            else {
                                continue;
                            };
                            if event.get("type").and_then(|t| t.as_str())
                                == Some("message_stop")
                            {
                                return;
                            }
                            if let Some(text) = event
                                .get("delta")
                                .and_then(|d| d.get("text"))
                                .and_then(|t| t.as_str())
                            {
                                yield Ok(StreamChunk {
                                    id: "anthropic-stream".to_string(),
                                    object: "chat.completion.chunk".to_string(),
                                    created: chrono::Utc::now().timestamp() as u64,
                                    model: event
                                        .get("model")
                                        .and_then(|m| m.as_str())
                                        .unwrap_or_default()
                                        .to_string(),
                                    choices: vec![StreamChoice {
                                        index: 0,
                                        delta: Delta {
                                            role: None,
                                            content: Some(text.to_string()),
                                        },
                                        finish_reason: None,
                                    }],
                                });
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
        // No dedicated models endpoint; a one-token haiku call is the
        // cheapest liveness signal the API offers.
        let probe_request = AnthropicRequest {
            model: "claude-3-5-haiku-20241022".to_string(),
            max_tokens: 1,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content: "Hi".to_string(),
            }],
            system: None,
            temperature: Some(0.0),
            stop_sequences: None,
            stream: None,
        };
        let _: serde_json::Value = self.http.post_json("/v1/messages", &probe_request).await?;
        Ok(ProbeReport {
            latency: start.elapsed(),
            detail: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> AnthropicAdapter {
        AnthropicAdapter::new(
            ProviderConfig::new("anthropic", ProviderKind::Anthropic).with_api_key("sk-ant-test"),
        )
        .unwrap()
    }

    #[test]
    fn system_messages_become_top_level_system() {
        let request = ChatRequest {
            model: "claude".to_string(),
            messages: vec![
                Message::system("You are terse."),
                Message::system("Answer in English."),
                Message::user("What is 2+2?"),
            ],
            ..Default::default()
        };
        let wire = adapter().convert_request(&request, false);
        assert_eq!(wire.system.as_deref(), Some("You are terse.\nAnswer in English."));
        assert_eq!(wire.messages.len(), 1);
        assert_eq!(wire.messages[0].role, "user");
    }

    #[test]
    fn temperature_clamped_to_anthropic_range() {
        let request = ChatRequest {
            model: "claude".to_string(),
            messages: vec![Message::user("hi")],
            temperature: Some(1.8),
            ..Default::default()
        };
        let wire = adapter().convert_request(&request, false);
        assert_eq!(wire.temperature, Some(1.0));
    }

    #[test]
    fn aliases_resolve_to_dated_models() {
        assert_eq!(adapter().map_model("claude"), "claude-sonnet-4-20250514");
        assert_eq!(
            adapter().map_model("claude-haiku"),
            "claude-3-5-haiku-20241022"
        );
    }

    #[test]
    fn missing_key_is_unauthenticated() {
        let err =
            AnthropicAdapter::new(ProviderConfig::new("anthropic", ProviderKind::Anthropic))
                .unwrap_err();
        assert!(matches!(err, ProviderError::Unauthenticated { .. }));
    }
}

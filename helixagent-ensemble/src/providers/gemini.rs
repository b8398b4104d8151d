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

pub struct GeminiAdapter {
    http: HttpProviderClient,
    config: ProviderConfig,
    capabilities: ProviderCapabilities,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<GeminiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GeminiGenerationConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiContent {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
    #[serde(default)]
    model_version: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiCandidate {
    content: GeminiContent,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    #[serde(default)]
    prompt_token_count: u32,
    #[serde(default)]
    candidates_token_count: u32,
    #[serde(default)]
    total_token_count: u32,
}

impl GeminiAdapter {
    pub fn new(config: ProviderConfig) -> Result<Self, ProviderError> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| ProviderError::Unauthenticated {
                message: format!("{}: no API key configured", config.id),
            })?;
        let http = HttpProviderClient::new(
            config.timeout,
            config.base_url.clone(),
            "https://generativelanguage.googleapis.com",
            &config.headers,
            AuthStrategy::Header {
                name: "x-goog-api-key".to_string(),
                value: api_key,
            },
        )?;
        let capabilities = config.capabilities.clone().unwrap_or(ProviderCapabilities {
            streaming: true,
            function_calling: true,
            vision: true,
            embeddings: true,
            max_context: 1_000_000,
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
                "gemini" | "ensemble" => "gemini-2.0-flash".to_string(),
                "gemini-pro" => "gemini-2.5-pro".to_string(),
                _ => model.to_string(),
            })
    }

    fn convert_request(&self, request: &ChatRequest) -> GeminiRequest {
        let mut system = String::new();
        let mut contents = Vec::new();

        for msg in &request.messages {
            match msg.role {
                Role::System => {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&msg.content);
                }
                // Gemini names the assistant side "model"
                Role::User | Role::Assistant => contents.push(GeminiContent {
                    role: Some(if msg.role == Role::User {
                        "user".to_string()
                    } else {
                        "model".to_string()
                    }),
                    parts: vec![GeminiPart {
                        text: msg.content.clone(),
                    }],
                }),
            }
        }

        GeminiRequest {
            contents,
            system_instruction: (!system.is_empty()).then(|| GeminiContent {
                role: None,
                parts: vec![GeminiPart { text: system }],
            }),
            generation_config: Some(GeminiGenerationConfig {
                temperature: request.temperature.map(|t| t.clamp(0.0, 2.0)),
                max_output_tokens: request.max_tokens,
                stop_sequences: request.stop.clone(),
            }),
        }
    }

    fn convert_response(&self, model: &str, response: GeminiResponse) -> ChatResponse {
        let (content, finish_reason) = response
            .candidates
            .into_iter()
            .next()
            .map(|c| {
                (
                    c.content
                        .parts
                        .into_iter()
                        .map(|p| p.text)
                        .collect::<Vec<_>>()
                        .join(""),
                    c.finish_reason,
                )
            })
            .unwrap_or_default();

        ChatResponse {
            id: format!("gemini-{}", uuid::Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: response.model_version.unwrap_or_else(|| model.to_string()),
            choices: vec![Choice {
                index: 0,
                message: Message::assistant(content),
                finish_reason,
            }],
            usage: response.usage_metadata.map(|u| Usage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ProviderAdapter for GeminiAdapter {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Gemini
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.clone()
    }

    async fn complete(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let model = self.map_model(&request.model);
        let wire = self.convert_request(&request);
        let response: GeminiResponse = self
            .http
            .post_json(&format!("/v1beta/models/{model}:generateContent"), &wire)
            .await?;
        Ok(self.convert_response(&model, response))
    }

    async fn complete_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let model = self.map_model(&request.model);
        let wire = self.convert_request(&request);
        let response = self
            .http
            .post_json_raw(
                &format!("/v1beta/models/{model}:streamGenerateContent?alt=sse"),
                &wire,
            )
            .await?;
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

                            let Some(json_str) = line.strip_prefix("data: ") else {
                                continue;
                            };
                            let Ok(event) =
                                serde_json::from_str::<GeminiResponse>(json_str)
                            else {
                                continue;
                            };
                            let Some(candidate) = event.candidates.into_iter().next() else {
                                continue;
                            };
                            let text = candidate
                                .content
                                .parts
                                .into_iter()
                                .map(|p| p.text)
                                .collect::<Vec<_>>()
                                .join("");
                            let done = candidate.finish_reason.is_some();
                            yield Ok(StreamChunk {
                                id: "gemini-stream".to_string(),
                                object: "chat.completion.chunk".to_string(),
                                created: chrono::Utc::now().timestamp() as u64,
                                model: String::new(),
                                choices: vec![StreamChoice {
                                    index: 0,
                                    delta: Delta {
                                        role: None,
                                        content: Some(text),
                                    },
                                    finish_reason: candidate.finish_reason,
                                }],
                            });
                            if done {
                                return;
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
        let _: serde_json::Value = self.http.get_json("/v1beta/models").await?;
        Ok(ProbeReport {
            latency: start.elapsed(),
            detail: None,
        })
    }

    async fn embed(&self, request: EmbeddingRequest) -> Result<EmbeddingResponse, ProviderError> {
        let model = self.map_model(&request.model);
        let text = match &request.input {
            crate::models::EmbeddingInput::String(s) => s.clone(),
            crate::models::EmbeddingInput::StringArray(v) => v.join("\n"),
        };
        let wire = serde_json::json!({
            "content": {"parts": [{"text": text}]}
        });
        let response: serde_json::Value = self
            .http
            .post_json(&format!("/v1beta/models/{model}:embedContent"), &wire)
            .await?;
        let values = response
            .get("embedding")
            .and_then(|e| e.get("values"))
            .and_then(|v| v.as_array())
            .ok_or(ProviderError::Transport {
                message: "embedding response missing values".to_string(),
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
            model,
            usage: Usage::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> GeminiAdapter {
        GeminiAdapter::new(
            ProviderConfig::new("gemini", ProviderKind::Gemini).with_api_key("test-key"),
        )
        .unwrap()
    }

    #[test]
    fn assistant_turns_map_to_model_role() {
        let request = ChatRequest {
            model: "gemini".to_string(),
            messages: vec![
                Message::user("hi"),
                Message::assistant("hello"),
                Message::user("again"),
            ],
            ..Default::default()
        };
        let wire = adapter().convert_request(&request);
        let roles: Vec<_> = wire
            .contents
            .iter()
            .map(|c| c.role.as_deref().unwrap())
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
    }

    #[test]
    fn system_text_becomes_system_instruction() {
        let request = ChatRequest {
            model: "gemini".to_string(),
            messages: vec![Message::system("be brief"), Message::user("hi")],
            ..Default::default()
        };
        let wire = adapter().convert_request(&request);
        assert!(wire.system_instruction.is_some());
        assert_eq!(wire.contents.len(), 1);
    }
}

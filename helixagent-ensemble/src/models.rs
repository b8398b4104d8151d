//! # Request and Response Types
//!
//! OpenAI-shaped data structures shared by the gateway, the debate
//! orchestrator and every provider adapter. Adapters translate these into
//! their upstream wire formats and back; the gateway serializes them
//! verbatim.
//!
//! The only extension over the OpenAI shape is [`ChatRequest::extra_params`],
//! which carries ensemble-specific knobs (debate rounds, multi-pass
//! validation, theatrical style) without breaking compatible clients.

use serde::{Deserialize, Serialize};

/// Chat completion request in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChatRequest {
    /// Model or ensemble alias to use
    pub model: String,
    /// Conversation so far
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Ensemble extensions; ignored by plain OpenAI clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra_params: Option<ExtraParams>,
}

/// Ensemble-specific request extensions.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtraParams {
    /// Number of debate rounds to run (defaults to the server config)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rounds: Option<u32>,
    /// Wrap the round loop in the four validation phases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_multi_pass_validation: Option<bool>,
    /// Per-request overrides for the validation phases
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_config: Option<serde_json::Value>,
    /// Theatrical streaming style
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    /// Memory dataset hierarchy consulted for this request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasets: Option<Vec<String>>,
}

/// Chat completion response in the OpenAI wire shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub id: String,
    /// Always "chat.completion"
    pub object: String,
    /// Unix timestamp of creation
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatResponse {
    /// Convenience accessor for the first choice's content.
    pub fn content(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.message.content.as_str())
            .unwrap_or("")
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
            name: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            name: None,
        }
    }
}

/// Role of a message sender.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A generated completion choice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: Message,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    /// Sum two usage records, saturating on overflow.
    pub fn accumulate(&mut self, other: &Usage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// One delta of a streamed completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    /// Always "chat.completion.chunk"
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamChoice>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Embedding request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: EmbeddingInput,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    String(String),
    StringArray(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    pub object: String,
    pub data: Vec<Embedding>,
    pub model: String,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub object: String,
    pub embedding: Vec<f32>,
    pub index: u32,
}

/// Rough token estimate used for budgeting and stats. One token per four
/// characters plus a fixed formatting allowance.
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as u32) / 4 + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::user("hi").role, Role::User);
        assert_eq!(Message::assistant("yo").role, Role::Assistant);
        assert_eq!(Message::system("rules").role, Role::System);
    }

    #[test]
    fn extra_params_roundtrip() {
        let body = serde_json::json!({
            "model": "ensemble",
            "messages": [{"role": "user", "content": "What is 2+2?"}],
            "extra_params": {"rounds": 1, "enable_multi_pass_validation": false}
        });
        let request: ChatRequest = serde_json::from_value(body).unwrap();
        let extra = request.extra_params.unwrap();
        assert_eq!(extra.rounds, Some(1));
        assert_eq!(extra.enable_multi_pass_validation, Some(false));
    }

    #[test]
    fn usage_accumulates_saturating() {
        let mut usage = Usage {
            prompt_tokens: u32::MAX - 1,
            completion_tokens: 1,
            total_tokens: 0,
        };
        usage.accumulate(&Usage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 7,
        });
        assert_eq!(usage.prompt_tokens, u32::MAX);
        assert_eq!(usage.completion_tokens, 3);
    }
}

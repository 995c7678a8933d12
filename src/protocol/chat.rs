use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One message of the conversation, forwarded upstream unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

/// Validated inbound chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    /// Explicit streaming preference from the body.
    pub stream: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
}

impl ChatRequest {
    /// Per-request overrides applied on top of the configured defaults.
    #[must_use]
    pub fn generation(&self, defaults: GenerationConfig) -> GenerationConfig {
        GenerationConfig {
            max_tokens: self.max_tokens.unwrap_or(defaults.max_tokens),
            temperature: self.temperature.unwrap_or(defaults.temperature),
            top_p: self.top_p.unwrap_or(defaults.top_p),
        }
    }
}

/// Chat completion request body sent to the upstream.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub model: &'a str,
    pub stream: bool,
}

impl<'a> UpstreamChatRequest<'a> {
    #[must_use]
    pub fn new(
        messages: &'a [ChatMessage],
        generation: GenerationConfig,
        model: &'a str,
        stream: bool,
    ) -> Self {
        Self {
            messages,
            max_tokens: generation.max_tokens,
            temperature: generation.temperature,
            top_p: generation.top_p,
            model,
            stream,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_wire_names() {
        let message: ChatMessage =
            serde_json::from_str(r#"{"role":"system","content":"be brief"}"#).unwrap();
        assert_eq!(message.role, ChatRole::System);
        assert!(serde_json::from_str::<ChatMessage>(r#"{"role":"tool","content":"x"}"#).is_err());
    }

    #[test]
    fn test_upstream_request_shape() {
        let messages = vec![ChatMessage {
            role: ChatRole::User,
            content: "hello".to_string(),
        }];
        let request =
            UpstreamChatRequest::new(&messages, GenerationConfig::default(), "gpt-4o", true);
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["messages"][0]["content"], "hello");
        assert_eq!(value["max_tokens"], 2048);
        assert_eq!(value["model"], "gpt-4o");
        assert_eq!(value["stream"], true);
        let top_p = value["top_p"].as_f64().unwrap();
        assert!((top_p - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_generation_overrides() {
        let request = ChatRequest {
            messages: Vec::new(),
            stream: false,
            max_tokens: Some(64),
            temperature: None,
            top_p: Some(0.5),
        };
        let generation = request.generation(GenerationConfig::default());
        assert_eq!(generation.max_tokens, 64);
        assert!((generation.temperature - 0.7).abs() < f32::EPSILON);
        assert!((generation.top_p - 0.5).abs() < f32::EPSILON);
    }
}

use serde::Deserialize;

use crate::error::GatewayError;
use crate::protocol::{ChatMessage, ChatRequest};

pub(crate) const MISSING_MESSAGES: &str = "Invalid request format. 'messages' array is required.";

#[derive(Debug, Deserialize)]
struct ChatRequestWire {
    #[serde(default)]
    messages: Option<serde_json::Value>,
    #[serde(default)]
    stream: Option<bool>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
    #[serde(default)]
    top_p: Option<f32>,
}

pub(crate) fn parse_chat_request(body: &[u8]) -> Result<ChatRequest, GatewayError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(GatewayError::InvalidRequest(MISSING_MESSAGES.to_string()));
    }
    let wire: ChatRequestWire = serde_json::from_slice(body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid chat request body: {e}")))?;

    let Some(serde_json::Value::Array(items)) = wire.messages else {
        return Err(GatewayError::InvalidRequest(MISSING_MESSAGES.to_string()));
    };
    let messages = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| {
            serde_json::from_value::<ChatMessage>(item).map_err(|e| {
                GatewayError::InvalidRequest(format!("Invalid message at index {index}: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if wire.max_tokens == Some(0) {
        return Err(GatewayError::InvalidRequest(
            "max_tokens must be greater than 0".to_string(),
        ));
    }
    if let Some(temperature) = wire.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(GatewayError::InvalidRequest(format!(
                "temperature must be within [0, 2], got {temperature}"
            )));
        }
    }
    if let Some(top_p) = wire.top_p {
        if !(top_p > 0.0 && top_p <= 1.0) {
            return Err(GatewayError::InvalidRequest(format!(
                "top_p must be within (0, 1], got {top_p}"
            )));
        }
    }

    Ok(ChatRequest {
        messages,
        stream: wire.stream.unwrap_or(false),
        max_tokens: wire.max_tokens,
        temperature: wire.temperature,
        top_p: wire.top_p,
    })
}

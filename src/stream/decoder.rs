use serde::{Deserialize, Serialize};

/// Payload that marks the logical end of an upstream event stream.
pub const DONE_SENTINEL: &str = "[DONE]";

/// Role reported when the upstream omits one.
pub const DEFAULT_ROLE: &str = "assistant";

/// Identity fields an upstream event may carry. Present values override
/// the synthesized per-request defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    pub id: Option<String>,
    pub object: Option<String>,
    pub created: Option<u64>,
    pub model: Option<String>,
}

impl Envelope {
    /// Fill fields that are still unset from `other`.
    pub fn merge_missing(&mut self, other: &Envelope) {
        if self.id.is_none() {
            self.id.clone_from(&other.id);
        }
        if self.object.is_none() {
            self.object.clone_from(&other.object);
        }
        if self.created.is_none() {
            self.created = other.created;
        }
        if self.model.is_none() {
            self.model.clone_from(&other.model);
        }
    }
}

/// One unit of model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedDelta {
    pub text: String,
    pub role: String,
    pub finish_reason: Option<String>,
}

/// Which upstream shape an event was decoded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    /// `choices[0].delta` (incremental streaming event)
    Delta,
    /// `choices[0].message` (full message)
    Message,
    /// Neither: an envelope with no usable choice (e.g. `choices: []`).
    Bare,
}

/// Token usage as reported by the upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
}

/// A successfully decoded upstream event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEvent {
    pub envelope: Envelope,
    pub delta: NormalizedDelta,
    pub shape: PayloadShape,
    pub usage: Option<Usage>,
}

/// Why a line produced no event. None of these abort the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Skip {
    /// The completion sentinel.
    Done,
    /// Blank lines, SSE comments, and non-`data` SSE fields.
    Ignored,
    /// The payload is not a JSON object.
    Malformed(String),
    /// The upstream reported an error inside the stream.
    UpstreamError(String),
}

// ---------------------------------------------------------------------------
// Wire shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireEvent {
    #[serde(default)]
    id: Option<WireId>,
    #[serde(default)]
    object: Option<serde_json::Value>,
    #[serde(default)]
    created: Option<WireTimestamp>,
    #[serde(default)]
    model: Option<serde_json::Value>,
    #[serde(default)]
    choices: Option<Vec<WireChoice>>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Text(String),
    Number(u64),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Integer(u64),
    Float(f64),
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    #[serde(default)]
    delta: Option<WireMessage>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<WireContent>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireContent {
    Text(String),
    Parts(Vec<WireContentPart>),
}

#[derive(Debug, Deserialize)]
struct WireContentPart {
    #[serde(default, rename = "type")]
    part_type: Option<String>,
    #[serde(default)]
    text: Option<String>,
}

impl WireContent {
    fn into_text(self) -> String {
        match self {
            WireContent::Text(text) => text,
            WireContent::Parts(parts) => {
                let mut out = String::new();
                for part in parts {
                    if part.part_type.as_deref().is_some_and(|kind| kind != "text") {
                        continue;
                    }
                    if let Some(text) = part.text {
                        out.push_str(&text);
                    }
                }
                out
            }
        }
    }
}

impl WireMessage {
    fn take_content(&mut self) -> Option<String> {
        self.content
            .take()
            .map(WireContent::into_text)
            .filter(|text| !text.is_empty())
    }

    fn take_role(&mut self) -> Option<String> {
        self.role.take().filter(|role| !role.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode one logical upstream line.
///
/// Accepts both labeled (`data: {...}`) and bare (`{...}`) payloads.
///
/// # Errors
///
/// Returns a [`Skip`] describing why the line yields no event. Callers log
/// it and continue with the next line.
pub fn decode_line(line: &str) -> Result<ParsedEvent, Skip> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Err(Skip::Ignored);
    }

    let payload = if let Some(rest) = line.strip_prefix("data:") {
        rest.trim()
    } else if is_non_data_sse_field(line) {
        return Err(Skip::Ignored);
    } else {
        line
    };

    if payload == DONE_SENTINEL {
        return Err(Skip::Done);
    }
    decode_payload(payload.as_bytes())
}

/// Decode a JSON payload (a line body or a whole buffered reply).
///
/// # Errors
///
/// See [`decode_line`].
pub fn decode_payload(payload: &[u8]) -> Result<ParsedEvent, Skip> {
    let Some(first) = payload.iter().find(|b| !b.is_ascii_whitespace()) else {
        return Err(Skip::Ignored);
    };
    if *first != b'{' {
        return Err(Skip::Malformed(format!(
            "expected a JSON object, found {:?}",
            char::from(*first)
        )));
    }

    let wire: WireEvent = serde_json::from_slice(payload)
        .map_err(|err| Skip::Malformed(format!("invalid JSON payload: {err}")))?;

    if wire.choices.as_ref().map_or(true, Vec::is_empty) {
        if let Some(error) = wire.error {
            return Err(Skip::UpstreamError(upstream_error_message(&error)));
        }
    }

    Ok(into_parsed_event(wire))
}

/// Identity fields of another type are treated as absent.
fn non_empty_text(value: Option<serde_json::Value>) -> Option<String> {
    match value {
        Some(serde_json::Value::String(text)) if !text.is_empty() => Some(text),
        _ => None,
    }
}

fn into_parsed_event(wire: WireEvent) -> ParsedEvent {
    let envelope = Envelope {
        id: wire.id.map(|id| match id {
            WireId::Text(text) => text,
            WireId::Number(number) => number.to_string(),
        }),
        object: non_empty_text(wire.object),
        created: wire.created.and_then(|created| match created {
            WireTimestamp::Integer(secs) => Some(secs),
            WireTimestamp::Float(secs) if secs.is_finite() && secs >= 0.0 => Some(secs as u64),
            WireTimestamp::Float(_) => None,
        }),
        model: non_empty_text(wire.model),
    };

    let Some(choice) = wire.choices.and_then(|choices| choices.into_iter().next()) else {
        return ParsedEvent {
            envelope,
            delta: NormalizedDelta {
                text: String::new(),
                role: DEFAULT_ROLE.to_string(),
                finish_reason: None,
            },
            shape: PayloadShape::Bare,
            usage: wire.usage,
        };
    };

    let shape = if choice.delta.is_some() {
        PayloadShape::Delta
    } else if choice.message.is_some() {
        PayloadShape::Message
    } else {
        PayloadShape::Bare
    };

    let mut delta = choice.delta.unwrap_or_default();
    let mut message = choice.message.unwrap_or_default();
    let text = delta
        .take_content()
        .or_else(|| message.take_content())
        .unwrap_or_default();
    let role = delta
        .take_role()
        .or_else(|| message.take_role())
        .unwrap_or_else(|| DEFAULT_ROLE.to_string());

    ParsedEvent {
        envelope,
        delta: NormalizedDelta {
            text,
            role,
            finish_reason: choice.finish_reason,
        },
        shape,
        usage: wire.usage,
    }
}

fn upstream_error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(message) => message.clone(),
        serde_json::Value::Object(map) => map
            .get("message")
            .and_then(serde_json::Value::as_str)
            .map_or_else(|| error.to_string(), str::to_owned),
        other => other.to_string(),
    }
}

#[inline]
fn is_non_data_sse_field(line: &str) -> bool {
    line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:")
}

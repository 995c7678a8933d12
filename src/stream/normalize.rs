//! Client-facing response shapes and the per-request state that produces them.
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::decoder::{
    decode_line, decode_payload, Envelope, NormalizedDelta, ParsedEvent, PayloadShape, Skip,
    Usage, DEFAULT_ROLE,
};
use super::sanitize::{sanitize, ReasoningTags};
use super::splitter::{FrameError, FrameSplitter};
use crate::util::{format_response_id, unix_now_millis};

pub const CHUNK_OBJECT: &str = "chat.completion.chunk";
pub const COMPLETION_OBJECT: &str = "chat.completion";
pub const RESPONSE_ID_PREFIX: &str = "chatcmpl-";
pub const EMPTY_RESPONSE_MESSAGE: &str =
    "I'm sorry, I couldn't generate a response. Please try again.";
pub const ERROR_RESPONSE_MESSAGE: &str =
    "I'm sorry, an error occurred while generating the response. Please try again.";
pub const ERROR_FINISH_REASON: &str = "error";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// One streamed unit sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: [ChunkChoice; 1],
}

impl NormalizedChunk {
    #[must_use]
    pub fn content(&self) -> &str {
        &self.choices[0].delta.content
    }

    #[must_use]
    pub fn finish_reason(&self) -> Option<&str> {
        self.choices[0].finish_reason.as_deref()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: Option<String>,
}

/// The single object returned in buffered mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: [CompletionChoice; 1],
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl NormalizedCompletion {
    #[must_use]
    pub fn content(&self) -> &str {
        &self.choices[0].message.content
    }
}

/// Per-request identity used whenever the upstream omits a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseIdentity {
    pub id: String,
    pub created: u64,
    pub model: String,
}

impl ResponseIdentity {
    #[must_use]
    pub fn synthesize(request_seq: u64, model: &str) -> Self {
        Self::at(unix_now_millis(), request_seq, model)
    }

    #[must_use]
    pub fn at(now_millis: u64, request_seq: u64, model: &str) -> Self {
        Self {
            id: format_response_id(RESPONSE_ID_PREFIX, now_millis, request_seq),
            created: now_millis / 1000,
            model: model.to_string(),
        }
    }

    fn resolve(&self, envelope: &Envelope, default_object: &str) -> (String, String, u64, String) {
        (
            envelope.id.clone().unwrap_or_else(|| self.id.clone()),
            envelope
                .object
                .clone()
                .unwrap_or_else(|| default_object.to_string()),
            envelope.created.unwrap_or(self.created),
            envelope.model.clone().unwrap_or_else(|| self.model.clone()),
        )
    }
}

/// Lifecycle of one streamed response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Opening,
    Streaming,
    Completed,
    FallbackEmpty,
    FallbackError,
    Closed,
}

impl StreamPhase {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StreamPhase::Completed
                | StreamPhase::FallbackEmpty
                | StreamPhase::FallbackError
                | StreamPhase::Closed
        )
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            StreamPhase::Opening => "opening",
            StreamPhase::Streaming => "streaming",
            StreamPhase::Completed => "completed",
            StreamPhase::FallbackEmpty => "fallback_empty",
            StreamPhase::FallbackError => "fallback_error",
            StreamPhase::Closed => "closed",
        }
    }
}

/// Turns decoded events into client chunks and owns the fallback policy.
///
/// Once a terminal phase is reached no further chunk is produced.
#[derive(Debug)]
pub struct StreamNormalizer {
    identity: ResponseIdentity,
    phase: StreamPhase,
    emitted: usize,
    /// Upstream identity fields seen so far, reused by fallback chunks.
    seen: Envelope,
    /// Phase reached before `close`, for logging.
    outcome: StreamPhase,
}

impl StreamNormalizer {
    #[must_use]
    pub fn new(identity: ResponseIdentity) -> Self {
        Self {
            identity,
            phase: StreamPhase::Opening,
            emitted: 0,
            seen: Envelope::default(),
            outcome: StreamPhase::Opening,
        }
    }

    /// Build the chunk for one decoded event.
    pub fn chunk(&mut self, envelope: &Envelope, delta: NormalizedDelta) -> Option<NormalizedChunk> {
        if self.phase.is_terminal() {
            return None;
        }
        self.set_phase(StreamPhase::Streaming);
        self.emitted += 1;
        self.observe(envelope);
        // Events that omit identity fields keep the ones seen earlier.
        let mut merged = envelope.clone();
        merged.merge_missing(&self.seen);
        Some(self.build(&merged, delta))
    }

    /// Record upstream identity fields from an event that produced no chunk.
    pub fn observe(&mut self, envelope: &Envelope) {
        self.seen.merge_missing(envelope);
    }

    /// Chunk for text released by the reasoning filter at end of stream.
    /// Nothing is produced for empty residue.
    pub fn residue(&mut self, envelope: &Envelope, role: &str, text: String) -> Option<NormalizedChunk> {
        if text.is_empty() {
            return None;
        }
        self.chunk(
            envelope,
            NormalizedDelta {
                text,
                role: role.to_string(),
                finish_reason: None,
            },
        )
    }

    /// Upstream ended normally. Returns the apology chunk when nothing was emitted.
    pub fn finish(&mut self) -> Option<NormalizedChunk> {
        if self.phase.is_terminal() {
            return None;
        }
        if self.emitted == 0 {
            self.set_phase(StreamPhase::FallbackEmpty);
            return Some(self.build(
                &self.seen,
                NormalizedDelta {
                    text: EMPTY_RESPONSE_MESSAGE.to_string(),
                    role: DEFAULT_ROLE.to_string(),
                    finish_reason: None,
                },
            ));
        }
        self.set_phase(StreamPhase::Completed);
        None
    }

    /// Unrecoverable mid-stream failure. Returns the terminal error chunk.
    pub fn fail(&mut self) -> Option<NormalizedChunk> {
        if self.phase.is_terminal() {
            return None;
        }
        self.set_phase(StreamPhase::FallbackError);
        Some(self.build(
            &self.seen,
            NormalizedDelta {
                text: ERROR_RESPONSE_MESSAGE.to_string(),
                role: DEFAULT_ROLE.to_string(),
                finish_reason: Some(ERROR_FINISH_REASON.to_string()),
            },
        ))
    }

    /// Move to `Closed`. Returns `true` only on the first call.
    pub fn close(&mut self) -> bool {
        if self.phase == StreamPhase::Closed {
            return false;
        }
        self.outcome = self.phase;
        self.phase = StreamPhase::Closed;
        true
    }

    #[must_use]
    pub fn phase(&self) -> StreamPhase {
        self.phase
    }

    /// The phase the stream was in when it was closed.
    #[must_use]
    pub fn outcome(&self) -> StreamPhase {
        if self.phase == StreamPhase::Closed {
            self.outcome
        } else {
            self.phase
        }
    }

    #[must_use]
    pub fn emitted(&self) -> usize {
        self.emitted
    }

    #[must_use]
    pub fn identity(&self) -> &ResponseIdentity {
        &self.identity
    }

    fn set_phase(&mut self, phase: StreamPhase) {
        self.phase = phase;
    }

    fn build(&self, envelope: &Envelope, delta: NormalizedDelta) -> NormalizedChunk {
        let (id, object, created, model) = self.identity.resolve(envelope, CHUNK_OBJECT);
        NormalizedChunk {
            id,
            object,
            created,
            model,
            choices: [ChunkChoice {
                index: 0,
                delta: ChunkDelta {
                    role: delta.role,
                    content: delta.text,
                },
                finish_reason: delta.finish_reason,
            }],
        }
    }
}

/// Result of normalizing a buffered upstream reply.
#[derive(Debug, Clone, PartialEq)]
pub enum BufferedOutcome {
    Completion(NormalizedCompletion),
    /// The body matched no known shape and is returned unchanged.
    Passthrough(Bytes),
}

/// Normalize a complete JSON upstream reply.
#[must_use]
pub fn normalize_buffered(
    body: Bytes,
    identity: &ResponseIdentity,
    tags: &ReasoningTags,
) -> BufferedOutcome {
    match decode_payload(&body) {
        Ok(event) if event.shape != PayloadShape::Bare => {
            BufferedOutcome::Completion(build_completion(identity, tags, event))
        }
        Ok(_) => {
            tracing::debug!("upstream body has no choices; passing through");
            BufferedOutcome::Passthrough(body)
        }
        Err(skip) => {
            tracing::debug!(reason = ?skip, "upstream body is not a completion; passing through");
            BufferedOutcome::Passthrough(body)
        }
    }
}

fn build_completion(
    identity: &ResponseIdentity,
    tags: &ReasoningTags,
    event: ParsedEvent,
) -> NormalizedCompletion {
    let content = sanitize(&event.delta.text, tags).into_owned();
    completion_from_parts(
        identity,
        &event.envelope,
        event.delta.role,
        content,
        event.delta.finish_reason,
        event.usage,
    )
}

fn completion_from_parts(
    identity: &ResponseIdentity,
    envelope: &Envelope,
    role: String,
    content: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
) -> NormalizedCompletion {
    let (id, _, created, model) = identity.resolve(envelope, COMPLETION_OBJECT);
    NormalizedCompletion {
        id,
        object: COMPLETION_OBJECT.to_string(),
        created,
        model,
        choices: [CompletionChoice {
            index: 0,
            message: CompletionMessage { role, content },
            finish_reason,
        }],
        usage,
    }
}

/// Folds an upstream event stream into one completion, for callers that
/// asked for a buffered reply but received an event stream.
#[derive(Debug)]
pub struct CompletionAccumulator {
    splitter: FrameSplitter,
    tags: ReasoningTags,
    envelope: Envelope,
    role: Option<String>,
    text: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    events: usize,
    skipped: usize,
    done: bool,
}

impl CompletionAccumulator {
    #[must_use]
    pub fn new(tags: ReasoningTags, max_line_bytes: usize) -> Self {
        Self {
            splitter: FrameSplitter::with_max_line_bytes(max_line_bytes),
            tags,
            envelope: Envelope::default(),
            role: None,
            text: String::new(),
            finish_reason: None,
            usage: None,
            events: 0,
            skipped: 0,
            done: false,
        }
    }

    /// Feed raw body bytes. Returns `true` once the completion sentinel was seen;
    /// later input is ignored.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the body cannot be split into lines.
    pub fn push(&mut self, raw: &[u8]) -> Result<bool, FrameError> {
        if self.done {
            return Ok(true);
        }
        let lines = self.splitter.feed(raw)?;
        for line in &lines {
            self.take_line(line);
            if self.done {
                break;
            }
        }
        Ok(self.done)
    }

    /// Produce the completion for everything accumulated so far.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError`] when the body ended inside a UTF-8 sequence.
    pub fn finish(&mut self, identity: &ResponseIdentity) -> Result<NormalizedCompletion, FrameError> {
        if !self.done {
            if let Some(tail) = self.splitter.finish()? {
                self.take_line(&tail);
            }
        }

        let (content, finish_reason) = if self.events == 0 {
            (EMPTY_RESPONSE_MESSAGE.to_string(), None)
        } else {
            (
                sanitize(&self.text, &self.tags).into_owned(),
                self.finish_reason.take(),
            )
        };
        Ok(completion_from_parts(
            identity,
            &self.envelope,
            self.role.take().unwrap_or_else(|| DEFAULT_ROLE.to_string()),
            content,
            finish_reason,
            self.usage,
        ))
    }

    #[must_use]
    pub fn events(&self) -> usize {
        self.events
    }

    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn take_line(&mut self, line: &str) {
        match decode_line(line) {
            Ok(event) => {
                self.envelope.merge_missing(&event.envelope);
                if event.usage.is_some() {
                    self.usage = event.usage;
                }
                if event.shape == PayloadShape::Bare && event.delta.text.is_empty() {
                    return;
                }
                self.events += 1;
                if self.role.is_none() {
                    self.role = Some(event.delta.role);
                }
                self.text.push_str(&event.delta.text);
                if event.delta.finish_reason.is_some() {
                    self.finish_reason = event.delta.finish_reason;
                }
            }
            Err(Skip::Done) => self.done = true,
            Err(Skip::Ignored) => {}
            Err(Skip::Malformed(reason)) => {
                self.skipped += 1;
                tracing::debug!(%reason, "skipping malformed upstream line");
            }
            Err(Skip::UpstreamError(message)) => {
                self.skipped += 1;
                tracing::warn!(%message, "upstream reported an error inside the stream");
            }
        }
    }
}

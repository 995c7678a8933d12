use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};

pub(crate) mod buffered;
pub(crate) mod parse;
pub(crate) mod streaming;

use self::buffered::{buffered_reply, BufferedContext, BufferedReply};
use self::parse::parse_chat_request;
use self::streaming::{stream_response, StreamFraming};
use crate::observability::log_request_complete;
use crate::observability::token_counter::{estimate_messages_tokens, estimate_tokens, merge_usage};
use crate::protocol::{ChatRequest, UpstreamChatRequest};
use crate::state::AppState;
use crate::stream::{ResponseIdentity, StreamContext};

/// How the reply is delivered; fixed once per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseMode {
    Streaming(StreamFraming),
    Buffered,
}

impl ResponseMode {
    /// Streaming when the client accepts `text/event-stream` or sets `stream: true`.
    pub(crate) fn select(headers: &HeaderMap, request: &ChatRequest) -> Self {
        let accepts_event_stream = headers
            .get_all(http::header::ACCEPT)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .any(|value| value.contains("text/event-stream"));
        if accepts_event_stream {
            ResponseMode::Streaming(StreamFraming::EventStream)
        } else if request.stream {
            ResponseMode::Streaming(StreamFraming::Ndjson)
        } else {
            ResponseMode::Buffered
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            ResponseMode::Streaming(_) => "streaming",
            ResponseMode::Buffered => "buffered",
        }
    }
}

/// `POST /chat`: forward the conversation upstream and normalize the reply.
pub async fn handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> Response {
    let start_time = Instant::now();
    let request_seq = state.next_request_seq();
    let request_id: Arc<str> = Arc::from(state.request_uuid(request_seq).to_string());

    let request = match parse_chat_request(&body) {
        Ok(request) => request,
        Err(err) => {
            tracing::warn!(request_id = %request_id, error = %err, "rejected chat request");
            return err.into_response();
        }
    };

    let mode = ResponseMode::select(&headers, &request);
    tracing::info!(
        request_id = %request_id,
        messages = request.messages.len(),
        mode = mode.as_str(),
        "received chat request"
    );

    let config = &state.config;
    let model = config.upstream.model.as_str();
    let generation = request.generation(config.generation);
    let upstream_request = UpstreamChatRequest::new(
        &request.messages,
        generation,
        model,
        matches!(mode, ResponseMode::Streaming(_)),
    );

    let upstream = match state.upstream.send(&upstream_request).await {
        Ok(upstream) => upstream,
        Err(err) => {
            tracing::error!(request_id = %request_id, error = %err, "upstream call failed");
            return err.into_response();
        }
    };

    let identity = ResponseIdentity::synthesize(request_seq, model);
    let prompt_tokens_estimate =
        estimate_messages_tokens(request.messages.iter().map(|m| m.content.as_str()));

    match mode {
        ResponseMode::Streaming(framing) => {
            let ctx = StreamContext {
                identity,
                tags: state.reasoning_tags().clone(),
                sanitize: config.features.sanitize_stream,
                max_line_bytes: config.features.max_line_bytes,
                request_id,
                prompt_tokens_estimate,
            };
            stream_response(upstream, ctx, framing)
        }
        ResponseMode::Buffered => {
            let ctx = BufferedContext {
                identity: &identity,
                tags: state.reasoning_tags(),
                max_line_bytes: config.features.max_line_bytes,
            };
            match buffered_reply(upstream, &ctx).await {
                Ok((response, reply)) => {
                    let (upstream_usage, completion_tokens) = match &reply {
                        BufferedReply::Completion(completion) => {
                            (completion.usage, estimate_tokens(completion.content()))
                        }
                        BufferedReply::Passthrough => (None, 0),
                    };
                    let usage = merge_usage(
                        upstream_usage.as_ref(),
                        prompt_tokens_estimate,
                        completion_tokens,
                    );
                    log_request_complete(&request_id, model, &usage, start_time);
                    response
                }
                Err(err) => {
                    tracing::error!(
                        request_id = %request_id,
                        error = %err,
                        "failed to read upstream reply"
                    );
                    err.into_response()
                }
            }
        }
    }
}

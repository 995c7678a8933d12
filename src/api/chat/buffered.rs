use axum::body::Body;
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures_util::StreamExt;

use crate::error::GatewayError;
use crate::stream::{
    normalize_buffered, BufferedOutcome, CompletionAccumulator, NormalizedCompletion,
    ReasoningTags, ResponseIdentity,
};

/// Inputs for turning one upstream reply into a single client response.
pub(crate) struct BufferedContext<'a> {
    pub identity: &'a ResponseIdentity,
    pub tags: &'a ReasoningTags,
    pub max_line_bytes: usize,
}

/// What was sent to the client, for the completion log line.
pub(crate) enum BufferedReply {
    Completion(NormalizedCompletion),
    Passthrough,
}

pub(crate) async fn buffered_reply(
    upstream: reqwest::Response,
    ctx: &BufferedContext<'_>,
) -> Result<(Response, BufferedReply), GatewayError> {
    let content_type = upstream.headers().get(http::header::CONTENT_TYPE).cloned();
    let declared_event_stream = content_type
        .as_ref()
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.contains("text/event-stream"));

    if declared_event_stream {
        let completion = accumulate_stream(upstream.bytes_stream(), ctx).await?;
        return Ok(completion_reply(completion));
    }

    let body = upstream
        .bytes()
        .await
        .map_err(|e| GatewayError::Transport(format!("Failed to read upstream body: {e}")))?;

    if looks_like_event_stream(&body) {
        let completion = accumulate_stream(
            futures_util::stream::iter([Ok::<Bytes, GatewayError>(body)]),
            ctx,
        )
        .await?;
        return Ok(completion_reply(completion));
    }

    match normalize_buffered(body, ctx.identity, ctx.tags) {
        BufferedOutcome::Completion(completion) => Ok(completion_reply(completion)),
        BufferedOutcome::Passthrough(raw) => {
            let mut response = Response::new(Body::from(raw));
            response.headers_mut().insert(
                http::header::CONTENT_TYPE,
                content_type
                    .unwrap_or_else(|| http::HeaderValue::from_static("application/json")),
            );
            Ok((response, BufferedReply::Passthrough))
        }
    }
}

fn completion_reply(completion: NormalizedCompletion) -> (Response, BufferedReply) {
    let response = Json(&completion).into_response();
    (response, BufferedReply::Completion(completion))
}

async fn accumulate_stream<S, E>(
    stream: S,
    ctx: &BufferedContext<'_>,
) -> Result<NormalizedCompletion, GatewayError>
where
    S: futures_util::Stream<Item = Result<Bytes, E>>,
    E: std::fmt::Display,
{
    let mut accumulator = CompletionAccumulator::new(ctx.tags.clone(), ctx.max_line_bytes);
    let mut stream = std::pin::pin!(stream);
    while let Some(chunk) = stream.next().await {
        let chunk =
            chunk.map_err(|e| GatewayError::Transport(format!("Failed to read upstream body: {e}")))?;
        let done = accumulator
            .push(&chunk)
            .map_err(|e| GatewayError::Transport(e.to_string()))?;
        if done {
            break;
        }
    }
    if accumulator.skipped() > 0 {
        tracing::debug!(
            skipped = accumulator.skipped(),
            events = accumulator.events(),
            "skipped upstream lines while buffering"
        );
    }
    accumulator
        .finish(ctx.identity)
        .map_err(|e| GatewayError::Transport(e.to_string()))
}

/// Whether a body that was not declared as an event stream still is one.
pub(crate) fn looks_like_event_stream(body: &[u8]) -> bool {
    let start = body
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(body.len());
    let rest = &body[start..];
    rest.starts_with(b"data:") || rest.starts_with(b"event:") || rest.starts_with(b":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_looks_like_event_stream() {
        assert!(looks_like_event_stream(b"data: {}\n\n"));
        assert!(looks_like_event_stream(b"\n: keep-alive\n"));
        assert!(looks_like_event_stream(b"event: message\ndata: {}\n"));
        assert!(!looks_like_event_stream(br#"{"choices":[]}"#));
        assert!(!looks_like_event_stream(b""));
    }

    #[tokio::test]
    async fn test_accumulate_stream_across_chunks() {
        let identity = ResponseIdentity::at(1_000, 1, "gpt-4o");
        let tags = ReasoningTags::default();
        let ctx = BufferedContext {
            identity: &identity,
            tags: &tags,
            max_line_bytes: 1024 * 1024,
        };
        let chunks = vec![
            Ok::<Bytes, std::io::Error>(Bytes::from_static(
                b"data: {\"choices\":[{\"delta\":{\"content\":\"<think>x</th",
            )),
            Ok(Bytes::from_static(
                b"ink>Answer\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n",
            )),
        ];
        let completion = accumulate_stream(futures_util::stream::iter(chunks), &ctx)
            .await
            .unwrap();
        assert_eq!(completion.content(), "Answer");
        assert_eq!(completion.choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn test_accumulate_stream_read_error_is_transport() {
        let identity = ResponseIdentity::at(1_000, 1, "gpt-4o");
        let tags = ReasoningTags::default();
        let ctx = BufferedContext {
            identity: &identity,
            tags: &tags,
            max_line_bytes: 1024 * 1024,
        };
        let chunks = vec![Err::<Bytes, std::io::Error>(std::io::Error::other("reset"))];
        let err = accumulate_stream(futures_util::stream::iter(chunks), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Transport(_)));
    }
}

use std::convert::Infallible;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use futures_util::StreamExt;

use crate::stream::{normalized_chunk_stream, NormalizedChunk, StreamContext};

/// Content type announced for a streamed reply. The body is newline-delimited
/// chunk objects either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamFraming {
    /// The client asked for `text/event-stream`.
    EventStream,
    Ndjson,
}

impl StreamFraming {
    fn content_type(self) -> http::HeaderValue {
        match self {
            StreamFraming::EventStream => http::HeaderValue::from_static("text/event-stream"),
            StreamFraming::Ndjson => http::HeaderValue::from_static("application/x-ndjson"),
        }
    }
}

pub(crate) fn stream_response(
    upstream: reqwest::Response,
    ctx: StreamContext,
    framing: StreamFraming,
) -> Response {
    let chunks = normalized_chunk_stream(upstream.bytes_stream(), ctx);
    let body = Body::from_stream(chunks.map(|chunk| Ok::<Bytes, Infallible>(encode_chunk_line(&chunk))));
    stream_ok_response(body, framing.content_type())
}

pub(crate) fn encode_chunk_line(chunk: &NormalizedChunk) -> Bytes {
    let mut line = match serde_json::to_vec(chunk) {
        Ok(line) => line,
        Err(err) => {
            tracing::error!(error = %err, "failed to encode stream chunk");
            return Bytes::new();
        }
    };
    line.push(b'\n');
    Bytes::from(line)
}

#[inline]
fn stream_ok_response(body: Body, content_type: http::HeaderValue) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = http::StatusCode::OK;
    let headers = response.headers_mut();
    headers.insert(http::header::CONTENT_TYPE, content_type);
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    response
}

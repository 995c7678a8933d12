//! Local stand-in for the inference backend, for manual runs of the relay.
//!
//! `UPSTREAM_PORT` picks the port and `MOCK_SCENARIO` picks the reply shape.
//! The reply is an event stream when the request body asks for `"stream":true`.
use std::convert::Infallible;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use http::{header, HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use tokio::net::TcpListener;

const DEFAULT_UPSTREAM_PORT: u16 = 19_001;

#[derive(Copy, Clone)]
enum MockScenario {
    Text,
    Reasoning,
    Empty,
    Malformed,
    Cutoff,
    Error,
}

impl MockScenario {
    fn as_str(self) -> &'static str {
        match self {
            MockScenario::Text => "text",
            MockScenario::Reasoning => "reasoning",
            MockScenario::Empty => "empty",
            MockScenario::Malformed => "malformed",
            MockScenario::Cutoff => "cutoff",
            MockScenario::Error => "error",
        }
    }
}

struct MockState {
    scenario: MockScenario,
    requests: AtomicU64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let port = env_u16("UPSTREAM_PORT", DEFAULT_UPSTREAM_PORT);
    let state = Arc::new(MockState {
        scenario: parse_scenario(),
        requests: AtomicU64::new(0),
    });

    let listener = TcpListener::bind(("127.0.0.1", port))
        .await
        .unwrap_or_else(|err| panic!("failed to bind mock upstream on 127.0.0.1:{port}: {err}"));
    eprintln!(
        "mock upstream on http://127.0.0.1:{port}/v1 scenario={}",
        state.scenario.as_str()
    );

    let conn_builder = AutoBuilder::new(TokioExecutor::new());
    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok((stream, remote_addr)) => (stream, remote_addr),
            Err(err) => {
                eprintln!("accept error: {err}");
                continue;
            }
        };
        let io = TokioIo::new(stream);
        let conn_builder = conn_builder.clone();
        let service_state = Arc::clone(&state);
        let service = service_fn(move |request: Request<Incoming>| {
            let state_ref = Arc::clone(&service_state);
            async move { Ok::<_, Infallible>(handle_request(request, &state_ref).await) }
        });

        tokio::spawn(async move {
            if let Err(err) = conn_builder.serve_connection(io, service).await {
                eprintln!("mock upstream connection error from {remote_addr}: {err}");
            }
        });
    }
}

fn env_u16(name: &str, default: u16) -> u16 {
    env::var(name)
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(default)
}

fn parse_scenario() -> MockScenario {
    match env::var("MOCK_SCENARIO").as_deref() {
        Ok("reasoning") => MockScenario::Reasoning,
        Ok("empty") => MockScenario::Empty,
        Ok("malformed") => MockScenario::Malformed,
        Ok("cutoff") => MockScenario::Cutoff,
        Ok("error") => MockScenario::Error,
        Ok("text") | Err(_) => MockScenario::Text,
        Ok(other) => {
            eprintln!("unknown MOCK_SCENARIO '{other}', fallback to text");
            MockScenario::Text
        }
    }
}

async fn handle_request(request: Request<Incoming>, state: &MockState) -> Response<Full<Bytes>> {
    let (parts, body) = request.into_parts();
    let body = collect_body(body).await;

    let method = parts.method;
    let path = parts.uri.path();

    if method == Method::GET && path == "/_mock/stats" {
        let served = state.requests.load(Ordering::Relaxed);
        let body = format!(
            "{{\"scenario\":\"{}\",\"requests\":{served}}}",
            state.scenario.as_str()
        );
        return simple_response(StatusCode::OK, "application/json", Bytes::from(body));
    }
    if method != Method::POST {
        return simple_response_static(
            StatusCode::METHOD_NOT_ALLOWED,
            "application/json",
            br#"{"error":"method_not_allowed"}"#,
        );
    }
    if !path.ends_with("/chat/completions") {
        return simple_response_static(
            StatusCode::NOT_FOUND,
            "application/json",
            br#"{"error":"not_found"}"#,
        );
    }

    state.requests.fetch_add(1, Ordering::Relaxed);
    if matches!(state.scenario, MockScenario::Error) {
        return simple_response_static(
            StatusCode::SERVICE_UNAVAILABLE,
            "application/json",
            br#"{"error":{"message":"mock_injected_error"}}"#,
        );
    }

    if wants_stream(&body) {
        streaming_response(state.scenario)
    } else {
        non_streaming_response(state.scenario)
    }
}

async fn collect_body(body: Incoming) -> Bytes {
    match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => Bytes::new(),
    }
}

fn wants_stream(body: &[u8]) -> bool {
    const NEEDLES: [&[u8]; 2] = [b"\"stream\":true", b"\"stream\": true"];
    NEEDLES
        .iter()
        .any(|needle| body.windows(needle.len()).any(|window| window == *needle))
}

fn non_streaming_response(scenario: MockScenario) -> Response<Full<Bytes>> {
    let body = match scenario {
        MockScenario::Text | MockScenario::Cutoff => CHAT_NONSTREAM_TEXT,
        MockScenario::Reasoning => CHAT_NONSTREAM_REASONING,
        MockScenario::Empty => br#"{"id":"chatcmpl-mock","object":"chat.completion","choices":[]}"#,
        MockScenario::Malformed => b"{\"choices\":[{\"message\":",
        MockScenario::Error => br#"{"error":{"message":"mock_injected_error"}}"#,
    };
    simple_response_static(StatusCode::OK, "application/json", body)
}

fn streaming_response(scenario: MockScenario) -> Response<Full<Bytes>> {
    let body = match scenario {
        MockScenario::Text => CHAT_STREAM_TEXT,
        MockScenario::Reasoning => CHAT_STREAM_REASONING,
        MockScenario::Empty => b": keep-alive\n\ndata: [DONE]\n\n",
        MockScenario::Malformed => CHAT_STREAM_MALFORMED,
        MockScenario::Cutoff => CHAT_STREAM_CUTOFF,
        MockScenario::Error => b"data: {\"error\":{\"message\":\"mock_injected_error\"}}\n\n",
    };
    let mut response = simple_response_static(StatusCode::OK, "text/event-stream", body);
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
    response
}

fn simple_response(
    status: StatusCode,
    content_type: &'static str,
    body: Bytes,
) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn simple_response_static(
    status: StatusCode,
    content_type: &'static str,
    body: &'static [u8],
) -> Response<Full<Bytes>> {
    simple_response(status, content_type, Bytes::from_static(body))
}

const CHAT_NONSTREAM_TEXT: &[u8] = br#"{"id":"chatcmpl-mock","object":"chat.completion","created":1,"model":"m1","choices":[{"index":0,"message":{"role":"assistant","content":"ok"},"finish_reason":"stop"}],"usage":{"prompt_tokens":1,"completion_tokens":1,"total_tokens":2}}"#;
const CHAT_NONSTREAM_REASONING: &[u8] = br#"{"id":"chatcmpl-mock","object":"chat.completion","created":1,"model":"m1","choices":[{"index":0,"message":{"role":"assistant","content":"<think>analysis</think>ok"},"finish_reason":"stop"}]}"#;
const CHAT_STREAM_TEXT: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"o\"},\"finish_reason\":null}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"k\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const CHAT_STREAM_REASONING: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"<thi\"},\"finish_reason\":null}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"nk>analysis</th\"},\"finish_reason\":null}]}\n\ndata: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"ink>ok\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const CHAT_STREAM_MALFORMED: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"o\"}}]}\n\ndata: {\"choices\":[{\"delta\":\n\nevent: ping\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"k\"},\"finish_reason\":\"stop\"}]}\n\ndata: [DONE]\n\n";
const CHAT_STREAM_CUTOFF: &[u8] = b"data: {\"id\":\"chatcmpl-mock\",\"object\":\"chat.completion.chunk\",\"created\":1,\"model\":\"m1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"partial \\u00e9\"},\"finish_reason\":null}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"tail";

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use futures_util::StreamExt;

use chat_relay::stream::{
    decode_line, normalize_buffered, normalized_chunk_stream, sanitize, FrameSplitter,
    ReasoningFilter, ReasoningTags, ResponseIdentity, StreamContext,
};

fn sse_body(events: usize) -> Vec<u8> {
    let mut body = String::with_capacity(events * 160);
    for idx in 0..events {
        body.push_str("data: {\"id\":\"chatcmpl-bench\",\"object\":\"chat.completion.chunk\",\"created\":1727000000,\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"");
        if idx == 1 {
            body.push_str("<think>weighing options</think>");
        }
        body.push_str("token ");
        body.push_str("\"},\"finish_reason\":null}]}\n\n");
    }
    body.push_str("data: [DONE]\n\n");
    body.into_bytes()
}

fn split_into(body: &[u8], size: usize) -> Vec<Bytes> {
    body.chunks(size).map(Bytes::copy_from_slice).collect()
}

fn bench_frame_and_decode(c: &mut Criterion) {
    let body = sse_body(256);
    let pieces = split_into(&body, 512);

    c.bench_function("split_decode_256_events_512b_reads", |b| {
        b.iter(|| {
            let mut splitter = FrameSplitter::new();
            let mut lines = Vec::new();
            let mut decoded = 0_usize;
            for piece in &pieces {
                lines.clear();
                splitter
                    .feed_into(black_box(piece), &mut lines)
                    .expect("valid body");
                decoded += lines.iter().filter(|line| decode_line(line).is_ok()).count();
            }
            black_box(decoded)
        });
    });
}

fn bench_sanitize(c: &mut Criterion) {
    let tags = ReasoningTags::default();
    let text = "<think>".to_string() + &"plan ".repeat(200) + "</think>" + &"answer ".repeat(400);
    let clean = "answer ".repeat(600);

    c.bench_function("sanitize_with_reasoning_block", |b| {
        b.iter(|| black_box(sanitize(black_box(&text), &tags).len()));
    });
    c.bench_function("sanitize_clean_text", |b| {
        b.iter(|| black_box(sanitize(black_box(&clean), &tags).len()));
    });

    let fragments: Vec<&str> = text
        .as_bytes()
        .chunks(7)
        .map(|chunk| std::str::from_utf8(chunk).expect("ascii"))
        .collect();
    c.bench_function("reasoning_filter_7b_fragments", |b| {
        b.iter(|| {
            let mut filter = ReasoningFilter::new(tags.clone());
            let mut emitted = 0_usize;
            for fragment in &fragments {
                emitted += filter.push(fragment).len();
            }
            emitted += filter.flush().len();
            black_box(emitted)
        });
    });
}

fn bench_stream_pipeline(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");
    let body = sse_body(256);
    let pieces = split_into(&body, 333);

    c.bench_function("normalized_chunk_stream_256_events", |b| {
        b.iter(|| {
            let upstream =
                futures_util::stream::iter(pieces.clone().into_iter().map(Ok::<Bytes, String>));
            let ctx = StreamContext::new(ResponseIdentity::at(1_727_000_000_000, 1, "gpt-4o"));
            let count = runtime.block_on(normalized_chunk_stream(upstream, ctx).count());
            black_box(count)
        });
    });
}

fn bench_buffered(c: &mut Criterion) {
    let tags = ReasoningTags::default();
    let identity = ResponseIdentity::at(1_727_000_000_000, 1, "gpt-4o");
    let body = Bytes::from(
        serde_json::json!({
            "id": "chatcmpl-bench",
            "object": "chat.completion",
            "created": 1_727_000_000_u64,
            "model": "gpt-4o",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": format!("<think>hmm</think>{}", "word ".repeat(500))},
                "finish_reason": "stop"
            }]
        })
        .to_string(),
    );

    c.bench_function("normalize_buffered_2k_completion", |b| {
        b.iter(|| black_box(normalize_buffered(body.clone(), &identity, &tags)));
    });
}

criterion_group!(
    benches,
    bench_frame_and_decode,
    bench_sanitize,
    bench_stream_pipeline,
    bench_buffered
);
criterion_main!(benches);

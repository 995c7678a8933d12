//! Pull-based streaming pipeline: upstream bytes in, client chunks out.
//!
//! The returned stream owns the upstream body. It is only polled when the
//! client is ready for more, and dropping it (client disconnect) drops the
//! upstream response, which cancels the upstream read.
use std::fmt::Display;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use smallvec::SmallVec;

use super::decoder::{decode_line, Envelope, ParsedEvent, PayloadShape, Skip, Usage, DEFAULT_ROLE};
use super::normalize::{NormalizedChunk, ResponseIdentity, StreamNormalizer, StreamPhase};
use super::sanitize::{ReasoningFilter, ReasoningTags};
use super::splitter::{FrameError, FrameSplitter, DEFAULT_MAX_LINE_BYTES};
use crate::observability::token_counter::merge_usage;
use crate::observability::{log_stream_complete, StreamStats};

/// Per-request settings for [`normalized_chunk_stream`].
#[derive(Debug, Clone)]
pub struct StreamContext {
    pub identity: ResponseIdentity,
    pub tags: ReasoningTags,
    /// Strip reasoning blocks from streamed deltas.
    pub sanitize: bool,
    pub max_line_bytes: usize,
    pub request_id: Arc<str>,
    /// Local prompt-size estimate, used when the upstream reports no usage.
    pub prompt_tokens_estimate: u64,
}

impl StreamContext {
    #[must_use]
    pub fn new(identity: ResponseIdentity) -> Self {
        Self {
            identity,
            tags: ReasoningTags::default(),
            sanitize: true,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            request_id: Arc::from(""),
            prompt_tokens_estimate: 0,
        }
    }
}

/// Run the splitter, decoder, sanitizer and normalizer over an upstream body.
///
/// Every exit path (sentinel, end of body, read error, framing error)
/// produces at most one terminal chunk and then ends the stream.
pub fn normalized_chunk_stream<S, E>(
    upstream: S,
    ctx: StreamContext,
) -> impl Stream<Item = NormalizedChunk> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    futures_util::stream::unfold(ChunkPipeline::new(upstream, ctx), |mut pipeline| async move {
        loop {
            if let Some(chunk) = pipeline.pending.pop_front() {
                pipeline.stats.chunks += 1;
                pipeline.stats.content_bytes += chunk.content().len() as u64;
                return Some((chunk, pipeline));
            }
            let Some(upstream) = pipeline.upstream.as_mut() else {
                pipeline.close();
                return None;
            };
            let next = upstream.as_mut().next().await;
            match next {
                Some(Ok(bytes)) => pipeline.on_bytes(&bytes),
                Some(Err(err)) => pipeline.on_read_error(&err),
                None => pipeline.on_end(),
            }
        }
    })
}

struct PendingChunks {
    chunks: SmallVec<[Option<NormalizedChunk>; 4]>,
    head: usize,
}

impl PendingChunks {
    fn new() -> Self {
        Self {
            chunks: SmallVec::new(),
            head: 0,
        }
    }

    #[inline]
    fn push(&mut self, chunk: NormalizedChunk) {
        self.chunks.push(Some(chunk));
    }

    #[inline]
    fn pop_front(&mut self) -> Option<NormalizedChunk> {
        if self.head >= self.chunks.len() {
            return None;
        }
        let chunk = self.chunks[self.head].take();
        self.head += 1;
        if self.head == self.chunks.len() {
            self.chunks.clear();
            self.head = 0;
        }
        chunk
    }
}

struct ChunkPipeline<S> {
    /// `None` once the upstream is released.
    upstream: Option<Pin<Box<S>>>,
    splitter: FrameSplitter,
    filter: Option<ReasoningFilter>,
    normalizer: StreamNormalizer,
    pending: PendingChunks,
    lines: Vec<String>,
    last_envelope: Envelope,
    last_role: String,
    usage: Option<Usage>,
    stats: StreamStats,
    request_id: Arc<str>,
    prompt_tokens_estimate: u64,
    started: Instant,
}

impl<S> ChunkPipeline<S> {
    fn new(upstream: S, ctx: StreamContext) -> Self {
        let StreamContext {
            identity,
            tags,
            sanitize,
            max_line_bytes,
            request_id,
            prompt_tokens_estimate,
        } = ctx;
        Self {
            upstream: Some(Box::pin(upstream)),
            splitter: FrameSplitter::with_max_line_bytes(max_line_bytes),
            filter: sanitize.then(|| ReasoningFilter::new(tags)),
            normalizer: StreamNormalizer::new(identity),
            pending: PendingChunks::new(),
            lines: Vec::with_capacity(8),
            last_envelope: Envelope::default(),
            last_role: DEFAULT_ROLE.to_string(),
            usage: None,
            stats: StreamStats::default(),
            request_id,
            prompt_tokens_estimate,
            started: Instant::now(),
        }
    }

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.stats.upstream_bytes += bytes.len() as u64;
        let mut lines = std::mem::take(&mut self.lines);
        let framed = self.splitter.feed_into(bytes, &mut lines);
        let mut stopped = false;
        for line in lines.drain(..) {
            if self.on_line(&line).is_break() {
                stopped = true;
                break;
            }
        }
        lines.clear();
        self.lines = lines;
        if stopped {
            return;
        }
        if let Err(err) = framed {
            self.on_frame_error(&err);
        }
    }

    fn on_read_error<E: Display>(&mut self, err: &E) {
        tracing::warn!(
            request_id = %self.request_id,
            error = %err,
            "upstream read failed mid-stream"
        );
        self.fail();
    }

    fn on_frame_error(&mut self, err: &FrameError) {
        tracing::warn!(
            request_id = %self.request_id,
            error = %err,
            "upstream framing error"
        );
        self.fail();
    }

    fn on_end(&mut self) {
        match self.splitter.finish() {
            Ok(Some(tail)) => {
                if self.on_line(&tail).is_break() {
                    return;
                }
            }
            Ok(None) => {}
            Err(err) => {
                self.on_frame_error(&err);
                return;
            }
        }
        self.finish_stream();
    }

    fn on_line(&mut self, line: &str) -> ControlFlow<()> {
        self.stats.lines += 1;
        match decode_line(line) {
            Ok(event) => {
                self.on_event(event);
                ControlFlow::Continue(())
            }
            Err(Skip::Done) => {
                self.finish_stream();
                ControlFlow::Break(())
            }
            Err(Skip::Ignored) => ControlFlow::Continue(()),
            Err(Skip::Malformed(reason)) => {
                self.stats.skipped += 1;
                tracing::debug!(
                    request_id = %self.request_id,
                    %reason,
                    "skipping malformed upstream line"
                );
                ControlFlow::Continue(())
            }
            Err(Skip::UpstreamError(message)) => {
                self.stats.skipped += 1;
                tracing::warn!(
                    request_id = %self.request_id,
                    %message,
                    "upstream reported an error inside the stream"
                );
                ControlFlow::Continue(())
            }
        }
    }

    fn on_event(&mut self, event: ParsedEvent) {
        self.stats.events += 1;
        if event.usage.is_some() {
            self.usage = event.usage;
        }
        let ParsedEvent {
            envelope,
            mut delta,
            shape,
            ..
        } = event;

        if shape == PayloadShape::Bare && delta.text.is_empty() && delta.finish_reason.is_none() {
            self.normalizer.observe(&envelope);
            return;
        }

        if let Some(filter) = self.filter.as_mut() {
            let mut visible = filter.push(&delta.text);
            if delta.finish_reason.is_some() {
                visible.push_str(&filter.flush());
            }
            delta.text = visible;
        }

        self.last_role.clone_from(&delta.role);
        if let Some(chunk) = self.normalizer.chunk(&envelope, delta) {
            self.pending.push(chunk);
        }
        self.last_envelope = envelope;
    }

    fn finish_stream(&mut self) {
        if let Some(filter) = self.filter.as_mut() {
            let residue = filter.flush();
            if let Some(chunk) = self
                .normalizer
                .residue(&self.last_envelope, &self.last_role, residue)
            {
                self.pending.push(chunk);
            }
        }
        if let Some(chunk) = self.normalizer.finish() {
            tracing::warn!(
                request_id = %self.request_id,
                lines = self.stats.lines,
                skipped = self.stats.skipped,
                "upstream produced no usable events; sending fallback"
            );
            self.pending.push(chunk);
        }
        self.release_upstream();
    }

    fn fail(&mut self) {
        self.release_upstream();
        if let Some(chunk) = self.normalizer.fail() {
            self.pending.push(chunk);
        }
    }

    fn release_upstream(&mut self) {
        self.upstream = None;
    }

    fn close(&mut self) {
        if !self.normalizer.close() {
            return;
        }
        let estimated_completion = self.stats.content_bytes.div_ceil(4);
        let usage = merge_usage(
            self.usage.as_ref(),
            self.prompt_tokens_estimate,
            estimated_completion,
        );
        log_stream_complete(
            &self.request_id,
            &self.normalizer.identity().model,
            self.normalizer.outcome().as_str(),
            &self.stats,
            &usage,
            self.started,
        );
    }
}

impl<S> Drop for ChunkPipeline<S> {
    fn drop(&mut self) {
        let phase = self.normalizer.phase();
        if phase == StreamPhase::Closed {
            return;
        }
        if phase.is_terminal() {
            self.close();
            return;
        }
        tracing::info!(
            request_id = %self.request_id,
            phase = phase.as_str(),
            chunks = self.stats.chunks,
            "client disconnected before the stream finished"
        );
        self.release_upstream();
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::normalize::{EMPTY_RESPONSE_MESSAGE, ERROR_RESPONSE_MESSAGE};

    fn ctx() -> StreamContext {
        StreamContext::new(ResponseIdentity::at(1_727_000_000_000, 1, "gpt-4o"))
    }

    fn body(chunks: &[&str]) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send {
        let owned: Vec<Result<Bytes, std::io::Error>> = chunks
            .iter()
            .map(|chunk| Ok(Bytes::copy_from_slice(chunk.as_bytes())))
            .collect();
        futures_util::stream::iter(owned)
    }

    async fn collect(
        upstream: impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
        ctx: StreamContext,
    ) -> Vec<NormalizedChunk> {
        normalized_chunk_stream(upstream, ctx).collect().await
    }

    #[tokio::test]
    async fn test_hi_then_done() {
        let chunks = collect(
            body(&["data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"}}]}\n", "data: [DONE]\n"]),
            ctx(),
        )
        .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), "Hi");
    }

    #[tokio::test]
    async fn test_stops_reading_after_done() {
        let chunks = collect(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"a\"}}]}\ndata: [DONE]\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"late\"}}]}\n",
            ]),
            ctx(),
        )
        .await;
        let contents: Vec<&str> = chunks.iter().map(NormalizedChunk::content).collect();
        assert_eq!(contents, vec!["a"]);
    }

    #[tokio::test]
    async fn test_empty_upstream_yields_single_fallback() {
        let chunks = collect(body(&[": ping\n", "data: nope\n"]), ctx()).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), EMPTY_RESPONSE_MESSAGE);
        assert_eq!(chunks[0].finish_reason(), None);
    }

    #[tokio::test]
    async fn test_read_error_ends_with_error_chunk() {
        let upstream = futures_util::stream::iter(vec![
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n")),
            Err(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"y\"}}]}\n")),
        ]);
        let chunks = collect(upstream, ctx()).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content(), "x");
        assert_eq!(chunks[1].content(), ERROR_RESPONSE_MESSAGE);
        assert_eq!(chunks[1].finish_reason(), Some("error"));
    }

    #[tokio::test]
    async fn test_read_error_on_first_read_has_no_empty_fallback() {
        let upstream = futures_util::stream::iter(vec![Err::<Bytes, _>(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))]);
        let chunks = collect(upstream, ctx()).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].content(), ERROR_RESPONSE_MESSAGE);
        assert_eq!(chunks[0].finish_reason(), Some("error"));
        assert_ne!(chunks[0].content(), EMPTY_RESPONSE_MESSAGE);
    }

    #[tokio::test]
    async fn test_lines_before_invalid_utf8_are_emitted_first() {
        let upstream = futures_util::stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\xFF\n"),
        )]);
        let chunks = collect(upstream, ctx()).await;
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content(), "ok");
        assert_eq!(chunks[1].finish_reason(), Some("error"));
    }

    #[tokio::test]
    async fn test_reasoning_split_across_events_is_removed() {
        let chunks = collect(
            body(&[
                "data: {\"choices\":[{\"delta\":{\"content\":\"<thi\"}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"nk>hidden</think>Answer\"}}]}\n",
                "data: {\"choices\":[{\"delta\":{\"content\":\"\"},\"finish_reason\":\"stop\"}]}\n",
            ]),
            ctx(),
        )
        .await;
        let text: String = chunks.iter().map(NormalizedChunk::content).collect();
        assert_eq!(text, "Answer");
        assert_eq!(chunks.last().and_then(NormalizedChunk::finish_reason), Some("stop"));
    }

    #[tokio::test]
    async fn test_sanitize_disabled_passes_tags_through() {
        let mut ctx = ctx();
        ctx.sanitize = false;
        let chunks = collect(
            body(&["data: {\"choices\":[{\"delta\":{\"content\":\"<think>x</think>y\"}}]}\n"]),
            ctx,
        )
        .await;
        assert_eq!(chunks[0].content(), "<think>x</think>y");
    }

    #[tokio::test]
    async fn test_unclosed_block_released_as_residue() {
        let chunks = collect(
            body(&["data: {\"choices\":[{\"delta\":{\"content\":\"a<think>b\"}}]}\n"]),
            ctx(),
        )
        .await;
        let contents: Vec<&str> = chunks.iter().map(NormalizedChunk::content).collect();
        assert_eq!(contents, vec!["a", "<think>b"]);
    }

    #[tokio::test]
    async fn test_bare_events_carry_identity_only() {
        let chunks = collect(
            body(&[
                "data: {\"id\":\"az-1\",\"choices\":[],\"prompt_filter_results\":[]}\n",
                "data: [DONE]\n",
            ]),
            ctx(),
        )
        .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].id, "az-1");
        assert_eq!(chunks[0].content(), EMPTY_RESPONSE_MESSAGE);
    }

    #[tokio::test]
    async fn test_dropping_stream_releases_upstream() {
        let released = Arc::new(std::sync::atomic::AtomicBool::new(false));
        struct Guard(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }
        let guard = Guard(released.clone());
        let upstream = futures_util::stream::unfold(guard, |guard| async move {
            let line = Bytes::from_static(b"data: {\"choices\":[{\"delta\":{\"content\":\"tick\"}}]}\n");
            Some((Ok::<_, std::io::Error>(line), guard))
        });
        let mut stream = Box::pin(normalized_chunk_stream(upstream, ctx()));
        let first = stream.next().await.unwrap();
        assert_eq!(first.content(), "tick");
        assert!(!released.load(std::sync::atomic::Ordering::SeqCst));
        drop(stream);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }
}

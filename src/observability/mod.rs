pub mod token_counter;

use crate::stream::decoder::Usage;
use tracing_subscriber::EnvFilter;

/// Initialize the tracing subscriber with the configured log level.
///
/// Maps config log levels to tracing levels:
/// - "DISABLED" -> no subscriber installed
/// - "WARNING" -> WARN
/// - "CRITICAL" -> ERROR
/// - Others map directly (TRACE, DEBUG, INFO, WARN, ERROR)
///
/// `RUST_LOG`, when set, takes precedence over the configured level.
pub fn init_tracing(log_level: &str) {
    let level = log_level.to_uppercase();

    if level == "DISABLED" {
        return;
    }

    let tracing_level = match level.as_str() {
        "WARNING" => "WARN",
        "CRITICAL" => "ERROR",
        other => other,
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(tracing_level))
        .unwrap_or_else(|_| EnvFilter::new("INFO"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Log token usage for a completed request, computing duration from start time.
pub fn log_request_complete(
    request_id: &str,
    model: &str,
    usage: &Usage,
    start_time: std::time::Instant,
) {
    token_counter::log_request_usage(request_id, model, usage, start_time.elapsed());
}

/// Summary of one streamed response, logged once when the stream closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStats {
    pub upstream_bytes: u64,
    pub lines: u64,
    pub events: u64,
    pub skipped: u64,
    pub chunks: u64,
    pub content_bytes: u64,
}

/// Log the end of a streamed response at INFO level.
pub fn log_stream_complete(
    request_id: &str,
    model: &str,
    outcome: &'static str,
    stats: &StreamStats,
    usage: &Usage,
    start_time: std::time::Instant,
) {
    tracing::info!(
        request_id = request_id,
        model = model,
        outcome = outcome,
        upstream_bytes = stats.upstream_bytes,
        lines = stats.lines,
        events = stats.events,
        skipped = stats.skipped,
        chunks = stats.chunks,
        prompt_tokens = usage.prompt_tokens.unwrap_or(0),
        completion_tokens = usage.completion_tokens.unwrap_or(0),
        total_tokens = usage.total_tokens.unwrap_or(0),
        duration_seconds = start_time.elapsed().as_secs_f64(),
        "stream completed"
    );
}

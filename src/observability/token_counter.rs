use crate::stream::decoder::Usage;
use std::time::Duration;
use tracing::info;

/// Estimate the number of tokens in `text`.
///
/// Uses a lightweight heuristic (`bytes / 4`) to avoid loading model BPE tables.
#[must_use]
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4)
}

/// Estimate the prompt tokens for a list of message contents.
#[must_use]
pub fn estimate_messages_tokens<'a>(contents: impl IntoIterator<Item = &'a str>) -> u64 {
    contents.into_iter().map(estimate_tokens).sum()
}

/// Merge upstream-reported usage with local estimates.
///
/// Non-zero upstream values always win; missing or zero fields are filled
/// from the estimates, and the total is derived when absent.
#[must_use]
pub fn merge_usage(upstream: Option<&Usage>, estimated_prompt: u64, estimated_completion: u64) -> Usage {
    let pick = |value: Option<u64>, estimate: u64| match value {
        Some(v) if v > 0 => v,
        _ => estimate,
    };
    let upstream = upstream.copied().unwrap_or_default();
    let prompt_tokens = pick(upstream.prompt_tokens, estimated_prompt);
    let completion_tokens = pick(upstream.completion_tokens, estimated_completion);
    let total_tokens = pick(upstream.total_tokens, prompt_tokens + completion_tokens);

    Usage {
        prompt_tokens: Some(prompt_tokens),
        completion_tokens: Some(completion_tokens),
        total_tokens: Some(total_tokens),
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(request_id: &str, model: &str, usage: &Usage, duration: Duration) {
    info!(
        request_id = request_id,
        model = model,
        prompt_tokens = usage.prompt_tokens.unwrap_or(0),
        completion_tokens = usage.completion_tokens.unwrap_or(0),
        total_tokens = usage.total_tokens.unwrap_or(0),
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tokens_nonempty() {
        let count = estimate_tokens("Hello, world!");
        assert!(count > 0, "should estimate at least 1 token");
    }

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_messages_tokens_sums() {
        assert_eq!(estimate_messages_tokens(["abcd", "abcdefgh", ""]), 3);
    }

    #[test]
    fn test_merge_usage_prefers_upstream() {
        let upstream = Usage {
            prompt_tokens: Some(100),
            completion_tokens: Some(50),
            total_tokens: Some(150),
        };
        let merged = merge_usage(Some(&upstream), 999, 999);
        assert_eq!(merged, upstream);
    }

    #[test]
    fn test_merge_usage_fills_missing() {
        let merged = merge_usage(None, 40, 20);
        assert_eq!(merged.prompt_tokens, Some(40));
        assert_eq!(merged.completion_tokens, Some(20));
        assert_eq!(merged.total_tokens, Some(60));
    }

    #[test]
    fn test_merge_usage_fills_zero() {
        let upstream = Usage {
            prompt_tokens: Some(0),
            completion_tokens: Some(0),
            total_tokens: Some(0),
        };
        let merged = merge_usage(Some(&upstream), 30, 10);
        assert_eq!(merged.total_tokens, Some(40));
    }

    #[test]
    fn test_merge_usage_partial_upstream() {
        let upstream = Usage {
            prompt_tokens: Some(100),
            completion_tokens: None,
            total_tokens: None,
        };
        let merged = merge_usage(Some(&upstream), 50, 25);
        assert_eq!(merged.prompt_tokens, Some(100));
        assert_eq!(merged.completion_tokens, Some(25));
        assert_eq!(merged.total_tokens, Some(125));
    }
}

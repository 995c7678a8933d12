mod request_id;

use crate::config::AppConfig;
use crate::stream::ReasoningTags;
use crate::transport::UpstreamClient;

use request_id::RequestIdGenerator;

/// Shared application state accessible to all handlers.
///
/// Immutable after startup apart from the request counter.
pub struct AppState {
    pub config: AppConfig,
    pub upstream: UpstreamClient,
    reasoning_tags: ReasoningTags,
    request_ids: RequestIdGenerator,
}

impl AppState {
    #[must_use]
    pub fn new(config: AppConfig, upstream: UpstreamClient) -> Self {
        tracing::info!(
            upstream = %upstream.url(),
            model = %config.upstream.model,
            auth_scheme = %config.upstream.auth_scheme,
            sanitize_stream = config.features.sanitize_stream,
            "app state initialized"
        );
        let reasoning_tags = ReasoningTags::from_features(&config.features);
        Self {
            config,
            upstream,
            reasoning_tags,
            request_ids: RequestIdGenerator::new(),
        }
    }

    pub fn next_request_seq(&self) -> u64 {
        self.request_ids.next_seq()
    }

    #[must_use]
    pub fn request_uuid(&self, request_seq: u64) -> uuid::Uuid {
        self.request_ids.request_uuid(request_seq)
    }

    #[must_use]
    pub fn reasoning_tags(&self) -> &ReasoningTags {
        &self.reasoning_tags
    }
}

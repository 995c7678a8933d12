use std::time::Duration;

use http::header::{HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use crate::config::{AppConfig, AuthScheme};
use crate::error::GatewayError;
use crate::protocol::UpstreamChatRequest;
use crate::util::truncate_for_log;

const CHAT_COMPLETIONS_PATH: &str = "chat/completions";
const API_VERSION_PARAM: &str = "api-version";
const API_KEY_HEADER: &str = "api-key";
const MAX_ERROR_MESSAGE_LEN: usize = 500;

fn build_reqwest_client(
    use_env_proxy: bool,
    proxy_url: Option<&str>,
) -> Result<reqwest::Client, GatewayError> {
    let mut builder = reqwest::Client::builder()
        .pool_max_idle_per_host(32)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none());

    if let Some(proxy_url) = proxy_url {
        let proxy = reqwest::Proxy::all(proxy_url)
            .map_err(|err| GatewayError::Config(format!("Invalid proxy URL: {err}")))?;
        builder = builder.no_proxy().proxy(proxy);
    } else if !use_env_proxy {
        builder = builder.no_proxy();
    }

    builder
        .build()
        .map_err(|err| GatewayError::Config(format!("Failed to build HTTP client: {err}")))
}

/// Resolve `{endpoint}/chat/completions[?api-version=...]`.
///
/// An endpoint that already names the chat completions path is used as is.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when the endpoint is not a valid URL.
pub fn chat_completions_url(endpoint: &str, api_version: Option<&str>) -> Result<Url, GatewayError> {
    let trimmed = endpoint.trim().trim_end_matches('/');
    let joined = if trimmed.ends_with(CHAT_COMPLETIONS_PATH) {
        trimmed.to_string()
    } else {
        format!("{trimmed}/{CHAT_COMPLETIONS_PATH}")
    };
    let mut url = Url::parse(&joined).map_err(|err| {
        GatewayError::Config(format!("Invalid upstream endpoint '{endpoint}': {err}"))
    })?;

    if let Some(version) = api_version.map(str::trim).filter(|v| !v.is_empty()) {
        let already_set = url.query_pairs().any(|(key, _)| key == API_VERSION_PARAM);
        if !already_set {
            url.query_pairs_mut().append_pair(API_VERSION_PARAM, version);
        }
    }
    Ok(url)
}

/// Client for the single configured upstream inference backend.
///
/// Built once at startup and shared through the application state.
pub struct UpstreamClient {
    client: reqwest::Client,
    url: Url,
    auth_scheme: AuthScheme,
    api_key: HeaderValue,
    /// Bound on a buffered exchange. Streams have none, so long generations
    /// are not cut off.
    buffered_timeout: Duration,
}

impl UpstreamClient {
    /// # Errors
    ///
    /// Returns [`GatewayError::Config`] when the endpoint, key, or proxy
    /// settings cannot be turned into a working client.
    pub fn from_config(config: &AppConfig) -> Result<Self, GatewayError> {
        let upstream = &config.upstream;
        let client = build_reqwest_client(
            config.server.http_use_env_proxy,
            upstream.proxy.as_deref(),
        )?;
        let url = chat_completions_url(&upstream.endpoint, upstream.api_version.as_deref())?;

        let raw_key = match upstream.auth_scheme {
            AuthScheme::Bearer => format!("Bearer {}", upstream.api_key.trim()),
            AuthScheme::ApiKey => upstream.api_key.trim().to_string(),
        };
        let mut api_key = HeaderValue::from_str(&raw_key).map_err(|_| {
            GatewayError::Config("upstream.api_key contains invalid header characters".into())
        })?;
        api_key.set_sensitive(true);

        Ok(Self {
            client,
            url,
            auth_scheme: upstream.auth_scheme,
            api_key,
            buffered_timeout: Duration::from_secs(config.server.timeout),
        })
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Send one chat completion request. No retries.
    ///
    /// On success the response is returned before its body is read.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the upstream cannot be
    /// reached and [`GatewayError::Upstream`] for a non-success status.
    pub async fn send(
        &self,
        request: &UpstreamChatRequest<'_>,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = serde_json::to_vec(request).map_err(|err| {
            GatewayError::Internal(format!("Failed to encode upstream request: {err}"))
        })?;

        let response = self
            .request_builder(body, request.stream)
            .send()
            .await
            .map_err(|err| GatewayError::Transport(format!("Failed to reach upstream: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body_bytes = response
                .bytes()
                .await
                .map_err(|e| GatewayError::Transport(format!("Failed to read error body: {e}")))?;
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&body_bytes),
            });
        }
        Ok(response)
    }

    fn request_builder(&self, body: Vec<u8>, stream: bool) -> reqwest::RequestBuilder {
        let accept = if stream {
            HeaderValue::from_static("text/event-stream")
        } else {
            HeaderValue::from_static("application/json")
        };
        let builder = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(ACCEPT, accept);
        let builder = match self.auth_scheme {
            AuthScheme::Bearer => builder.header(AUTHORIZATION, self.api_key.clone()),
            AuthScheme::ApiKey => builder.header(API_KEY_HEADER, self.api_key.clone()),
        };
        let builder = if stream {
            builder
        } else {
            builder.timeout(self.buffered_timeout)
        };
        builder.body(body)
    }
}

/// Extract a readable message from an upstream error body.
pub(crate) fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(json) = serde_json::from_slice::<serde_json::Value>(body) {
        let message = json
            .get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(serde_json::Value::as_str)
            .or_else(|| json.get("message").and_then(serde_json::Value::as_str));
        if let Some(message) = message {
            return bounded(message);
        }
    }
    let text = String::from_utf8_lossy(body);
    let text = text.trim();
    if text.is_empty() {
        return "empty error body".to_string();
    }
    bounded(text)
}

fn bounded(message: &str) -> String {
    let cut = truncate_for_log(message, MAX_ERROR_MESSAGE_LEN);
    if cut.len() < message.len() {
        format!("{cut}...")
    } else {
        cut.to_string()
    }
}

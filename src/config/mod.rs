pub mod validation;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid environment override {name}: {message}")]
    Env { name: &'static str, message: String },
    #[error("Failed to load .env file: {0}")]
    DotEnv(String),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// How the upstream API key is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`
    #[default]
    Bearer,
    /// `api-key: <key>`
    ApiKey,
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthScheme::Bearer => write!(f, "bearer"),
            AuthScheme::ApiKey => write!(f, "api-key"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Timeout for buffered upstream calls, in seconds. Streamed replies
    /// are only bounded by the connect timeout.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub base_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_worker_threads: Option<usize>,
    #[serde(default)]
    pub http_use_env_proxy: bool,
}

fn default_port() -> u16 {
    3000
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_timeout() -> u64 {
    180
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            timeout: default_timeout(),
            base_path: String::new(),
            runtime_worker_threads: None,
            http_use_env_proxy: false,
        }
    }
}

/// Upstream inference backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base endpoint; `/chat/completions` is appended.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub auth_scheme: AuthScheme,
    /// Sent as the `api-version` query parameter when set.
    #[serde(default)]
    pub api_version: Option<String>,
    /// Model identifier sent upstream and used when a reply omits `model`.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            auth_scheme: AuthScheme::default(),
            api_version: None,
            model: default_model(),
            proxy: None,
        }
    }
}

/// Generation parameters forwarded with every upstream request unless the
/// caller overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
}

fn default_max_tokens() -> u32 {
    2048
}
fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.95
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_open_tag")]
    pub reasoning_open_tag: String,
    #[serde(default = "default_close_tag")]
    pub reasoning_close_tag: String,
    /// Strip reasoning blocks from streamed deltas as well as buffered replies.
    #[serde(default = "default_true")]
    pub sanitize_stream: bool,
    /// Upper bound for one unterminated upstream line.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_open_tag() -> String {
    "<think>".to_string()
}
fn default_close_tag() -> String {
    "</think>".to_string()
}
fn default_max_line_bytes() -> usize {
    1024 * 1024
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            reasoning_open_tag: default_open_tag(),
            reasoning_close_tag: default_close_tag(),
            sanitize_stream: true,
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
}

const ENV_ENDPOINT: &str = "AZURE_INFERENCE_SDK_ENDPOINT";
const ENV_API_KEY: &str = "AZURE_INFERENCE_SDK_KEY";
const ENV_MODEL: &str = "MODEL_NAME";
const ENV_PORT: &str = "PORT";

/// Load configuration from a YAML file (if present), apply environment
/// overrides, and validate the result.
///
/// A `.env` file in the working directory is loaded first when present.
///
/// # Errors
///
/// Returns [`ConfigError::DotEnv`] when a present `.env` file cannot be read,
/// [`ConfigError::Io`] when reading an existing file fails,
/// [`ConfigError::Yaml`] when parsing fails, [`ConfigError::Env`] for an
/// unusable environment override, or [`ConfigError::Validation`] when
/// semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    check_env_file(dotenvy::dotenv())?;

    let mut config = if Path::new(path).exists() {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)?
    } else {
        AppConfig::default()
    };
    apply_env_overrides(&mut config, |name| std::env::var(name).ok())?;
    validate_config(&config)?;
    Ok(config)
}

/// A missing `.env` file is fine; an unreadable or malformed one is not.
/// Runs before logging is set up, so the failure is returned rather than logged.
fn check_env_file<T>(loaded: Result<T, dotenvy::Error>) -> Result<(), ConfigError> {
    match loaded {
        Ok(_) => Ok(()),
        Err(err) if err.not_found() => Ok(()),
        Err(err) => Err(ConfigError::DotEnv(err.to_string())),
    }
}

/// Overlay deployment environment variables onto a parsed config.
///
/// Blank values are ignored.
///
/// # Errors
///
/// Returns [`ConfigError::Env`] when `PORT` is not a valid port number.
pub fn apply_env_overrides<F>(config: &mut AppConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(endpoint) = get(ENV_ENDPOINT) {
        config.upstream.endpoint = endpoint.trim().to_string();
    }
    if let Some(api_key) = get(ENV_API_KEY) {
        config.upstream.api_key = api_key.trim().to_string();
    }
    if let Some(model) = get(ENV_MODEL) {
        config.upstream.model = model.trim().to_string();
    }
    if let Some(port) = get(ENV_PORT) {
        config.server.port = port.trim().parse().map_err(|err| ConfigError::Env {
            name: ENV_PORT,
            message: format!("{port:?}: {err}"),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_env_file_errors() {
        assert!(check_env_file(Ok(())).is_ok());
        let missing = dotenvy::Error::Io(std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(check_env_file::<()>(Err(missing)).is_ok());

        let malformed = dotenvy::Error::LineParse("KEY='unterminated".to_string(), 4);
        let err = check_env_file::<()>(Err(malformed)).unwrap_err();
        assert!(matches!(err, ConfigError::DotEnv(_)));
        assert!(err.to_string().starts_with("Failed to load .env file"));
    }

    #[test]
    fn test_load_example_config() {
        let config = load_config("config.example.yaml");
        assert!(
            config.is_ok(),
            "Failed to load example config: {:?}",
            config.err()
        );
        let config = config.unwrap();
        assert_eq!(config.generation.max_tokens, 2048);
        assert_eq!(config.features.reasoning_open_tag, "<think>");
        assert!(config.features.sanitize_stream);
    }

    #[test]
    fn test_defaults_match_deployment_values() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upstream.model, "gpt-4o");
        assert_eq!(config.upstream.auth_scheme, AuthScheme::Bearer);
        assert_eq!(config.generation.max_tokens, 2048);
        assert!((config.generation.temperature - 0.7).abs() < f32::EPSILON);
        assert!((config.generation.top_p - 0.95).abs() < f32::EPSILON);
        assert_eq!(config.features.max_line_bytes, 1024 * 1024);
    }

    #[test]
    fn test_env_overrides_apply() {
        let mut config = AppConfig::default();
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                ("AZURE_INFERENCE_SDK_ENDPOINT", "https://example.invalid/models"),
                ("AZURE_INFERENCE_SDK_KEY", " secret "),
                ("MODEL_NAME", "DeepSeek-R1"),
                ("PORT", "8080"),
            ]),
        )
        .unwrap();
        assert_eq!(config.upstream.endpoint, "https://example.invalid/models");
        assert_eq!(config.upstream.api_key, "secret");
        assert_eq!(config.upstream.model, "DeepSeek-R1");
        assert_eq!(config.server.port, 8080);
    }

    #[test]
    fn test_blank_env_values_are_ignored() {
        let mut config = AppConfig::default();
        apply_env_overrides(&mut config, lookup_from(&[("MODEL_NAME", "  ")])).unwrap();
        assert_eq!(config.upstream.model, "gpt-4o");
    }

    #[test]
    fn test_bad_port_override_is_rejected() {
        let mut config = AppConfig::default();
        let err = apply_env_overrides(&mut config, lookup_from(&[("PORT", "eighty")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { name: "PORT", .. }));
    }

    #[test]
    fn test_auth_scheme_serde() {
        let json = serde_json::to_string(&AuthScheme::ApiKey).unwrap();
        assert_eq!(json, "\"api-key\"");
        let scheme: AuthScheme = serde_json::from_str("\"bearer\"").unwrap();
        assert_eq!(scheme, AuthScheme::Bearer);
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = "upstream:\n  endpoint: https://example.invalid\n  api_key: k\n";
        let config: AppConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.upstream.model, "gpt-4o");
        assert_eq!(config.features.reasoning_close_tag, "</think>");
    }
}

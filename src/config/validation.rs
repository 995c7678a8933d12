use super::{AppConfig, ConfigError};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_upstream(config)?;
    validate_generation(config)?;
    validate_features(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.timeout == 0 {
        return Err(validation_err("server.timeout must be greater than 0"));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_upstream(config: &AppConfig) -> Result<(), ConfigError> {
    let upstream = &config.upstream;
    if upstream.endpoint.trim().is_empty() {
        return Err(validation_err(
            "upstream.endpoint is required (or set AZURE_INFERENCE_SDK_ENDPOINT)",
        ));
    }
    let parsed = url::Url::parse(upstream.endpoint.trim()).map_err(|err| {
        validation_err(format!(
            "upstream.endpoint '{}' is not a valid URL: {err}",
            upstream.endpoint
        ))
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(validation_err(format!(
            "upstream.endpoint must use http or https, got '{}'",
            parsed.scheme()
        )));
    }
    if upstream.api_key.trim().is_empty() {
        return Err(validation_err(
            "upstream.api_key is required (or set AZURE_INFERENCE_SDK_KEY)",
        ));
    }
    if upstream.model.trim().is_empty() {
        return Err(validation_err("upstream.model cannot be empty"));
    }
    if let Some(version) = upstream.api_version.as_deref() {
        if version.trim().is_empty() {
            return Err(validation_err(
                "upstream.api_version cannot be empty when set",
            ));
        }
    }
    if let Some(proxy) = upstream.proxy.as_deref() {
        url::Url::parse(proxy).map_err(|err| {
            validation_err(format!("upstream.proxy '{proxy}' is not a valid URL: {err}"))
        })?;
    }
    Ok(())
}

fn validate_generation(config: &AppConfig) -> Result<(), ConfigError> {
    let generation = &config.generation;
    if generation.max_tokens == 0 {
        return Err(validation_err("generation.max_tokens must be greater than 0"));
    }
    if !(0.0..=2.0).contains(&generation.temperature) {
        return Err(validation_err(format!(
            "generation.temperature must be within [0, 2], got {}",
            generation.temperature
        )));
    }
    if !(generation.top_p > 0.0 && generation.top_p <= 1.0) {
        return Err(validation_err(format!(
            "generation.top_p must be within (0, 1], got {}",
            generation.top_p
        )));
    }
    Ok(())
}

fn validate_features(config: &AppConfig) -> Result<(), ConfigError> {
    let features = &config.features;
    if features.reasoning_open_tag.is_empty() || features.reasoning_close_tag.is_empty() {
        return Err(validation_err("reasoning tags cannot be empty"));
    }
    if features.reasoning_open_tag == features.reasoning_close_tag {
        return Err(validation_err(
            "reasoning_open_tag and reasoning_close_tag must differ",
        ));
    }
    if features.max_line_bytes < 1024 {
        return Err(validation_err(
            "features.max_line_bytes must be at least 1024",
        ));
    }
    Ok(())
}

const VALID_LOG_LEVELS: &[&str] = &[
    "DEBUG", "INFO", "WARNING", "WARN", "ERROR", "CRITICAL", "TRACE", "DISABLED",
];

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let level = config.features.log_level.to_uppercase();
    if !VALID_LOG_LEVELS.contains(&level.as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of: {}, got '{}'",
            VALID_LOG_LEVELS.join(", "),
            config.features.log_level
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.upstream.endpoint = "https://example.invalid/models".to_string();
        config.upstream.api_key = "key".to_string();
        config
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(validate_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_missing_endpoint() {
        let mut config = valid_config();
        config.upstream.endpoint = "   ".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("upstream.endpoint"));
    }

    #[test]
    fn test_non_http_endpoint() {
        let mut config = valid_config();
        config.upstream.endpoint = "ftp://example.invalid".to_string();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_missing_api_key() {
        let mut config = valid_config();
        config.upstream.api_key.clear();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("api_key"));
    }

    #[test]
    fn test_generation_ranges() {
        let mut config = valid_config();
        config.generation.temperature = 2.5;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.generation.top_p = 0.0;
        assert!(validate_config(&config).is_err());

        let mut config = valid_config();
        config.generation.max_tokens = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_identical_tags_rejected() {
        let mut config = valid_config();
        config.features.reasoning_close_tag = config.features.reasoning_open_tag.clone();
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_invalid_log_level() {
        let mut config = valid_config();
        config.features.log_level = "LOUD".to_string();
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("log_level"));
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = valid_config();
        config.features.log_level = "warning".to_string();
        assert!(validate_config(&config).is_ok());
    }
}

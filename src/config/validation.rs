use crate::config::types::{
    Ao3Config, Config, FetchConfig, PipelineConfig, ProxyConfig, RetryConfig, StoreConfig,
};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_pipeline_config(&config.pipeline)?;
    validate_store_config(&config.store)?;
    validate_fetch_config(&config.fetch)?;
    if let Some(proxy) = &config.proxy {
        validate_proxy_config(proxy)?;
    }
    validate_retry_config(&config.retry)?;
    validate_ao3_config(&config.ao3)?;
    Ok(())
}

/// Validates orchestrator configuration
fn validate_pipeline_config(config: &PipelineConfig) -> Result<(), ConfigError> {
    if config.uploaders < 1 || config.uploaders > 256 {
        return Err(ConfigError::Validation(format!(
            "uploaders must be between 1 and 256, got {}",
            config.uploaders
        )));
    }

    if config.queue_capacity < 1 {
        return Err(ConfigError::Validation(format!(
            "queue_capacity must be >= 1, got {}",
            config.queue_capacity
        )));
    }

    Ok(())
}

/// Validates store configuration
fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    let url = Url::parse(&config.address)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid store address: {}", e)))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(ConfigError::InvalidUrl(format!(
            "Store address '{}' must use http or https",
            config.address
        )));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "store timeout_secs must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates fetch configuration
fn validate_fetch_config(config: &FetchConfig) -> Result<(), ConfigError> {
    if config.user_agent.trim().is_empty() {
        return Err(ConfigError::Validation(
            "user_agent cannot be empty".to_string(),
        ));
    }

    if config.timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "fetch timeout_secs must be > 0".to_string(),
        ));
    }

    Ok(())
}

/// Validates the proxy endpoint
fn validate_proxy_config(config: &ProxyConfig) -> Result<(), ConfigError> {
    validate_host_port(&config.address)?;

    if config.password.is_some() && config.username.is_none() {
        return Err(ConfigError::Validation(
            "proxy password given without a username".to_string(),
        ));
    }

    Ok(())
}

/// Validates retry configuration
fn validate_retry_config(config: &RetryConfig) -> Result<(), ConfigError> {
    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.initial_backoff_ms > config.max_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "initial_backoff_ms ({}) cannot exceed max_backoff_ms ({})",
            config.initial_backoff_ms, config.max_backoff_ms
        )));
    }

    Ok(())
}

/// Validates archiveofourown.org scraper settings
fn validate_ao3_config(config: &Ao3Config) -> Result<(), ConfigError> {
    if config.workers < 1 {
        return Err(ConfigError::Validation(format!(
            "ao3 workers must be >= 1, got {}",
            config.workers
        )));
    }

    if !config.requests_per_second.is_finite() || config.requests_per_second <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "ao3 requests_per_second must be a positive number, got {}",
            config.requests_per_second
        )));
    }

    Ok(())
}

/// Validates a `host:port` pair
fn validate_host_port(address: &str) -> Result<(), ConfigError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        ConfigError::InvalidAddress(format!("'{}' must be in host:port form", address))
    })?;

    if host.is_empty() {
        return Err(ConfigError::InvalidAddress(format!(
            "'{}' has an empty host",
            address
        )));
    }

    port.parse::<u16>().map_err(|_| {
        ConfigError::InvalidAddress(format!("'{}' has an invalid port", address))
    })?;

    Ok(())
}

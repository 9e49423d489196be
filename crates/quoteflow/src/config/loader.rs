use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;
use crate::secrets::SecretRef;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

fn validate_url(field: &str, url: &str) -> Result<(), ConfigError> {
    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(())
    } else {
        Err(invalid(format!("{} must be an http(s) URL, got '{}'", field, url)))
    }
}

fn validate_secret(field: &str, secret: &SecretRef) -> Result<(), ConfigError> {
    if secret.is_configured() {
        Ok(())
    } else {
        Err(invalid(format!(
            "{} needs one of value, file or envVar",
            field
        )))
    }
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    if config.worker_count == 0 {
        return Err(invalid("worker_count must be at least 1"));
    }
    if config.max_concurrent_carriers == 0 {
        return Err(invalid("max_concurrent_carriers must be at least 1"));
    }

    if config.retry.max_attempts == 0 {
        return Err(invalid("retry.max_attempts must be at least 1"));
    }
    if config.retry.backoff_secs.is_empty() {
        return Err(invalid("retry.backoff_secs must not be empty"));
    }

    let threshold = config.recipes.failure_rate_threshold;
    if !(0.0..=1.0).contains(&threshold) {
        return Err(invalid(format!(
            "recipes.failure_rate_threshold must be within 0..=1, got {}",
            threshold
        )));
    }

    validate_url("sessions.provider_url", &config.sessions.provider_url)?;
    validate_secret("sessions.api_key", &config.sessions.api_key)?;
    if config.sessions.max_sessions == 0 {
        return Err(invalid("sessions.max_sessions must be at least 1"));
    }

    validate_url("automation.provider_url", &config.automation.provider_url)?;
    validate_secret("automation.api_key", &config.automation.api_key)?;
    for (carrier, url) in &config.automation.portals {
        validate_url(&format!("automation.portals.{}", carrier), url)?;
    }

    validate_url("client_data.base_url", &config.client_data.base_url)?;
    validate_secret("credentials.encryption_key", &config.credentials.encryption_key)?;

    Ok(())
}

use std::path::{Path, PathBuf};

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

/// Returns the default config location: `~/.batchgen/config.json`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".batchgen").join("config.json"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

/// Loads `path` if given; otherwise the default location if it exists;
/// otherwise built-in defaults.
pub fn load_config_or_default(path: Option<&Path>) -> Result<Config, ConfigError> {
    if let Some(path) = path {
        return load_config(path);
    }

    match default_config_path() {
        Some(default) if default.exists() => load_config(default),
        _ => {
            log::info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
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

/// Semantic checks the schema cannot express.
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let orchestrator = &config.orchestrator;
    if orchestrator.max_batch_size == 0 {
        return Err(ConfigError::InvalidValue {
            field: "orchestrator.max_batch_size",
            reason: "must be at least 1".to_string(),
        });
    }
    if orchestrator.poll_retry_budget == 0 {
        return Err(ConfigError::InvalidValue {
            field: "orchestrator.poll_retry_budget",
            reason: "must be at least 1".to_string(),
        });
    }
    if orchestrator.poll_concurrency == 0 {
        return Err(ConfigError::InvalidValue {
            field: "orchestrator.poll_concurrency",
            reason: "must be at least 1".to_string(),
        });
    }
    if orchestrator.backoff_max_ms < orchestrator.backoff_base_ms {
        return Err(ConfigError::InvalidValue {
            field: "orchestrator.backoff_max_ms",
            reason: format!(
                "{} is smaller than backoff_base_ms ({})",
                orchestrator.backoff_max_ms, orchestrator.backoff_base_ms
            ),
        });
    }

    let base_url = &config.provider.base_url;
    if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
        return Err(ConfigError::InvalidValue {
            field: "provider.base_url",
            reason: format!("'{}' is not an http(s) URL", base_url),
        });
    }

    Ok(())
}

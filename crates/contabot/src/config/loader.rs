use std::path::{Path, PathBuf};

use crate::config::schema::{Config, CONFIG_VERSION};
use crate::error::ConfigError;

/// Env var naming the config file when no path is given.
pub const CONFIG_PATH_ENV_VAR: &str = "CONTABOT_CONFIG";

/// `~/.contabot/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".contabot").join("config.json"))
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let config: Config = serde_json::from_str(content)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != CONFIG_VERSION {
        return Err(invalid(format!(
            "Unsupported config version: {}",
            config.version
        )));
    }

    let worker = &config.worker;
    if worker.interval_secs == 0 {
        return Err(invalid("worker.interval_secs must be at least 1"));
    }
    if worker.batch_size == 0 {
        return Err(invalid("worker.batch_size must be at least 1"));
    }
    if worker.max_attempts == 0 {
        return Err(invalid("worker.max_attempts must be at least 1"));
    }
    if worker.call_timeout_secs == 0 {
        return Err(invalid("worker.call_timeout_secs must be at least 1"));
    }
    if worker.retry_backoff_base_secs > 0
        && worker.retry_backoff_max_secs < worker.retry_backoff_base_secs
    {
        return Err(invalid(
            "worker.retry_backoff_max_secs must not be below retry_backoff_base_secs",
        ));
    }

    if !config.telegram.token.is_configured() {
        return Err(ConfigError::MissingSecret {
            name: "telegram.token",
        });
    }

    let endpoint = config.extraction.endpoint.trim();
    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Err(invalid(format!(
            "extraction.endpoint must be an http(s) URL, got '{}'",
            endpoint
        )));
    }
    if !config.extraction.api_key.is_configured() {
        return Err(ConfigError::MissingSecret {
            name: "extraction.api_key",
        });
    }

    if config.drive.client_id.trim().is_empty() {
        return Err(invalid("drive.client_id must not be empty"));
    }
    if !config.drive.client_secret.is_configured() {
        return Err(ConfigError::MissingSecret {
            name: "drive.client_secret",
        });
    }

    Ok(())
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        message: message.into(),
    }
}

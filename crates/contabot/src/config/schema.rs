use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::default_database_path;
use crate::secrets::{expand_home, SecretSource};
use crate::worker::{RetryBackoff, WorkerSettings};

pub const CONFIG_VERSION: &str = "1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.contabot/data/contabot.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default)]
    pub worker: WorkerConfig,
    pub telegram: TelegramConfig,
    pub extraction: ExtractionConfig,
    pub drive: DriveAppConfig,
    /// Hex AES-256 key for refresh tokens at rest. Optional; tokens are
    /// stored in plain text without it.
    #[serde(default)]
    pub token_key: SecretSource,
    #[serde(default)]
    pub intake: IntakeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    pub fn database_path(&self) -> Option<PathBuf> {
        match &self.database_path {
            Some(path) => Some(PathBuf::from(expand_home(path))),
            None => default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Attempt ceiling stamped on each job at enqueue time.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Timeout of each download, extraction and upload call.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    /// 0 retries on the next poll.
    #[serde(default)]
    pub retry_backoff_base_secs: u64,
    #[serde(default = "default_retry_backoff_max_secs")]
    pub retry_backoff_max_secs: u64,
}

fn default_interval_secs() -> u64 {
    5
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_stale_after_secs() -> u64 {
    600
}

fn default_retry_backoff_max_secs() -> u64 {
    3600
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            call_timeout_secs: default_call_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            retry_backoff_base_secs: 0,
            retry_backoff_max_secs: default_retry_backoff_max_secs(),
        }
    }
}

impl WorkerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            interval: Duration::from_secs(self.interval_secs),
            batch_size: self.batch_size,
            stale_after: Duration::from_secs(self.stale_after_secs),
            backoff: RetryBackoff {
                base: Duration::from_secs(self.retry_backoff_base_secs),
                max: Duration::from_secs(self.retry_backoff_max_secs),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub token: SecretSource,
    #[serde(default)]
    pub api_base: Option<String>,
    /// Server-side wait of each `getUpdates` long poll.
    #[serde(default = "default_poll_timeout_secs")]
    pub poll_timeout_secs: u64,
}

fn default_poll_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionConfig {
    pub endpoint: String,
    pub api_key: SecretSource,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveAppConfig {
    pub client_id: String,
    pub client_secret: SecretSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeConfig {
    /// How long attachments from unbound submitters are kept.
    #[serde(default = "default_pending_binding_ttl_secs")]
    pub pending_binding_ttl_secs: u64,
    #[serde(default = "default_dedupe_window_secs")]
    pub dedupe_window_secs: u64,
}

fn default_pending_binding_ttl_secs() -> u64 {
    24 * 3600
}

fn default_dedupe_window_secs() -> u64 {
    600
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            pending_binding_ttl_secs: default_pending_binding_ttl_secs(),
            dedupe_window_secs: default_dedupe_window_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// One JSON object per line instead of human-readable output.
    #[serde(default)]
    pub json: bool,
    /// Filter directive used when `RUST_LOG` is unset, e.g. `info,contabot=debug`.
    #[serde(default)]
    pub filter: Option<String>,
}

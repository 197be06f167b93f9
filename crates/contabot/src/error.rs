use std::path::PathBuf;
use thiserror::Error;

use crate::gateway::GatewayError;
use crate::intake::IntakeError;
use crate::secrets::SecretError;
use crate::triage::ReviewError;
use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum ContabotError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Secret error: {0}")]
    Secret(#[from] SecretError),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("No source configured for secret '{name}'")]
    MissingSecret { name: &'static str },

    #[error("No config file given and no home directory to look in")]
    NoConfigPath,
}

pub type Result<T> = std::result::Result<T, ContabotError>;

pub mod loader;
pub mod schema;

pub use loader::{
    default_config_path, load_config, load_config_from_str, validate_config, CONFIG_PATH_ENV_VAR,
};
pub use schema::{
    Config, DriveAppConfig, ExtractionConfig, IntakeConfig, LogConfig, TelegramConfig,
    WorkerConfig, CONFIG_VERSION,
};

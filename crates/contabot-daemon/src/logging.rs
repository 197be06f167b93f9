use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use contabot::config::LogConfig;

/// Installs the global subscriber and routes `log` records into it.
///
/// `RUST_LOG` wins over the configured filter; both fall back to `info`.
pub fn init(config: &LogConfig) {
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("Failed to bridge log records into tracing: {}", e);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(config.filter.as_deref().unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let result = if config.json {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().json().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    } else {
        let subscriber = Registry::default()
            .with(filter)
            .with(fmt::layer().with_target(true));
        tracing::subscriber::set_global_default(subscriber)
    };

    if let Err(e) = result {
        eprintln!("Failed to install tracing subscriber: {}", e);
    }
}

mod logging;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::sync::Notify;

use contabot::config::{default_config_path, load_config, Config, CONFIG_PATH_ENV_VAR};
use contabot::gateway::{
    DriveConfig, DriveGateway, ExtractionGateway, FileStorageGateway, HttpExtractionConfig,
    HttpExtractionGateway, MessagingGateway, TelegramGateway,
};
use contabot::intake::{IntakeHandler, IntakeOutcome, MemoryMessageDedupe, MemoryPendingBindings};
use contabot::{ConfigError, ContabotError, Database, JobPipeline, Notifier, TokenEncryptor, WorkerLoop};

/// Pause after a failed `getUpdates` call or a held-back update.
const POLL_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Times one update is handed to intake before it is skipped.
const MAX_DELIVERY_ATTEMPTS: u32 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    let config = match config_path().and_then(|path| {
        let config = load_config(&path)?;
        Ok((path, config))
    }) {
        Ok((path, config)) => {
            logging::init(&config.log);
            info!("Loaded config from {}", path.display());
            config
        }
        Err(e) => {
            eprintln!("contabot: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting contabot v{}", env!("CARGO_PKG_VERSION"));

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("contabot stopped: {}", e);
            ExitCode::FAILURE
        }
    }
}

/// First argument, then `CONTABOT_CONFIG`, then `~/.contabot/config.json`.
fn config_path() -> Result<PathBuf, ConfigError> {
    if let Some(arg) = std::env::args_os().nth(1) {
        return Ok(PathBuf::from(arg));
    }
    if let Some(path) = std::env::var_os(CONFIG_PATH_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    default_config_path().ok_or(ConfigError::NoConfigPath)
}

async fn run(config: Config) -> Result<(), ContabotError> {
    let db_path = config.database_path().ok_or(ConfigError::Validation {
        message: "no database_path configured and no home directory".to_string(),
    })?;
    let db = Database::open(&db_path)?;

    let call_timeout = config.worker.call_timeout();
    let poll_timeout = Duration::from_secs(config.telegram.poll_timeout_secs);

    // The long poll holds the request open for `poll_timeout`.
    let telegram_token = config.telegram.token.resolve()?;
    let telegram = Arc::new(match &config.telegram.api_base {
        Some(base) => {
            TelegramGateway::with_api_base(telegram_token, base.clone(), poll_timeout + call_timeout)?
        }
        None => TelegramGateway::new(telegram_token, poll_timeout + call_timeout)?,
    });
    let messaging: Arc<dyn MessagingGateway> = telegram.clone();

    let extraction: Arc<dyn ExtractionGateway> =
        Arc::new(HttpExtractionGateway::new(HttpExtractionConfig {
            endpoint: config.extraction.endpoint.clone(),
            api_key: config.extraction.api_key.resolve()?,
            model: config.extraction.model.clone(),
            request_timeout: call_timeout,
        })?);

    let storage: Arc<dyn FileStorageGateway> = Arc::new(DriveGateway::new(DriveConfig::new(
        config.drive.client_id.clone(),
        config.drive.client_secret.resolve()?,
        call_timeout,
    ))?);

    let encryptor = match config.token_key.resolve_optional()? {
        Some(key) => Some(Arc::new(TokenEncryptor::from_secret(&key)?)),
        None => {
            warn!("No token key configured; storage refresh tokens are read as plain text");
            None
        }
    };

    let notifier = Notifier::new(db.clone(), messaging.clone());
    let pipeline = JobPipeline::new(
        db.clone(),
        messaging.clone(),
        extraction,
        storage,
        encryptor,
        call_timeout,
    );
    let worker = Arc::new(WorkerLoop::new(
        db.clone(),
        pipeline,
        notifier,
        config.worker.settings(),
    ));
    let worker_task = tokio::spawn(worker.clone().run());

    let intake = IntakeHandler::new(
        db,
        messaging,
        Arc::new(MemoryPendingBindings::new(Duration::from_secs(
            config.intake.pending_binding_ttl_secs,
        ))),
        Arc::new(MemoryMessageDedupe::new(Duration::from_secs(
            config.intake.dedupe_window_secs,
        ))),
        config.worker.max_attempts,
    );

    let shutdown = Arc::new(Notify::new());
    {
        let shutdown = shutdown.clone();
        let worker = worker.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("Shutdown requested");
            worker.stop();
            shutdown.notify_one();
        }) {
            warn!("Failed to install shutdown handler: {}", e);
        }
    }

    poll_updates(&telegram, &intake, &worker, &shutdown, poll_timeout).await;

    worker.stop();
    if let Err(e) = worker_task.await {
        error!("Worker task ended abnormally: {}", e);
    }
    info!("contabot stopped");
    Ok(())
}

/// Failure count of the update the poll loop is holding back.
#[derive(Debug, Default)]
struct Redelivery {
    update_id: Option<i64>,
    failures: u32,
}

impl Redelivery {
    /// Records a failed update. True while it has attempts left.
    fn should_retry(&mut self, update_id: i64) -> bool {
        if self.update_id != Some(update_id) {
            self.update_id = Some(update_id);
            self.failures = 0;
        }
        self.failures += 1;
        self.failures < MAX_DELIVERY_ATTEMPTS
    }
}

/// Feeds Telegram updates to the intake handler until shutdown.
///
/// An update whose handling fails is not confirmed: the next poll starts at
/// it, so Telegram delivers it again.
async fn poll_updates(
    telegram: &TelegramGateway,
    intake: &IntakeHandler,
    worker: &WorkerLoop,
    shutdown: &Notify,
    poll_timeout: Duration,
) {
    let mut offset = None;
    let mut redelivery = Redelivery::default();
    loop {
        let batch = tokio::select! {
            batch = telegram.get_updates(offset, poll_timeout) => batch,
            _ = shutdown.notified() => return,
        };

        let batch = match batch {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Failed to fetch updates: {}", e);
                tokio::select! {
                    _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => continue,
                    _ = shutdown.notified() => return,
                }
            }
        };

        if batch.next_offset.is_some() {
            offset = batch.next_offset;
        }

        let mut held = false;
        for delivery in &batch.deliveries {
            let message = &delivery.message;
            match intake.handle(message).await {
                Ok(IntakeOutcome::Enqueued { .. }) => worker.trigger(),
                Ok(IntakeOutcome::Bound { job_ids, .. }) if !job_ids.is_empty() => {
                    worker.trigger()
                }
                Ok(_) => {}
                Err(e) => {
                    error!(
                        "Failed to handle message {} from chat {}: {}",
                        message.message_id, message.chat_ref, e
                    );
                    if redelivery.should_retry(delivery.update_id) {
                        offset = Some(delivery.update_id);
                        held = true;
                        break;
                    }
                    warn!(
                        "Skipping update {} after {} failed attempts",
                        delivery.update_id, MAX_DELIVERY_ATTEMPTS
                    );
                }
            }
        }

        if held {
            tokio::select! {
                _ = tokio::time::sleep(POLL_ERROR_BACKOFF) => {},
                _ = shutdown.notified() => return,
            }
        }
    }
}

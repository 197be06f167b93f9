pub mod config;
pub mod db;
pub mod error;
pub mod fiscal_id;
pub mod gateway;
pub mod intake;
pub mod invoice;
pub mod messages;
pub mod notifier;
pub mod secrets;
pub mod triage;
pub mod worker;

pub use config::{load_config, Config};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, ContabotError, Result};
pub use fiscal_id::{FiscalId, FiscalIdKind};
pub use gateway::{
    ExtractionGateway, ExtractionResult, FileStorageGateway, GatewayError, InboundMessage,
    MessagingGateway,
};
pub use intake::{IntakeError, IntakeHandler, IntakeOutcome};
pub use invoice::{Invoice, InvoiceFields, InvoiceUpdate, ReviewState};
pub use notifier::Notifier;
pub use secrets::{SecretError, SecretSource, TokenEncryptor};
pub use triage::{classify, ConfidenceBucket, ReviewError, ReviewService, TriageBoard};
pub use worker::{
    AttachmentKind, CycleReport, Job, JobPipeline, JobStatus, JobStoreError, PipelineError, WorkerError,
    WorkerLoop, WorkerSettings,
};

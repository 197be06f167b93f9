use thiserror::Error;

use crate::db::DatabaseError;
use crate::gateway::GatewayError;
use crate::worker::job::JobStatus;

/// Errors from Job Store transitions.
#[derive(Error, Debug)]
pub enum JobStoreError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Job {0} not found")]
    NotFound(i64),

    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: JobStatus,
        to: JobStatus,
    },

    #[error("Job {id} attempt count {attempts} is outside 0..={max} or below the stored count")]
    InvalidAttemptCount { id: i64, attempts: u32, max: u32 },
}

/// Errors raised inside one job's pipeline. These never escape the
/// per-job boundary of a worker cycle.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("No storage credentials configured for tenant {0}")]
    MissingCredentials(i64),

    #[error("Tenant {0} no longer exists")]
    TenantNotFound(i64),

    #[error("Stored credentials for tenant {tenant_id} are unreadable: {reason}")]
    UnreadableCredentials { tenant_id: i64, reason: String },

    #[error("Attachment download failed: {0}")]
    Download(#[source] GatewayError),

    #[error("Upload to file storage failed: {0}")]
    Upload(#[source] GatewayError),

    #[error("{stage} timed out after {secs}s")]
    Timeout { stage: &'static str, secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl PipelineError {
    /// Configuration problems that no amount of retrying fixes.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            PipelineError::MissingCredentials(_)
                | PipelineError::TenantNotFound(_)
                | PipelineError::UnreadableCredentials { .. }
        )
    }
}

/// Errors that abort a whole worker cycle.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Job store error: {0}")]
    JobStore(#[from] JobStoreError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

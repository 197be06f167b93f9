use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::db::{credential_repo, invoice_repo, tenant_repo, Database, DatabaseError};
use crate::gateway::{
    ExtractionGateway, ExtractionResult, FileStorageGateway, MessagingGateway, StorageCredentials,
};
use crate::invoice::{clamp_confidence, low_confidence_note, Invoice, NewInvoice};
use crate::secrets::TokenEncryptor;
use crate::worker::error::PipelineError;
use crate::worker::job::Job;

/// Download → extract → upload → persist for one claimed job.
pub struct JobPipeline {
    db: Database,
    messaging: Arc<dyn MessagingGateway>,
    extraction: Arc<dyn ExtractionGateway>,
    storage: Arc<dyn FileStorageGateway>,
    encryptor: Option<Arc<TokenEncryptor>>,
    call_timeout: Duration,
}

impl JobPipeline {
    pub fn new(
        db: Database,
        messaging: Arc<dyn MessagingGateway>,
        extraction: Arc<dyn ExtractionGateway>,
        storage: Arc<dyn FileStorageGateway>,
        encryptor: Option<Arc<TokenEncryptor>>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            db,
            messaging,
            extraction,
            storage,
            encryptor,
            call_timeout,
        }
    }

    /// Runs the pipeline and returns the job's invoice. A job that already
    /// has one (a re-run after a crash) returns it without repeating work.
    pub async fn run(&self, job: &Job) -> Result<Invoice, PipelineError> {
        if let Some(existing) = invoice_repo::find_by_job_id(&self.db, job.id)? {
            info!(invoice_id = existing.id, "Job already has an invoice");
            return Ok(existing);
        }

        let credentials = {
            let _step = info_span!("load_credentials").entered();
            self.step_load_credentials(job)?
        };

        let bytes = self
            .step_download(job)
            .instrument(info_span!("download"))
            .await?;

        let extraction = self
            .step_extract(job, &bytes)
            .instrument(info_span!("extract"))
            .await;

        let storage_url = self
            .step_upload(job, &credentials, bytes, Utc::now())
            .instrument(info_span!("upload"))
            .await?;

        let _step = info_span!("persist").entered();
        self.step_persist(job, extraction, storage_url)
    }

    fn step_load_credentials(&self, job: &Job) -> Result<StorageCredentials, PipelineError> {
        if tenant_repo::find_tenant(&self.db, job.tenant_id)?.is_none() {
            return Err(PipelineError::TenantNotFound(job.tenant_id));
        }
        let row = credential_repo::find(&self.db, job.tenant_id)?
            .ok_or(PipelineError::MissingCredentials(job.tenant_id))?;

        let refresh_token = if row.encrypted {
            let encryptor =
                self.encryptor
                    .as_ref()
                    .ok_or_else(|| PipelineError::UnreadableCredentials {
                        tenant_id: job.tenant_id,
                        reason: "token is encrypted but no token key is configured".to_string(),
                    })?;
            encryptor
                .decrypt(&row.refresh_token)
                .map_err(|e| PipelineError::UnreadableCredentials {
                    tenant_id: job.tenant_id,
                    reason: e.to_string(),
                })?
        } else {
            row.refresh_token
        };

        Ok(StorageCredentials {
            refresh_token: SecretString::from(refresh_token),
            folder_id: row.folder_id,
        })
    }

    async fn step_download(&self, job: &Job) -> Result<Vec<u8>, PipelineError> {
        let bytes = with_timeout(
            "download",
            self.call_timeout,
            self.messaging.download_attachment(&job.attachment_ref),
        )
        .await?
        .map_err(PipelineError::Download)?;
        debug!(size = bytes.len(), "Downloaded attachment");
        Ok(bytes)
    }

    /// Never fails: any extraction problem degrades to an empty result with
    /// confidence 0 so the invoice still reaches human review.
    async fn step_extract(&self, job: &Job, bytes: &[u8]) -> ExtractionResult {
        let result = with_timeout(
            "extraction",
            self.call_timeout,
            self.extraction.extract(bytes, &job.mime_type),
        )
        .await;

        let error = match result {
            Ok(Ok(extraction)) => return extraction,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        warn!(%error, "Extraction failed, continuing with empty fields");
        ExtractionResult::default()
    }

    async fn step_upload(
        &self,
        job: &Job,
        credentials: &StorageCredentials,
        bytes: Vec<u8>,
        now: DateTime<Utc>,
    ) -> Result<String, PipelineError> {
        let name = upload_name(job, now);
        let url = with_timeout(
            "upload",
            self.call_timeout,
            self.storage.upload(credentials, bytes, &name, &job.mime_type),
        )
        .await?
        .map_err(PipelineError::Upload)?;
        debug!(%name, %url, "Uploaded attachment");
        Ok(url)
    }

    fn step_persist(
        &self,
        job: &Job,
        extraction: ExtractionResult,
        storage_url: String,
    ) -> Result<Invoice, PipelineError> {
        let confidence_score = clamp_confidence(extraction.confidence_score);
        let new_invoice = NewInvoice {
            tenant_id: job.tenant_id,
            submitter_id: job.submitter_id,
            job_id: job.id,
            fields: extraction.fields,
            confidence_score,
            storage_url,
            notes: low_confidence_note(confidence_score),
        };

        let (invoice_id, created) = invoice_repo::insert_for_job(&self.db, &new_invoice)?;
        if !created {
            info!(invoice_id, "Invoice for job already existed");
        }
        invoice_repo::find_by_id(&self.db, invoice_id)?.ok_or_else(|| {
            PipelineError::Database(DatabaseError::MissingRow {
                table: "invoices",
                id: invoice_id,
            })
        })
    }
}

/// `factura_<job id>_<yyyymmddHHMMSS>.<ext>`
pub fn upload_name(job: &Job, now: DateTime<Utc>) -> String {
    format!(
        "factura_{}_{}.{}",
        job.id,
        now.format("%Y%m%d%H%M%S"),
        job.file_ext
    )
}

async fn with_timeout<F, T>(
    stage: &'static str,
    limit: Duration,
    call: F,
) -> Result<T, PipelineError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(limit, call)
        .await
        .map_err(|_| PipelineError::Timeout {
            stage,
            secs: limit.as_secs(),
        })
}

use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

use super::export::ExportBatch;
use super::TriageBoard;
use crate::db::invoice_repo::{self, InvoiceFilter};
use crate::db::{job_repo, Database, DatabaseError};
use crate::invoice::{Invoice, InvoiceUpdate, ReviewState};
use crate::messages;
use crate::notifier::Notifier;

#[derive(Error, Debug)]
pub enum ReviewError {
    #[error("Invoice {0} not found")]
    NotFound(i64),

    #[error("Invoice {id} is {state} and cannot be changed that way")]
    InvalidState { id: i64, state: ReviewState },

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Result of [`ReviewService::approve_batch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    pub approved: usize,
    pub skipped: usize,
}

/// Reviewer actions on invoices.
#[derive(Clone)]
pub struct ReviewService {
    db: Database,
    notifier: Notifier,
}

impl ReviewService {
    pub fn new(db: Database, notifier: Notifier) -> Self {
        Self { db, notifier }
    }

    /// Pending and ready invoices of a tenant, bucketed.
    pub fn board(&self, tenant_id: i64) -> Result<TriageBoard, ReviewError> {
        let invoices = invoice_repo::list(
            &self.db,
            &InvoiceFilter {
                tenant_id: Some(tenant_id),
                states: vec![ReviewState::Pending, ReviewState::Ready],
                limit: None,
            },
        )?;
        Ok(TriageBoard::build(invoices))
    }

    /// `pending → ready`.
    pub fn mark_ready(&self, id: i64) -> Result<Invoice, ReviewError> {
        self.move_to(id, &[ReviewState::Pending], ReviewState::Ready)
    }

    /// `ready → approved`. Any other state is an error and nothing changes.
    pub fn approve(&self, id: i64) -> Result<Invoice, ReviewError> {
        self.move_to(id, &[ReviewState::Ready], ReviewState::Approved)
    }

    /// Approves each id on its own; ids that are missing or not ready are
    /// skipped without affecting the rest.
    pub fn approve_batch(&self, ids: &[i64]) -> Result<BatchOutcome, ReviewError> {
        let mut outcome = BatchOutcome::default();
        for &id in ids {
            match self.approve(id) {
                Ok(_) => outcome.approved += 1,
                Err(ReviewError::NotFound(_) | ReviewError::InvalidState { .. }) => {
                    outcome.skipped += 1
                }
                Err(e) => return Err(e),
            }
        }
        info!(
            "Batch approval: {} approved, {} skipped",
            outcome.approved, outcome.skipped
        );
        Ok(outcome)
    }

    /// Rejects a non-terminal invoice and sends the original attachment back
    /// to its submitter with the reason.
    pub async fn reject(&self, id: i64, reason: &str) -> Result<Invoice, ReviewError> {
        let invoice = self.move_to(
            id,
            &[
                ReviewState::Pending,
                ReviewState::Ready,
                ReviewState::Approved,
            ],
            ReviewState::Rejected,
        )?;
        info!("Rejected invoice {}: {}", id, reason);

        match job_repo::find_by_id(&self.db, invoice.job_id) {
            Ok(Some(job)) => {
                self.notifier
                    .resend(
                        invoice.submitter_id,
                        &job.attachment_ref,
                        job.attachment_kind,
                        &messages::invoice_rejected(reason),
                    )
                    .await
            }
            Ok(None) => warn!(
                "Job {} of invoice {} is gone, skipping rejection notice",
                invoice.job_id, id
            ),
            Err(e) => warn!("Failed to look up job of invoice {}: {}", id, e),
        }
        Ok(invoice)
    }

    /// Applies reviewer corrections. Only pending and ready invoices accept
    /// them.
    pub fn update_fields(&self, id: i64, update: &InvoiceUpdate) -> Result<Invoice, ReviewError> {
        if !invoice_repo::update_fields(&self.db, id, update)? {
            let current = self.find(id)?;
            return Err(ReviewError::InvalidState {
                id,
                state: current.review_state,
            });
        }
        self.find(id)
    }

    /// Moves every approved invoice of the tenant to `exported`.
    pub fn export_approved(&self, tenant_id: i64) -> Result<ExportBatch, ReviewError> {
        let invoices = invoice_repo::export_approved(&self.db, tenant_id)?;
        info!(
            "Exported {} invoice(s) for tenant {}",
            invoices.len(),
            tenant_id
        );
        Ok(ExportBatch::new(tenant_id, invoices))
    }

    fn find(&self, id: i64) -> Result<Invoice, ReviewError> {
        invoice_repo::find_by_id(&self.db, id)?.ok_or(ReviewError::NotFound(id))
    }

    fn move_to(
        &self,
        id: i64,
        from: &[ReviewState],
        to: ReviewState,
    ) -> Result<Invoice, ReviewError> {
        if !invoice_repo::transition(&self.db, id, from, to)? {
            let current = self.find(id)?;
            return Err(ReviewError::InvalidState {
                id,
                state: current.review_state,
            });
        }
        self.find(id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use super::*;
    use crate::db::tenant_repo;
    use crate::fiscal_id::FiscalId;
    use crate::gateway::{GatewayError, MessagingGateway};
    use crate::invoice::{InvoiceFields, NewInvoice};
    use crate::worker::job::{AttachmentKind, NewJob};

    type Sent = Mutex<Vec<(String, String, String)>>;

    #[derive(Default)]
    struct RecordingMessenger {
        photos: Sent,
        documents: Sent,
    }

    fn record(sent: &Sent, chat_ref: &str, file_ref: &str, caption: &str) {
        sent.lock().unwrap().push((
            chat_ref.to_string(),
            file_ref.to_string(),
            caption.to_string(),
        ));
    }

    #[async_trait]
    impl MessagingGateway for RecordingMessenger {
        async fn download_attachment(&self, _attachment_ref: &str) -> Result<Vec<u8>, GatewayError> {
            Ok(Vec::new())
        }

        async fn send_message(&self, _chat_ref: &str, _text: &str) -> Result<(), GatewayError> {
            Ok(())
        }

        async fn send_photo(
            &self,
            chat_ref: &str,
            file_ref: &str,
            caption: &str,
        ) -> Result<(), GatewayError> {
            record(&self.photos, chat_ref, file_ref, caption);
            Ok(())
        }

        async fn send_document(
            &self,
            chat_ref: &str,
            file_ref: &str,
            caption: &str,
        ) -> Result<(), GatewayError> {
            record(&self.documents, chat_ref, file_ref, caption);
            Ok(())
        }
    }

    struct Fixture {
        db: Database,
        messenger: Arc<RecordingMessenger>,
        service: ReviewService,
        tenant: i64,
        submitter: i64,
    }

    fn setup() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let rnc = FiscalId::parse("130123456").unwrap();
        let tenant = tenant_repo::insert_tenant(&db, None, "Sol", "130-12345-6", &rnc).unwrap();
        let submitter = tenant_repo::upsert_submitter(&db, "42", "chat-42", None, None)
            .unwrap()
            .id;
        let messenger = Arc::new(RecordingMessenger::default());
        let notifier = Notifier::new(db.clone(), messenger.clone());
        Fixture {
            service: ReviewService::new(db.clone(), notifier),
            db,
            messenger,
            tenant,
            submitter,
        }
    }

    fn invoice(f: &Fixture, score: f64) -> i64 {
        invoice_from(f, score, AttachmentKind::Photo)
    }

    fn invoice_from(f: &Fixture, score: f64, kind: AttachmentKind) -> i64 {
        let job_id = job_repo::enqueue(
            &f.db,
            &NewJob {
                tenant_id: f.tenant,
                submitter_id: f.submitter,
                attachment_ref: format!("{}-{}", kind, score),
                attachment_kind: kind,
                mime_type: "image/jpeg".into(),
                file_ext: "jpg".into(),
                correlation_id: "m".into(),
            },
            3,
        )
        .unwrap();
        invoice_repo::insert_for_job(
            &f.db,
            &NewInvoice {
                tenant_id: f.tenant,
                submitter_id: f.submitter,
                job_id,
                fields: InvoiceFields {
                    date: Some("2026-03-01".into()),
                    ..Default::default()
                },
                confidence_score: score,
                storage_url: "https://files.example/x".into(),
                notes: None,
            },
        )
        .unwrap()
        .0
    }

    #[test]
    fn test_approve_requires_ready() {
        let f = setup();
        let id = invoice(&f, 99.0);

        let err = f.service.approve(id).unwrap_err();
        assert!(matches!(
            err,
            ReviewError::InvalidState {
                state: ReviewState::Pending,
                ..
            }
        ));
        let unchanged = invoice_repo::find_by_id(&f.db, id).unwrap().unwrap();
        assert_eq!(unchanged.review_state, ReviewState::Pending);
        assert!(unchanged.reviewed_at.is_none());

        f.service.mark_ready(id).unwrap();
        let approved = f.service.approve(id).unwrap();
        assert_eq!(approved.review_state, ReviewState::Approved);
    }

    #[test]
    fn test_approve_missing_invoice() {
        let f = setup();
        assert!(matches!(
            f.service.approve(999),
            Err(ReviewError::NotFound(999))
        ));
    }

    #[test]
    fn test_approve_batch_counts() {
        let f = setup();
        let ids: Vec<i64> = (0..5).map(|i| invoice(&f, 90.0 + i as f64)).collect();
        f.service.mark_ready(ids[0]).unwrap();
        f.service.mark_ready(ids[3]).unwrap();

        let outcome = f.service.approve_batch(&ids).unwrap();
        assert_eq!(
            outcome,
            BatchOutcome {
                approved: 2,
                skipped: 3
            }
        );
    }

    #[tokio::test]
    async fn test_reject_resends_attachment() {
        let f = setup();
        let id = invoice(&f, 50.0);

        let rejected = f.service.reject(id, "imagen borrosa").await.unwrap();
        assert_eq!(rejected.review_state, ReviewState::Rejected);

        let photos = f.messenger.photos.lock().unwrap();
        assert_eq!(photos.len(), 1);
        assert_eq!(photos[0].0, "chat-42");
        assert_eq!(photos[0].1, "photo-50");
        assert!(photos[0].2.contains("imagen borrosa"));
        assert!(f.messenger.documents.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reject_sends_documents_back_as_documents() {
        let f = setup();
        let id = invoice_from(&f, 40.0, AttachmentKind::Document);

        f.service.reject(id, "falta el RNC").await.unwrap();

        let documents = f.messenger.documents.lock().unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].1, "document-40");
        assert!(documents[0].2.contains("falta el RNC"));
        assert!(f.messenger.photos.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_invoices_cannot_be_rejected() {
        let f = setup();
        let id = invoice(&f, 97.0);
        f.service.reject(id, "duplicada").await.unwrap();

        let err = f.service.reject(id, "otra vez").await.unwrap_err();
        assert!(matches!(
            err,
            ReviewError::InvalidState {
                state: ReviewState::Rejected,
                ..
            }
        ));
        assert_eq!(f.messenger.photos.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_update_fields_only_while_editable() {
        let f = setup();
        let id = invoice(&f, 70.0);
        let update = InvoiceUpdate {
            vendor_name: Some("Ferretería Ochoa".into()),
            total: Some(236.0),
            ..Default::default()
        };

        let updated = f.service.update_fields(id, &update).unwrap();
        assert_eq!(updated.fields.vendor_name.as_deref(), Some("Ferretería Ochoa"));
        assert_eq!(updated.fields.amounts.total, 236.0);

        f.service.mark_ready(id).unwrap();
        f.service.approve(id).unwrap();
        assert!(matches!(
            f.service.update_fields(id, &update),
            Err(ReviewError::InvalidState {
                state: ReviewState::Approved,
                ..
            })
        ));
    }

    #[test]
    fn test_board_and_export() {
        let f = setup();
        let high = invoice(&f, 97.0);
        let low = invoice(&f, 30.0);
        let ready = invoice(&f, 85.0);
        f.service.mark_ready(ready).unwrap();

        let board = f.service.board(f.tenant).unwrap();
        assert_eq!(board.alta_confianza.len(), 1);
        assert_eq!(board.baja_confianza[0].id, low);
        assert_eq!(board.listas[0].id, ready);
        assert!(board.media_confianza.is_empty());

        f.service.approve(ready).unwrap();
        let batch = f.service.export_approved(f.tenant).unwrap();
        assert_eq!(batch.invoices.len(), 1);
        assert_eq!(batch.invoices[0].review_state, ReviewState::Exported);
        assert_eq!(batch.lines.len(), 1);

        let board = f.service.board(f.tenant).unwrap();
        assert_eq!(board.len(), 2);
        assert_eq!(board.alta_confianza[0].id, high);

        assert!(f.service.export_approved(f.tenant).unwrap().is_empty());
    }

    #[test]
    fn test_board_shows_every_open_invoice() {
        let f = setup();
        for i in 0..501 {
            invoice(&f, (i % 100) as f64);
        }

        let board = f.service.board(f.tenant).unwrap();
        assert_eq!(board.len(), 501);
    }
}

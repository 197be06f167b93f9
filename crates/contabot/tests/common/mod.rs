//! Shared harness for integration tests: an in-memory database seeded with
//! one tenant, plus in-process gateway fakes.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use contabot::db::{credential_repo, job_repo, tenant_repo, Database};
use contabot::gateway::{
    Attachment, ExtractionGateway, ExtractionResult, FileStorageGateway, GatewayError,
    InboundMessage, MessageContent, MessagingGateway, StorageCredentials,
};
use contabot::intake::{IntakeHandler, MemoryMessageDedupe, MemoryPendingBindings};
use contabot::invoice::{Amounts, InvoiceFields};
use contabot::worker::{AttachmentKind, JobPipeline, NewJob, WorkerLoop, WorkerSettings};
use contabot::{FiscalId, Notifier};

pub const TENANT_FISCAL_ID: &str = "130123456";
pub const BOUND_CHAT: &str = "chat-bound";
pub const MAX_ATTEMPTS: u32 = 3;

// ─── Gateway fakes ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingMessenger {
    pub texts: Mutex<Vec<(String, String)>>,
    pub photos: Mutex<Vec<(String, String, String)>>,
    pub documents: Mutex<Vec<(String, String, String)>>,
    pub downloads: AtomicUsize,
}

impl RecordingMessenger {
    pub fn texts_to(&self, chat_ref: &str) -> Vec<String> {
        self.texts
            .lock()
            .unwrap()
            .iter()
            .filter(|(chat, _)| chat == chat_ref)
            .map(|(_, text)| text.clone())
            .collect()
    }
}

#[async_trait]
impl MessagingGateway for RecordingMessenger {
    async fn download_attachment(&self, attachment_ref: &str) -> Result<Vec<u8>, GatewayError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        Ok(format!("bytes of {}", attachment_ref).into_bytes())
    }

    async fn send_message(&self, chat_ref: &str, text: &str) -> Result<(), GatewayError> {
        self.texts
            .lock()
            .unwrap()
            .push((chat_ref.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError> {
        self.photos.lock().unwrap().push((
            chat_ref.to_string(),
            file_ref.to_string(),
            caption.to_string(),
        ));
        Ok(())
    }

    async fn send_document(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError> {
        self.documents.lock().unwrap().push((
            chat_ref.to_string(),
            file_ref.to_string(),
            caption.to_string(),
        ));
        Ok(())
    }
}

/// Returns the same result for every document, optionally after a delay.
pub struct FixedExtraction {
    pub result: ExtractionResult,
    pub delay: Duration,
}

impl FixedExtraction {
    pub fn with_confidence(confidence_score: f64) -> Self {
        Self {
            result: ExtractionResult {
                fields: InvoiceFields {
                    date: Some("2026-03-01".into()),
                    fiscal_id: Some("101-00000-1".into()),
                    document_number: Some("B0100000042".into()),
                    vendor_name: Some("Supermercado Nacional".into()),
                    amounts: Amounts {
                        goods: 1000.0,
                        itbis: 180.0,
                        total: 1180.0,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                confidence_score,
            },
            delay: Duration::ZERO,
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ExtractionGateway for FixedExtraction {
    async fn extract(&self, _bytes: &[u8], _mime_type: &str) -> Result<ExtractionResult, GatewayError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.result.clone())
    }
}

pub struct FailingExtraction;

#[async_trait]
impl ExtractionGateway for FailingExtraction {
    async fn extract(&self, _bytes: &[u8], _mime_type: &str) -> Result<ExtractionResult, GatewayError> {
        Err(GatewayError::Status {
            service: "extraction",
            status: 500,
            body: "model unavailable".into(),
        })
    }
}

#[derive(Default)]
pub struct MemoryStorage {
    pub uploads: Mutex<Vec<String>>,
}

#[async_trait]
impl FileStorageGateway for MemoryStorage {
    async fn upload(
        &self,
        _credentials: &StorageCredentials,
        _bytes: Vec<u8>,
        name: &str,
        _mime_type: &str,
    ) -> Result<String, GatewayError> {
        self.uploads.lock().unwrap().push(name.to_string());
        Ok(format!("https://files.example/{}", name))
    }
}

#[derive(Default)]
pub struct FailingStorage {
    pub calls: AtomicUsize,
}

#[async_trait]
impl FileStorageGateway for FailingStorage {
    async fn upload(
        &self,
        _credentials: &StorageCredentials,
        _bytes: Vec<u8>,
        _name: &str,
        _mime_type: &str,
    ) -> Result<String, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GatewayError::Status {
            service: "drive",
            status: 503,
            body: "backend error".into(),
        })
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

pub struct Harness {
    pub db: Database,
    pub messenger: Arc<RecordingMessenger>,
    pub tenant_id: i64,
    /// Submitter already bound to the tenant, chatting from [`BOUND_CHAT`].
    pub submitter_id: i64,
}

impl Harness {
    /// Tenant with Drive credentials and one bound submitter.
    pub fn new() -> Self {
        let db = Database::open_in_memory().expect("Failed to create test database");
        let fiscal_id = FiscalId::parse(TENANT_FISCAL_ID).unwrap();
        let tenant_id =
            tenant_repo::insert_tenant(&db, Some(1), "Ferretería Sol SRL", "130-12345-6", &fiscal_id)
                .unwrap();
        credential_repo::upsert(
            &db,
            tenant_id,
            "google_drive",
            "refresh-token",
            false,
            Some("folder-1"),
        )
        .unwrap();

        let submitter_id = tenant_repo::upsert_submitter(
            &db,
            "user-bound",
            BOUND_CHAT,
            Some("ana"),
            Some("Ana Pérez"),
        )
        .unwrap()
        .id;
        tenant_repo::bind_submitter(&db, submitter_id, tenant_id).unwrap();

        Self {
            db,
            messenger: Arc::new(RecordingMessenger::default()),
            tenant_id,
            submitter_id,
        }
    }

    pub fn enqueue(&self, attachment_ref: &str) -> i64 {
        job_repo::enqueue(
            &self.db,
            &NewJob {
                tenant_id: self.tenant_id,
                submitter_id: self.submitter_id,
                attachment_ref: attachment_ref.to_string(),
                attachment_kind: AttachmentKind::Photo,
                mime_type: "image/jpeg".into(),
                file_ext: "jpg".into(),
                correlation_id: format!("msg-{}", attachment_ref),
            },
            MAX_ATTEMPTS,
        )
        .unwrap()
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.db.clone(), self.messenger.clone())
    }

    pub fn worker(
        &self,
        extraction: Arc<dyn ExtractionGateway>,
        storage: Arc<dyn FileStorageGateway>,
    ) -> WorkerLoop {
        let pipeline = JobPipeline::new(
            self.db.clone(),
            self.messenger.clone(),
            extraction,
            storage,
            None,
            Duration::from_secs(5),
        );
        WorkerLoop::new(
            self.db.clone(),
            pipeline,
            self.notifier(),
            WorkerSettings::default(),
        )
    }

    pub fn intake(&self) -> IntakeHandler {
        IntakeHandler::new(
            self.db.clone(),
            self.messenger.clone(),
            Arc::new(MemoryPendingBindings::new(Duration::from_secs(3600))),
            Arc::new(MemoryMessageDedupe::new(Duration::from_secs(600))),
            MAX_ATTEMPTS,
        )
    }
}

pub fn photo_message(chat: &str, user: &str, message_id: &str, file_ref: &str) -> InboundMessage {
    InboundMessage {
        chat_ref: chat.to_string(),
        submitter_external_id: user.to_string(),
        username: None,
        display_name: Some("Luis".to_string()),
        message_id: message_id.to_string(),
        content: MessageContent::Attachment(Attachment {
            file_ref: file_ref.to_string(),
            kind: AttachmentKind::Photo,
            mime_type: "image/jpeg".to_string(),
            file_name: None,
        }),
    }
}

pub fn document_message(chat: &str, user: &str, message_id: &str, file_ref: &str) -> InboundMessage {
    InboundMessage {
        chat_ref: chat.to_string(),
        submitter_external_id: user.to_string(),
        username: None,
        display_name: Some("Luis".to_string()),
        message_id: message_id.to_string(),
        content: MessageContent::Attachment(Attachment {
            file_ref: file_ref.to_string(),
            kind: AttachmentKind::Document,
            mime_type: "application/pdf".to_string(),
            file_name: Some("factura.pdf".to_string()),
        }),
    }
}

pub fn text_message(chat: &str, user: &str, message_id: &str, text: &str) -> InboundMessage {
    InboundMessage {
        chat_ref: chat.to_string(),
        submitter_external_id: user.to_string(),
        username: None,
        display_name: Some("Luis".to_string()),
        message_id: message_id.to_string(),
        content: MessageContent::Text(text.to_string()),
    }
}

//! Best-effort replies to submitters. Failures are logged and never
//! propagate.

use std::sync::Arc;

use log::warn;

use crate::db::{tenant_repo, Database};
use crate::gateway::MessagingGateway;
use crate::worker::job::AttachmentKind;

#[derive(Clone)]
pub struct Notifier {
    db: Database,
    messaging: Arc<dyn MessagingGateway>,
}

impl Notifier {
    pub fn new(db: Database, messaging: Arc<dyn MessagingGateway>) -> Self {
        Self { db, messaging }
    }

    fn chat_ref(&self, submitter_id: i64) -> Option<String> {
        match tenant_repo::find_submitter(&self.db, submitter_id) {
            Ok(Some(submitter)) => Some(submitter.chat_ref),
            Ok(None) => {
                warn!("Submitter {} not found, skipping notification", submitter_id);
                None
            }
            Err(e) => {
                warn!("Failed to look up submitter {}: {}", submitter_id, e);
                None
            }
        }
    }

    pub async fn text(&self, submitter_id: i64, text: &str) {
        let Some(chat_ref) = self.chat_ref(submitter_id) else {
            return;
        };
        if let Err(e) = self.messaging.send_message(&chat_ref, text).await {
            warn!("Failed to notify submitter {}: {}", submitter_id, e);
        }
    }

    /// Sends a received file back the way it arrived.
    pub async fn resend(
        &self,
        submitter_id: i64,
        file_ref: &str,
        kind: AttachmentKind,
        caption: &str,
    ) {
        let Some(chat_ref) = self.chat_ref(submitter_id) else {
            return;
        };
        let sent = match kind {
            AttachmentKind::Photo => self.messaging.send_photo(&chat_ref, file_ref, caption).await,
            AttachmentKind::Document => {
                self.messaging
                    .send_document(&chat_ref, file_ref, caption)
                    .await
            }
        };
        if let Err(e) = sent {
            warn!("Failed to send {} to submitter {}: {}", kind, submitter_id, e);
        }
    }
}

use std::sync::Arc;

use log::{info, warn};
use tracing::{info_span, Instrument};

use super::state::{MessageDedupe, PendingBindings, StashedAttachment};
use super::IntakeError;
use crate::db::{job_repo, tenant_repo, Database};
use crate::db::tenant_repo::SubmitterRow;
use crate::fiscal_id::FiscalId;
use crate::gateway::{Attachment, InboundMessage, MessageContent, MessagingGateway};
use crate::messages;
use crate::worker::job::NewJob;

/// What the handler did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// Already seen within the dedupe window; nothing was done.
    Duplicate,
    /// The sender is unbound and was asked for a fiscal id.
    AwaitingFiscalId,
    /// A fiscal-id reply did not resolve to a tenant.
    BindingRejected(BindingRejection),
    /// The sender is now bound; stashed attachments were enqueued.
    Bound { tenant_id: i64, job_ids: Vec<i64> },
    Enqueued { job_id: i64 },
    /// Text from a bound sender; answered with a hint.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRejection {
    InvalidFormat,
    UnknownTenant,
}

/// Turns inbound messages into onboarding steps or queued jobs.
pub struct IntakeHandler {
    db: Database,
    messaging: Arc<dyn MessagingGateway>,
    bindings: Arc<dyn PendingBindings>,
    dedupe: Arc<dyn MessageDedupe>,
    max_attempts: u32,
}

impl IntakeHandler {
    pub fn new(
        db: Database,
        messaging: Arc<dyn MessagingGateway>,
        bindings: Arc<dyn PendingBindings>,
        dedupe: Arc<dyn MessageDedupe>,
        max_attempts: u32,
    ) -> Self {
        Self {
            db,
            messaging,
            bindings,
            dedupe,
            max_attempts,
        }
    }

    pub async fn handle(&self, message: &InboundMessage) -> Result<IntakeOutcome, IntakeError> {
        let span = info_span!(
            "intake",
            chat = %message.chat_ref,
            message_id = %message.message_id
        );
        self.handle_inner(message).instrument(span).await
    }

    async fn handle_inner(&self, message: &InboundMessage) -> Result<IntakeOutcome, IntakeError> {
        let key = format!("{}:{}", message.chat_ref, message.message_id);
        if !self.dedupe.first_delivery(&key) {
            info!("Ignoring duplicate delivery of message {}", key);
            return Ok(IntakeOutcome::Duplicate);
        }

        let outcome = self.dispatch(message).await;
        if outcome.is_err() {
            // A redelivery of this message is handled again.
            self.dedupe.forget(&key);
        }
        outcome
    }

    async fn dispatch(&self, message: &InboundMessage) -> Result<IntakeOutcome, IntakeError> {
        let submitter = tenant_repo::upsert_submitter(
            &self.db,
            &message.submitter_external_id,
            &message.chat_ref,
            message.username.as_deref(),
            message.display_name.as_deref(),
        )?;

        match (submitter.tenant_id, &message.content) {
            (None, MessageContent::Attachment(attachment)) => {
                self.bindings.stash(
                    submitter.id,
                    StashedAttachment {
                        attachment: attachment.clone(),
                        message_id: message.message_id.clone(),
                    },
                );
                info!(
                    "Stashed attachment from unbound submitter {} until binding",
                    submitter.id
                );
                self.notify(&message.chat_ref, messages::FISCAL_ID_PROMPT).await;
                Ok(IntakeOutcome::AwaitingFiscalId)
            }
            (None, MessageContent::Text(text)) if is_start_command(text) => {
                self.notify(&message.chat_ref, messages::FISCAL_ID_PROMPT).await;
                Ok(IntakeOutcome::AwaitingFiscalId)
            }
            (None, MessageContent::Text(text)) => self.try_bind(&submitter, text).await,
            (Some(tenant_id), MessageContent::Attachment(attachment)) => {
                let job_id = self.enqueue(
                    tenant_id,
                    submitter.id,
                    attachment,
                    &message.message_id,
                )?;
                self.notify(&message.chat_ref, messages::INVOICE_RECEIVED).await;
                Ok(IntakeOutcome::Enqueued { job_id })
            }
            (Some(tenant_id), MessageContent::Text(_)) => {
                if let Some(tenant) = tenant_repo::find_tenant(&self.db, tenant_id)? {
                    self.notify(&message.chat_ref, &messages::bound_hint(&tenant.name))
                        .await;
                }
                Ok(IntakeOutcome::Ignored)
            }
        }
    }

    /// Treats `text` as a fiscal-id reply from an unbound submitter.
    async fn try_bind(
        &self,
        submitter: &SubmitterRow,
        text: &str,
    ) -> Result<IntakeOutcome, IntakeError> {
        let fiscal_id = match FiscalId::parse(text) {
            Ok(id) => id,
            Err(e) => {
                info!("Submitter {} sent an invalid fiscal id: {}", submitter.id, e);
                self.notify(&submitter.chat_ref, messages::INVALID_FISCAL_ID).await;
                return Ok(IntakeOutcome::BindingRejected(BindingRejection::InvalidFormat));
            }
        };

        let Some(tenant) = tenant_repo::find_tenant_by_fiscal_id(&self.db, &fiscal_id)? else {
            info!(
                "No tenant with fiscal id {} for submitter {}",
                fiscal_id, submitter.id
            );
            self.notify(
                &submitter.chat_ref,
                &messages::unknown_fiscal_id(fiscal_id.as_str()),
            )
            .await;
            return Ok(IntakeOutcome::BindingRejected(BindingRejection::UnknownTenant));
        };

        tenant_repo::bind_submitter(&self.db, submitter.id, tenant.id)?;
        info!("Bound submitter {} to tenant {}", submitter.id, tenant.id);

        let stashed = self.bindings.take(submitter.id);
        let mut job_ids = Vec::with_capacity(stashed.len());
        for (index, item) in stashed.iter().enumerate() {
            match self.enqueue(tenant.id, submitter.id, &item.attachment, &item.message_id) {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) => {
                    // Keep what was not enqueued for the next attempt.
                    for rest in &stashed[index..] {
                        self.bindings.stash(submitter.id, rest.clone());
                    }
                    return Err(e);
                }
            }
        }

        self.notify(
            &submitter.chat_ref,
            &messages::bound(&tenant.name, job_ids.len()),
        )
        .await;
        Ok(IntakeOutcome::Bound {
            tenant_id: tenant.id,
            job_ids,
        })
    }

    fn enqueue(
        &self,
        tenant_id: i64,
        submitter_id: i64,
        attachment: &Attachment,
        message_id: &str,
    ) -> Result<i64, IntakeError> {
        let job = NewJob {
            tenant_id,
            submitter_id,
            attachment_ref: attachment.file_ref.clone(),
            attachment_kind: attachment.kind,
            mime_type: attachment.mime_type.clone(),
            file_ext: attachment.extension(),
            correlation_id: message_id.to_string(),
        };
        let job_id = job_repo::enqueue(&self.db, &job, self.max_attempts)?;
        info!(
            "Enqueued job {} for tenant {} ({})",
            job_id, tenant_id, job.mime_type
        );
        Ok(job_id)
    }

    async fn notify(&self, chat_ref: &str, text: &str) {
        if let Err(e) = self.messaging.send_message(chat_ref, text).await {
            warn!("Failed to send message to chat {}: {}", chat_ref, e);
        }
    }
}

fn is_start_command(text: &str) -> bool {
    text.split_whitespace()
        .next()
        .is_some_and(|cmd| cmd == messages::START_COMMAND || cmd.starts_with("/start@"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_command_detection() {
        assert!(is_start_command("/start"));
        assert!(is_start_command("  /start payload"));
        assert!(is_start_command("/start@contabot_bot"));
        assert!(!is_start_command("/stats"));
        assert!(!is_start_command("130-12345-6"));
        assert!(!is_start_command(""));
    }
}

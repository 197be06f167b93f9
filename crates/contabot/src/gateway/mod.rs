//! Narrow contracts to the external services the pipeline depends on.
//!
//! - [`MessagingGateway`]: attachment download and replies to submitters
//! - [`ExtractionGateway`]: document field extraction with a confidence score
//! - [`FileStorageGateway`]: per-tenant cloud upload returning a public link

pub mod drive;
pub mod extraction;
pub mod telegram;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::invoice::InvoiceFields;
use crate::worker::job::AttachmentKind;

pub use drive::{DriveConfig, DriveGateway};
pub use extraction::{HttpExtractionConfig, HttpExtractionGateway};
pub use telegram::TelegramGateway;

/// Errors raised by gateway implementations.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("{service} request failed: {source}")]
    Http {
        service: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{service} returned HTTP {status}: {body}")]
    Status {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned a malformed response: {reason}")]
    Decode {
        service: &'static str,
        reason: String,
    },

    #[error("{service} rejected the request: {description}")]
    Api {
        service: &'static str,
        description: String,
    },

    #[error("Failed to create HTTP client: {0}")]
    Client(#[source] reqwest::Error),
}

impl GatewayError {
    pub(crate) fn http(service: &'static str) -> impl FnOnce(reqwest::Error) -> Self {
        move |source| GatewayError::Http { service, source }
    }

    pub(crate) fn decode(service: &'static str, reason: impl ToString) -> Self {
        GatewayError::Decode {
            service,
            reason: reason.to_string(),
        }
    }
}

/// Messaging platform the submitters talk to.
#[async_trait]
pub trait MessagingGateway: Send + Sync {
    async fn download_attachment(&self, attachment_ref: &str) -> Result<Vec<u8>, GatewayError>;

    async fn send_message(&self, chat_ref: &str, text: &str) -> Result<(), GatewayError>;

    /// Re-sends a previously received photo by its platform handle.
    async fn send_photo(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError>;

    /// Re-sends a previously received document by its platform handle.
    async fn send_document(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError>;
}

/// Output of the extraction service. The default value (empty fields,
/// confidence 0) stands in when extraction fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractionResult {
    #[serde(flatten)]
    pub fields: InvoiceFields,
    #[serde(default)]
    pub confidence_score: f64,
}

/// Document extraction service. Implementations fail closed: non-2xx
/// responses and malformed bodies are errors, never partial results.
#[async_trait]
pub trait ExtractionGateway: Send + Sync {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, GatewayError>;
}

/// Per-tenant storage credentials, already decrypted.
#[derive(Debug, Clone)]
pub struct StorageCredentials {
    pub refresh_token: SecretString,
    pub folder_id: Option<String>,
}

/// Cloud file storage.
#[async_trait]
pub trait FileStorageGateway: Send + Sync {
    /// Uploads a file and returns a publicly readable URL.
    async fn upload(
        &self,
        credentials: &StorageCredentials,
        bytes: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) -> Result<String, GatewayError>;
}

/// An inbound message from a submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub chat_ref: String,
    pub submitter_external_id: String,
    pub username: Option<String>,
    pub display_name: Option<String>,
    /// Platform message id, used for dedupe and job correlation.
    pub message_id: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageContent {
    Text(String),
    Attachment(Attachment),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    /// Opaque platform file handle.
    pub file_ref: String,
    pub kind: AttachmentKind,
    pub mime_type: String,
    pub file_name: Option<String>,
}

impl Attachment {
    /// File extension from the original name, falling back to the MIME type.
    pub fn extension(&self) -> String {
        self.file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .filter(|ext| {
                !ext.is_empty() && ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric())
            })
            .unwrap_or_else(|| crate::worker::job::NewJob::extension_for_mime(&self.mime_type))
    }
}

/// Default connect timeout for gateway HTTP clients.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Creates an HTTP client with connect and whole-request timeouts.
pub(crate) fn create_http_client(request_timeout: Duration) -> Result<Client, GatewayError> {
    Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()
        .map_err(GatewayError::Client)
}

/// Maximum length of an error body kept in errors and logs.
const MAX_ERROR_BODY_LENGTH: usize = 200;

/// Truncates an error response body so tokens and large payloads stay out of
/// the logs.
pub(crate) fn truncate_error_body(body: &str) -> String {
    if body.len() > MAX_ERROR_BODY_LENGTH {
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated)", &body[..end])
    } else {
        body.to_string()
    }
}

/// Turns a non-2xx response into [`GatewayError::Status`].
pub(crate) async fn ensure_success(
    service: &'static str,
    response: reqwest::Response,
) -> Result<reqwest::Response, GatewayError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(GatewayError::Status {
        service,
        status,
        body: truncate_error_body(&body),
    })
}

//! Telegram Bot API implementation of [`MessagingGateway`].

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    create_http_client, ensure_success, Attachment, GatewayError, InboundMessage,
    MessageContent, MessagingGateway,
};
use crate::worker::job::AttachmentKind;

const SERVICE: &str = "telegram";

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    message_id: i64,
    chat: Chat,
    #[serde(default)]
    from: Option<User>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    photo: Vec<PhotoSize>,
    #[serde(default)]
    document: Option<Document>,
}

#[derive(Debug, Deserialize)]
struct Chat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct User {
    id: i64,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: Option<String>,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    #[serde(default)]
    file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct Document {
    file_id: String,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default)]
    mime_type: Option<String>,
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct SendPhoto<'a> {
    chat_id: &'a str,
    photo: &'a str,
    caption: &'a str,
}

#[derive(Serialize)]
struct SendDocument<'a> {
    chat_id: &'a str,
    document: &'a str,
    caption: &'a str,
}

/// A message and the update that carried it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Passing this as the offset fetches the update again.
    pub update_id: i64,
    pub message: InboundMessage,
}

/// Messages received by one `getUpdates` call.
#[derive(Debug, Default)]
pub struct UpdateBatch {
    /// Offset to pass to the next call; `None` when nothing arrived.
    pub next_offset: Option<i64>,
    pub deliveries: Vec<Delivery>,
}

/// Telegram bot client.
pub struct TelegramGateway {
    client: Client,
    token: SecretString,
    api_base: String,
}

impl TelegramGateway {
    pub fn new(token: SecretString, request_timeout: Duration) -> Result<Self, GatewayError> {
        Self::with_api_base(token, DEFAULT_API_BASE.to_string(), request_timeout)
    }

    pub fn with_api_base(
        token: SecretString,
        api_base: String,
        request_timeout: Duration,
    ) -> Result<Self, GatewayError> {
        Ok(Self {
            client: create_http_client(request_timeout)?,
            token,
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token.expose_secret(), method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!(
            "{}/file/bot{}/{}",
            self.api_base,
            self.token.expose_secret(),
            file_path
        )
    }

    /// Sends a request and unwraps the Bot API envelope. Request errors are
    /// stripped of their URL since it embeds the bot token.
    async fn call<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, GatewayError> {
        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::http(SERVICE)(e.without_url()))?;
        let response = ensure_success(SERVICE, response).await?;
        let envelope: ApiResponse<T> = response
            .json()
            .await
            .map_err(|e| GatewayError::decode(SERVICE, e.without_url()))?;

        match envelope {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse { description, .. } => Err(GatewayError::Api {
                service: SERVICE,
                description: description.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }

    /// Long-polls for new messages. `timeout` is the server-side wait.
    pub async fn get_updates(
        &self,
        offset: Option<i64>,
        timeout: Duration,
    ) -> Result<UpdateBatch, GatewayError> {
        let mut query: Vec<(&str, String)> = vec![
            ("timeout", timeout.as_secs().to_string()),
            ("allowed_updates", r#"["message"]"#.to_string()),
        ];
        if let Some(offset) = offset {
            query.push(("offset", offset.to_string()));
        }

        let request = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .timeout(timeout + Duration::from_secs(10));
        let updates: Vec<Update> = self.call(request).await?;

        let next_offset = updates.iter().map(|u| u.update_id + 1).max();
        let deliveries: Vec<Delivery> = updates.into_iter().filter_map(to_delivery).collect();
        debug!(
            "Received {} message(s) from Telegram, next offset {:?}",
            deliveries.len(),
            next_offset
        );

        Ok(UpdateBatch {
            next_offset,
            deliveries,
        })
    }
}

fn to_delivery(update: Update) -> Option<Delivery> {
    Some(Delivery {
        update_id: update.update_id,
        message: to_inbound(update.message?)?,
    })
}

/// Converts a Bot API message. Messages without a sender or usable content
/// (stickers, locations, …) are dropped.
fn to_inbound(message: Message) -> Option<InboundMessage> {
    let from = message.from?;

    let content = if let Some(photo) = message
        .photo
        .iter()
        .max_by_key(|p| p.file_size.unwrap_or(0))
    {
        MessageContent::Attachment(Attachment {
            file_ref: photo.file_id.clone(),
            kind: AttachmentKind::Photo,
            mime_type: "image/jpeg".to_string(),
            file_name: None,
        })
    } else if let Some(doc) = message.document {
        let mime_type = doc.mime_type.clone().unwrap_or_else(|| {
            doc.file_name
                .as_deref()
                .and_then(|name| mime_guess::from_path(name).first_raw())
                .unwrap_or("application/octet-stream")
                .to_string()
        });
        MessageContent::Attachment(Attachment {
            file_ref: doc.file_id,
            kind: AttachmentKind::Document,
            mime_type,
            file_name: doc.file_name,
        })
    } else {
        MessageContent::Text(message.text?)
    };

    let display_name = match (from.first_name, from.last_name) {
        (Some(first), Some(last)) => Some(format!("{} {}", first, last)),
        (first, last) => first.or(last),
    };

    Some(InboundMessage {
        chat_ref: message.chat.id.to_string(),
        submitter_external_id: from.id.to_string(),
        username: from.username,
        display_name,
        message_id: message.message_id.to_string(),
        content,
    })
}

#[async_trait]
impl MessagingGateway for TelegramGateway {
    async fn download_attachment(&self, attachment_ref: &str) -> Result<Vec<u8>, GatewayError> {
        let request = self
            .client
            .get(self.method_url("getFile"))
            .query(&[("file_id", attachment_ref)]);
        let file: File = self.call(request).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| GatewayError::decode(SERVICE, "getFile returned no file_path"))?;

        let response = self
            .client
            .get(self.file_url(&file_path))
            .send()
            .await
            .map_err(|e| GatewayError::http(SERVICE)(e.without_url()))?;
        let response = ensure_success(SERVICE, response).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|e| GatewayError::http(SERVICE)(e.without_url()))?;
        Ok(bytes.to_vec())
    }

    async fn send_message(&self, chat_ref: &str, text: &str) -> Result<(), GatewayError> {
        let request = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&SendMessage {
                chat_id: chat_ref,
                text,
            });
        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }

    async fn send_photo(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError> {
        let request = self
            .client
            .post(self.method_url("sendPhoto"))
            .json(&SendPhoto {
                chat_id: chat_ref,
                photo: file_ref,
                caption,
            });
        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }

    async fn send_document(
        &self,
        chat_ref: &str,
        file_ref: &str,
        caption: &str,
    ) -> Result<(), GatewayError> {
        let request = self
            .client
            .post(self.method_url("sendDocument"))
            .json(&SendDocument {
                chat_id: chat_ref,
                document: file_ref,
                caption,
            });
        let _: serde_json::Value = self.call(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_deliveries(json: &str) -> Vec<Delivery> {
        let envelope: ApiResponse<Vec<Update>> = serde_json::from_str(json).unwrap();
        envelope
            .result
            .unwrap()
            .into_iter()
            .filter_map(to_delivery)
            .collect()
    }

    fn parse_updates(json: &str) -> Vec<InboundMessage> {
        parse_deliveries(json).into_iter().map(|d| d.message).collect()
    }

    #[test]
    fn test_photo_message_uses_largest_size() {
        let messages = parse_updates(
            r#"{"ok": true, "result": [{"update_id": 10, "message": {
                "message_id": 77, "chat": {"id": -100},
                "from": {"id": 5, "username": "ana", "first_name": "Ana", "last_name": "Pérez"},
                "photo": [{"file_id": "small", "file_size": 100}, {"file_id": "big", "file_size": 9000}]
            }}]}"#,
        );
        assert_eq!(messages.len(), 1);
        let msg = &messages[0];
        assert_eq!(msg.chat_ref, "-100");
        assert_eq!(msg.submitter_external_id, "5");
        assert_eq!(msg.message_id, "77");
        assert_eq!(msg.display_name.as_deref(), Some("Ana Pérez"));
        match &msg.content {
            MessageContent::Attachment(a) => {
                assert_eq!(a.file_ref, "big");
                assert_eq!(a.kind, AttachmentKind::Photo);
                assert_eq!(a.mime_type, "image/jpeg");
            }
            other => panic!("expected attachment, got {:?}", other),
        }
    }

    #[test]
    fn test_document_mime_falls_back_to_file_name() {
        let messages = parse_updates(
            r#"{"ok": true, "result": [{"update_id": 11, "message": {
                "message_id": 78, "chat": {"id": 5}, "from": {"id": 5},
                "document": {"file_id": "doc", "file_name": "factura.pdf"}
            }}]}"#,
        );
        match &messages[0].content {
            MessageContent::Attachment(a) => {
                assert_eq!(a.kind, AttachmentKind::Document);
                assert_eq!(a.mime_type, "application/pdf");
                assert_eq!(a.extension(), "pdf");
            }
            other => panic!("expected attachment, got {:?}", other),
        }
    }

    #[test]
    fn test_text_and_unsupported_messages() {
        let deliveries = parse_deliveries(
            r#"{"ok": true, "result": [
                {"update_id": 12, "message": {"message_id": 1, "chat": {"id": 5}, "from": {"id": 5}, "text": "130-12345-6"}},
                {"update_id": 13, "message": {"message_id": 2, "chat": {"id": 5}, "from": {"id": 5}}},
                {"update_id": 14}
            ]}"#,
        );
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].update_id, 12);
        assert_eq!(
            deliveries[0].message.content,
            MessageContent::Text("130-12345-6".to_string())
        );
    }

    #[test]
    fn test_error_envelope() {
        let envelope: ApiResponse<Vec<Update>> = serde_json::from_str(
            r#"{"ok": false, "error_code": 401, "description": "Unauthorized"}"#,
        )
        .unwrap();
        assert!(!envelope.ok);
        assert!(envelope.result.is_none());
        assert_eq!(envelope.description.as_deref(), Some("Unauthorized"));
    }

    #[test]
    fn test_urls_embed_token() {
        let gateway = TelegramGateway::with_api_base(
            SecretString::from("123:abc".to_string()),
            "http://localhost:8081/".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            gateway.method_url("getMe"),
            "http://localhost:8081/bot123:abc/getMe"
        );
        assert_eq!(
            gateway.file_url("photos/file_1.jpg"),
            "http://localhost:8081/file/bot123:abc/photos/file_1.jpg"
        );
    }
}

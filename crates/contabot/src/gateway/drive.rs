//! Google Drive implementation of [`FileStorageGateway`].
//!
//! Each upload exchanges the tenant's refresh token for an access token,
//! creates the file with a `multipart/related` upload, then grants
//! anyone-with-the-link read access so reviewers can open it.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{
    create_http_client, ensure_success, FileStorageGateway, GatewayError, StorageCredentials,
};

const SERVICE: &str = "drive";

pub const DEFAULT_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

/// OAuth client and endpoint settings.
#[derive(Debug, Clone)]
pub struct DriveConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub token_url: String,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl DriveConfig {
    pub fn new(client_id: String, client_secret: SecretString, request_timeout: Duration) -> Self {
        Self {
            client_id,
            client_secret,
            token_url: DEFAULT_TOKEN_URL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            request_timeout,
        }
    }
}

/// Response from the token endpoint.
#[derive(Debug, Clone, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FileMetadata<'a> {
    name: &'a str,
    mime_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<&'a str>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedFile {
    id: String,
    #[serde(default)]
    web_view_link: Option<String>,
}

#[derive(Serialize)]
struct Permission {
    role: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
}

pub struct DriveGateway {
    client: Client,
    config: DriveConfig,
}

impl DriveGateway {
    pub fn new(config: DriveConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            client: create_http_client(config.request_timeout)?,
            config,
        })
    }

    async fn refresh_access_token(
        &self,
        refresh_token: &SecretString,
    ) -> Result<SecretString, GatewayError> {
        let params = [
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.expose_secret()),
            ("refresh_token", refresh_token.expose_secret()),
            ("grant_type", "refresh_token"),
        ];

        let response = self
            .client
            .post(&self.config.token_url)
            .form(&params)
            .send()
            .await
            .map_err(GatewayError::http(SERVICE))?;
        let response = ensure_success(SERVICE, response).await?;
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::decode(SERVICE, format!("token response: {}", e)))?;

        debug!("Refreshed Drive access token (expires in {:?}s)", token.expires_in);
        Ok(SecretString::from(token.access_token))
    }

    async fn grant_public_read(
        &self,
        access_token: &SecretString,
        file_id: &str,
    ) -> Result<(), GatewayError> {
        let url = format!(
            "{}/drive/v3/files/{}/permissions",
            self.config.api_base, file_id
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token.expose_secret())
            .json(&Permission {
                role: "reader",
                kind: "anyone",
            })
            .send()
            .await
            .map_err(GatewayError::http(SERVICE))?;
        ensure_success(SERVICE, response).await?;
        Ok(())
    }
}

/// Builds a `multipart/related` body: JSON metadata part, then the file.
fn multipart_related(metadata: &[u8], bytes: &[u8], mime_type: &str, boundary: &str) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + bytes.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", mime_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    body
}

fn view_link(file: &CreatedFile) -> String {
    file.web_view_link
        .clone()
        .unwrap_or_else(|| format!("https://drive.google.com/file/d/{}/view", file.id))
}

#[async_trait]
impl FileStorageGateway for DriveGateway {
    async fn upload(
        &self,
        credentials: &StorageCredentials,
        bytes: Vec<u8>,
        name: &str,
        mime_type: &str,
    ) -> Result<String, GatewayError> {
        let access_token = self.refresh_access_token(&credentials.refresh_token).await?;

        let metadata = serde_json::to_vec(&FileMetadata {
            name,
            mime_type,
            parents: credentials.folder_id.as_deref().map(|f| vec![f]),
        })
        .map_err(|e| GatewayError::decode(SERVICE, e))?;
        let boundary = format!("contabot-{}", chrono::Utc::now().timestamp_micros());
        let body = multipart_related(&metadata, &bytes, mime_type, &boundary);

        let url = format!(
            "{}/upload/drive/v3/files?uploadType=multipart&fields=id,webViewLink",
            self.config.api_base
        );
        let response = self
            .client
            .post(url)
            .bearer_auth(access_token.expose_secret())
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .body(body)
            .send()
            .await
            .map_err(GatewayError::http(SERVICE))?;
        let response = ensure_success(SERVICE, response).await?;
        let file: CreatedFile = response
            .json()
            .await
            .map_err(|e| GatewayError::decode(SERVICE, e))?;

        self.grant_public_read(&access_token, &file.id).await?;

        info!("Uploaded {} ({} bytes) to Drive as {}", name, bytes.len(), file.id);
        Ok(view_link(&file))
    }
}

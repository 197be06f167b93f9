//! HTTP JSON client for the document extraction service.
//!
//! The image is posted base64-encoded; the service answers with the
//! extracted fields and a `confidenceScore` between 0 and 100.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use log::debug;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

use super::{
    create_http_client, ensure_success, ExtractionGateway, ExtractionResult, GatewayError,
};
use crate::invoice::clamp_confidence;

const SERVICE: &str = "extraction";

/// Connection settings for [`HttpExtractionGateway`].
#[derive(Debug, Clone)]
pub struct HttpExtractionConfig {
    pub endpoint: String,
    pub api_key: SecretString,
    /// Optional model hint forwarded to the service.
    pub model: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionRequest<'a> {
    mime_type: &'a str,
    data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
}

pub struct HttpExtractionGateway {
    client: Client,
    config: HttpExtractionConfig,
}

impl HttpExtractionGateway {
    pub fn new(config: HttpExtractionConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            client: create_http_client(config.request_timeout)?,
            config,
        })
    }
}

/// Parses a response body. Anything that is not a JSON object with the
/// expected shape is an error.
pub(crate) fn parse_extraction(body: &[u8]) -> Result<ExtractionResult, GatewayError> {
    let value: serde_json::Value =
        serde_json::from_slice(body).map_err(|e| GatewayError::decode(SERVICE, e))?;
    if !value.is_object() {
        return Err(GatewayError::decode(SERVICE, "expected a JSON object"));
    }
    let mut result: ExtractionResult =
        serde_json::from_value(value).map_err(|e| GatewayError::decode(SERVICE, e))?;
    result.confidence_score = clamp_confidence(result.confidence_score);
    Ok(result)
}

#[async_trait]
impl ExtractionGateway for HttpExtractionGateway {
    async fn extract(&self, bytes: &[u8], mime_type: &str) -> Result<ExtractionResult, GatewayError> {
        let request = ExtractionRequest {
            mime_type,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
            model: self.config.model.as_deref(),
        };

        let response = self
            .client
            .post(&self.config.endpoint)
            .bearer_auth(self.config.api_key.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(GatewayError::http(SERVICE))?;
        let response = ensure_success(SERVICE, response).await?;
        let body = response.bytes().await.map_err(GatewayError::http(SERVICE))?;

        let result = parse_extraction(&body)?;
        debug!(
            "Extraction returned confidence {:.1} for {} bytes of {}",
            result.confidence_score,
            bytes.len(),
            mime_type
        );
        Ok(result)
    }
}

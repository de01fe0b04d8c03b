//! Backend client for Ollama.
//!
//! Generation calls go through a client with a long timeout; listing and
//! health checks use a separate client with a short one. Both share nothing
//! but the base URL.

use std::pin::Pin;
use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, Method};
use bytes::Bytes;
use futures::Stream;
use reqwest::{Client, Response};
use tracing::{debug, error, info, instrument};

use crate::error::ProxyError;
use crate::types::ollama::TagsResponse;

/// Type alias for streaming response
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Headers that describe a single connection and are never forwarded.
const HOP_BY_HOP: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    header::HOST,
    header::CONTENT_LENGTH,
];

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || name.as_str() == "keep-alive"
}

/// Copy of `headers` without hop-by-hop entries.
pub fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Ollama proxy client
#[derive(Clone)]
pub struct OllamaProxy {
    /// Client for generation calls
    client: Client,
    /// Client for list and health calls
    short_client: Client,
    /// Ollama base URL, without trailing slash
    base_url: String,
}

impl OllamaProxy {
    pub fn new(
        base_url: impl Into<String>,
        generation_timeout: Duration,
        list_timeout: Duration,
    ) -> Result<Self, ProxyError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, "Creating Ollama proxy");

        let build = |timeout: Duration| {
            Client::builder()
                .timeout(timeout)
                .build()
                .map_err(|e| ProxyError::Internal(format!("Failed to create HTTP client: {}", e)))
        };

        Ok(Self { client: build(generation_timeout)?, short_client: build(list_timeout)?, base_url })
    }

    /// Get the Ollama base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Check if Ollama is available
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), ProxyError> {
        let url = self.url("/api/tags");
        debug!(url = %url, "Checking Ollama health");

        match self.short_client.get(&url).send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => {
                let status = response.status().as_u16();
                let body = response.text().await.unwrap_or_default();
                error!(status, body = %body, "Ollama returned error");
                Err(ProxyError::BackendStatus { status, body })
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to Ollama");
                Err(ProxyError::from(e))
            }
        }
    }

    /// List available models
    #[instrument(skip(self))]
    pub async fn list_models(&self) -> Result<TagsResponse, ProxyError> {
        let url = self.url("/api/tags");
        debug!(url = %url, "Listing models");

        let response = check_status(self.short_client.get(&url).send().await?).await?;
        let body = response.bytes().await?;
        let tags: TagsResponse = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::ParseResponse(e.to_string()))?;

        debug!(count = tags.models.len(), "Found models");
        Ok(tags)
    }

    /// POST a JSON body to a generation endpoint.
    ///
    /// Resolves once the response head arrives; non-2xx statuses are errors.
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn post(&self, path: &str, body: Bytes) -> Result<Response, ProxyError> {
        let url = self.url(path);
        debug!(url = %url, "Sending generation request");

        let response = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        check_status(response).await
    }

    /// Forward an arbitrary request. The backend status is returned as-is.
    #[instrument(skip(self, headers, body))]
    pub async fn forward(
        &self,
        method: Method,
        path_and_query: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Response, ProxyError> {
        let url = self.url(path_and_query);
        debug!(url = %url, method = %method, "Forwarding raw request");

        let response = self
            .client
            .request(method, &url)
            .headers(forwardable_headers(headers))
            .body(body)
            .send()
            .await?;

        Ok(response)
    }
}

/// The response body as a stream of byte chunks.
pub fn into_byte_stream(response: Response) -> ByteStream {
    Box::pin(response.bytes_stream())
}

async fn check_status(response: Response) -> Result<Response, ProxyError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    error!(status = %status, body = %body, "Ollama returned error");
    Err(ProxyError::BackendStatus { status: status.as_u16(), body })
}

//! cachepool Client - Namespace service over HTTP
//!
//! Routes, relative to the configured base URL:
//! - `GET    /files/{id}`: attributes as JSON, 404 when unknown
//! - `PUT    /files/{id}/attributes`: record size and add a location
//! - `DELETE /files/{id}/locations/{pool}`: drop a location

use async_trait::async_trait;
use cachepool_common::config::NamespaceConfig;
use cachepool_common::{Error, FileId, Result};
use cachepool_repository::{AttributeUpdate, NamespaceAttributes, NamespaceClient};
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Namespace client talking JSON over HTTP
pub struct HttpNamespaceClient {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpNamespaceClient {
    /// Create a client for the namespace at `url`
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        Ok(Self {
            base_url: url.into().trim_end_matches('/').to_string(),
            http_client,
        })
    }

    pub fn from_config(config: &NamespaceConfig) -> Result<Self> {
        Self::new(&config.url, Duration::from_millis(config.timeout_ms))
    }

    /// Base URL without trailing slash
    pub fn url(&self) -> &str {
        &self.base_url
    }

    fn file_url(&self, id: &FileId) -> String {
        format!("{}/files/{}", self.base_url, id)
    }
}

fn transport_error(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout
    } else if e.is_connect() {
        Error::ConnectionFailed(e.to_string())
    } else {
        Error::ServiceUnavailable(e.to_string())
    }
}

async fn status_error(response: Response, action: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Error::ServiceUnavailable(format!(
        "namespace {} failed with status {}: {}",
        action, status, body
    ))
}

#[async_trait]
impl NamespaceClient for HttpNamespaceClient {
    async fn get_attributes(&self, id: &FileId) -> Result<NamespaceAttributes> {
        let response = self
            .http_client
            .get(self.file_url(id))
            .send()
            .await
            .map_err(transport_error)?;

        if response.status() == StatusCode::NOT_FOUND {
            debug!("Namespace has no entry for {}", id);
            return Err(Error::FileNotFound(id.clone()));
        }
        if !response.status().is_success() {
            return Err(status_error(response, "lookup").await);
        }

        let body = response.text().await.map_err(transport_error)?;
        serde_json::from_str(&body).map_err(|e| {
            Error::Deserialization(format!("invalid attributes for {}: {}", id, e))
        })
    }

    async fn set_attributes(&self, id: &FileId, update: &AttributeUpdate) -> Result<()> {
        let url = format!("{}/attributes", self.file_url(id));
        let response = self
            .http_client
            .put(&url)
            .json(update)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(Error::FileNotFound(id.clone())),
            status if status.is_success() => {
                debug!("Registered {} at {} ({} bytes)", id, update.location, update.size);
                Ok(())
            }
            _ => Err(status_error(response, "update").await),
        }
    }

    async fn clear_location(&self, id: &FileId, pool: &str) -> Result<()> {
        let url = format!("{}/locations/{}", self.file_url(id), pool);
        let response = self
            .http_client
            .delete(&url)
            .send()
            .await
            .map_err(transport_error)?;

        // Already gone is fine
        if response.status() == StatusCode::NOT_FOUND || response.status().is_success() {
            debug!("Cleared location {} for {}", pool, id);
            return Ok(());
        }
        Err(status_error(response, "location removal").await)
    }
}

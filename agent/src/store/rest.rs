//! REST client for the document API

use std::time::Duration;

use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, error};

use crate::errors::AgentError;
use crate::store::DocRef;

/// HTTP client for `GET`/`PATCH` on `{base_url}/{collection}/{id}`
pub struct RestStore {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl RestStore {
    /// Create a new REST client
    pub fn new(base_url: &str, api_key: Option<SecretString>) -> Result<Self, AgentError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, doc: &DocRef) -> String {
        format!("{}/{}/{}", self.base_url, doc.collection.as_str(), doc.id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    /// Read a document, `None` on 404
    pub async fn get_document(&self, doc: &DocRef) -> Result<Option<Value>, AgentError> {
        let url = self.url(doc);
        debug!("GET {}", url);

        let response = self.authorize(self.client.get(&url)).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP GET failed: {} - {}", status, body);
            return Err(AgentError::StoreError(format!("GET {doc}: {status}: {body}")));
        }

        let body = response.json().await?;
        Ok(Some(body))
    }

    /// Overwrite fields of a document
    pub async fn patch_document(&self, doc: &DocRef, fields: &Value) -> Result<(), AgentError> {
        let url = self.url(doc);
        debug!("PATCH {}", url);

        let response = self
            .authorize(self.client.patch(&url))
            .json(fields)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(AgentError::NotFound(doc.to_string()));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("HTTP PATCH failed: {} - {}", status, body);
            return Err(AgentError::StoreError(format!("PATCH {doc}: {status}: {body}")));
        }

        Ok(())
    }
}

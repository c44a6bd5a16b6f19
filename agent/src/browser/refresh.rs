//! Display page reload over the browser remote-debugging protocol
//!
//! The kiosk browser exposes its debugger on a local port. The page list is
//! served over HTTP at `/json`; each page has a WebSocket endpoint accepting
//! protocol commands such as `Page.reload`.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info};

use crate::errors::AgentError;
use crate::sync::PageRefresher;
use crate::utils::{retry_with_delay, RetryOptions};

/// Refresh client options
#[derive(Debug, Clone)]
pub struct Options {
    /// Base URL of the debugger HTTP endpoint
    pub debugger_url: String,

    /// Substring identifying the display page among open pages
    pub page_url_match: String,

    /// Attempts and spacing of the whole refresh
    pub retry: RetryOptions,

    /// Time allowed for one connect, send and reply exchange
    pub response_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            debugger_url: "http://localhost:9222".to_string(),
            page_url_match: "localhost:5000".to_string(),
            retry: RetryOptions::default(),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// One entry of the debugger page list
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageDescriptor {
    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

/// Reloads the display page after content changes
pub struct BrowserRefreshClient {
    http: reqwest::Client,
    options: Options,
}

impl BrowserRefreshClient {
    pub fn new(options: Options) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .timeout(options.response_timeout)
            .build()?;
        Ok(Self { http, options })
    }

    /// Pages currently open in the browser
    pub async fn list_pages(&self) -> Result<Vec<PageDescriptor>, AgentError> {
        let url = format!("{}/json", self.options.debugger_url.trim_end_matches('/'));
        let response = self.http.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(AgentError::RefreshError(format!(
                "page list request returned {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    /// First page serving the display that accepts debugger connections
    pub fn select_page<'a>(&self, pages: &'a [PageDescriptor]) -> Option<&'a PageDescriptor> {
        pages.iter().find(|page| {
            page.web_socket_debugger_url.is_some() && page.url.contains(&self.options.page_url_match)
        })
    }

    async fn reload_once(&self) -> Result<(), AgentError> {
        let pages = self.list_pages().await?;
        let page = self.select_page(&pages).ok_or_else(|| {
            AgentError::RefreshError(format!(
                "no page matching {} among {} pages",
                self.options.page_url_match,
                pages.len()
            ))
        })?;
        let ws_url = page.web_socket_debugger_url.as_deref().unwrap_or_default();

        debug!("Reloading {} through {}", page.url, ws_url);
        tokio::time::timeout(self.options.response_timeout, send_reload(ws_url))
            .await
            .map_err(|_| {
                AgentError::RefreshError(format!(
                    "no reply within {:?}",
                    self.options.response_timeout
                ))
            })?
    }
}

async fn send_reload(ws_url: &str) -> Result<(), AgentError> {
    let (mut socket, _) = connect_async(ws_url)
        .await
        .map_err(|e| AgentError::RefreshError(format!("connect to {ws_url} failed: {e}")))?;

    let command = json!({
        "id": 1,
        "method": "Page.reload",
        "params": { "ignoreCache": true },
    });
    socket
        .send(Message::Text(command.to_string().into()))
        .await
        .map_err(|e| AgentError::RefreshError(e.to_string()))?;

    let reply = loop {
        match socket.next().await {
            Some(Ok(Message::Text(_))) | Some(Ok(Message::Binary(_))) => break Ok(()),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            Some(Ok(_)) | None => {
                break Err(AgentError::RefreshError(
                    "connection closed before reply".to_string(),
                ))
            }
            Some(Err(e)) => break Err(AgentError::RefreshError(e.to_string())),
        }
    };

    let _ = socket.close(None).await;
    reply
}

#[async_trait]
impl PageRefresher for BrowserRefreshClient {
    async fn refresh(&self) -> Result<(), AgentError> {
        retry_with_delay(&self.options.retry, "Browser refresh", |attempt| {
            debug!("Browser refresh attempt {}", attempt);
            self.reload_once()
        })
        .await
        .map_err(|e| match e {
            AgentError::RefreshError(_) => e,
            other => AgentError::RefreshError(other.to_string()),
        })?;

        info!("Browser refresh successful");
        Ok(())
    }
}

//! Blob downloads

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::AgentError;

/// Streaming download of a media asset
#[async_trait]
pub trait BlobFetcher: Send + Sync {
    /// Write the body of `url` to `dest`, returning the number of bytes written
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, AgentError>;
}

/// [`BlobFetcher`] over plain HTTP(S)
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    /// Create a new fetcher. Only connecting is bounded in time: media files
    /// can be large and slow links must still complete.
    pub fn new(connect_timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl BlobFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64, AgentError> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(AgentError::DownloadError(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }

        let mut file = fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.sync_all().await?;
        Ok(written)
    }
}

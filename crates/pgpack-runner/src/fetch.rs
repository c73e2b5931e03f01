//! Source archive download.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::{RunnerError, RunnerResult};

/// Downloads a remote file to a local path.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch `url` into `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> RunnerResult<u64>;
}

/// HTTP(S) fetcher backed by reqwest.
#[derive(Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> RunnerResult<u64> {
        let fetch_error = |message: String| RunnerError::Fetch {
            url: url.to_string(),
            message,
        };

        let mut response = self
            .client
            .get(url)
            .header("User-Agent", "pgpack")
            .send()
            .await
            .map_err(|e| fetch_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(fetch_error(format!("HTTP {}", status)));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| fetch_error(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        info!(url = %url, dest = %dest.display(), bytes = written, "Downloaded source archive");
        Ok(written)
    }
}

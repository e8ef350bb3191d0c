//! Single-resource fetcher
//!
//! Streams one HTTP resource into one local file, reporting every received chunk to
//! a progress tracker. Reads race against the attempt's cancellation token.

use crate::error::{Error, Result};
use crate::progress::SharedTracker;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// HTTP fetcher sharing one connection pool
#[derive(Clone, Debug)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    /// Fetcher over an existing client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get(&self, url: &str, cancel: &CancellationToken) -> Result<reqwest::Response> {
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.client.get(url).send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response)
    }

    /// Fetch a small text resource (manifests)
    pub async fn fetch_text(&self, url: &str, cancel: &CancellationToken) -> Result<String> {
        let response = self.get(url, cancel).await?;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            text = response.text() => Ok(text?),
        }
    }

    /// Stream `url` into `path` as one fragment of `tracker`
    ///
    /// Opens a fragment on the tracker (with the declared Content-Length, if any),
    /// records each chunk as it arrives and closes the fragment once the body is
    /// complete. Returns the number of bytes written.
    pub async fn fetch_to_file(
        &self,
        url: &str,
        path: &Path,
        tracker: &SharedTracker,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let mut response = self.get(url, cancel).await?;
        tracker.lock().begin_fragment(response.content_length());

        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| Error::scratch(path, e))?;
        let mut written: u64 = 0;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                chunk = response.chunk() => chunk?,
            };
            let Some(chunk) = chunk else {
                break;
            };
            file.write_all(&chunk)
                .await
                .map_err(|e| Error::scratch(path, e))?;
            written += chunk.len() as u64;
            tracker.lock().record(chunk.len() as u64);
        }

        file.flush().await.map_err(|e| Error::scratch(path, e))?;
        tracker.lock().complete_fragment();
        tracing::debug!(url, bytes = written, "Fetched resource");
        Ok(written)
    }
}

//! Download transport: fetch a URL to a local path while reporting progress.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::vm::progress::ProgressReporter;

/// Streaming byte transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write the body of `url` to `destination` and return the byte count.
    ///
    /// `expected` is the size advertised out of band; implementations prefer
    /// the size the server reports. Cleanup of `destination` on failure is the
    /// caller's job.
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        expected: Option<u64>,
        progress: &mut ProgressReporter,
    ) -> Result<u64>;
}

/// HTTP(S) transport built on reqwest.
///
/// Only the connection phase has a timeout; restore images are many
/// gigabytes and take as long as they take.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("macvm/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build download HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(
        &self,
        url: &Url,
        destination: &Path,
        expected: Option<u64>,
        progress: &mut ProgressReporter,
    ) -> Result<u64> {
        info!(%url, destination = %destination.display(), "downloading");

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("GET {url}"))?;

        if !response.status().is_success() {
            bail!("download failed with status {}: {url}", response.status());
        }

        let total = response.content_length().or(expected);
        let mut file = tokio::fs::File::create(destination)
            .await
            .with_context(|| format!("create {}", destination.display()))?;

        let mut written: u64 = 0;
        let mut stream = response.bytes_stream();
        progress.report(0.0);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context("read response body")?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", destination.display()))?;
            written += chunk.len() as u64;
            progress.report_bytes(written, total);
        }

        file.flush().await.context("flush download")?;
        file.sync_all().await.context("sync download")?;

        if let Some(total) = total {
            if written != total {
                bail!("short download: received {written} of {total} bytes");
            }
        }

        debug!(bytes = written, "download finished");
        Ok(written)
    }
}

//! Transport primitive: fetch bytes or stream a URL to a local path.
//!
//! The engine only talks to the network through the [`Transport`] trait so
//! tests can substitute an in-memory implementation. [`HttpTransport`] is the
//! production implementation:
//! - reqwest async client with a shared connection pool
//! - `file://` URLs served from the local filesystem
//! - downloads written to a `.part` sibling and renamed on success
//! - cancellation aborts in-flight transfers and removes partial files

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::cancel::CancelScope;
use crate::error::{UpdateError, UpdateResult};
use crate::layout;
use crate::progress::TransferCallback;

/// Default timeout for HTTP requests in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 300; // 5 minutes

/// Buffer size for reading/writing local transfers (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Abstraction over fetching remote content.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Fetch the whole body of `url` into memory.
    async fn fetch_bytes(&self, url: &str, cancel: &CancelScope) -> UpdateResult<Vec<u8>>;

    /// Stream `url` into `dest`, reporting byte progress.
    ///
    /// Returns the number of bytes written. On failure no file is left at
    /// `dest`.
    async fn fetch_to_path(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64>;
}

/// Fetch `url` as trimmed UTF-8 text.
pub async fn fetch_text(
    transport: &dyn Transport,
    url: &str,
    cancel: &CancelScope,
) -> UpdateResult<String> {
    let bytes = transport.fetch_bytes(url, cancel).await?;
    String::from_utf8(bytes)
        .map(|s| s.trim().to_string())
        .map_err(|e| UpdateError::Transport {
            url: url.to_string(),
            status: None,
            reason: format!("response is not UTF-8: {}", e),
        })
}

/// Path of the in-progress sibling of `dest`.
pub fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// HTTP (and `file://`) transport backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    timeout: Duration,
}

impl HttpTransport {
    /// Create a transport with the default timeout.
    pub fn new() -> UpdateResult<Self> {
        Self::with_timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    /// Create a transport with a custom request timeout.
    pub fn with_timeout(timeout: Duration) -> UpdateResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("diffpatcher/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UpdateError::InvalidConfig(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    /// Wrap an existing reqwest client.
    pub fn with_client(client: Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    /// The configured request timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn map_error(&self, url: &str, e: reqwest::Error) -> UpdateError {
        if e.is_timeout() {
            UpdateError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout.as_secs(),
            }
        } else {
            UpdateError::Transport {
                url: url.to_string(),
                status: e.status().map(|s| s.as_u16()),
                reason: e.to_string(),
            }
        }
    }

    async fn get(&self, url: &str) -> UpdateResult<reqwest::Response> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| self.map_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UpdateError::Transport {
                url: url.to_string(),
                status: Some(status.as_u16()),
                reason: format!("GET request failed with status {}", status),
            });
        }
        Ok(response)
    }

    async fn stream_http(
        &self,
        url: &str,
        part: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        let mut response = cancel.guard(self.get(url)).await?;
        let total = response.content_length();

        let file = File::create(part)
            .await
            .map_err(|e| UpdateError::write(part, e))?;
        let mut writer = BufWriter::new(file);
        let mut downloaded = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancel.error()),
                chunk = response.chunk() => chunk.map_err(|e| self.map_error(url, e))?,
            };
            let Some(chunk) = chunk else { break };

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| UpdateError::write(part, e))?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }

        writer
            .flush()
            .await
            .map_err(|e| UpdateError::write(part, e))?;
        Ok(downloaded)
    }

    async fn stream_local(
        &self,
        source: &Path,
        part: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        let mut input = File::open(source)
            .await
            .map_err(|e| local_error(source, e))?;
        let total = input.metadata().await.ok().map(|m| m.len());

        let file = File::create(part)
            .await
            .map_err(|e| UpdateError::write(part, e))?;
        let mut writer = BufWriter::new(file);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        let mut copied = 0u64;

        loop {
            cancel.check()?;
            let bytes_read = input
                .read(&mut buffer)
                .await
                .map_err(|e| UpdateError::read(source, e))?;
            if bytes_read == 0 {
                break;
            }
            writer
                .write_all(&buffer[..bytes_read])
                .await
                .map_err(|e| UpdateError::write(part, e))?;
            copied += bytes_read as u64;
            on_progress(copied, total);
        }

        writer
            .flush()
            .await
            .map_err(|e| UpdateError::write(part, e))?;
        Ok(copied)
    }
}

/// Map a local read error onto the transport taxonomy so a missing
/// `file://` artifact behaves like an HTTP 404.
fn local_error(path: &Path, e: std::io::Error) -> UpdateError {
    let status = (e.kind() == std::io::ErrorKind::NotFound).then_some(404);
    UpdateError::Transport {
        url: layout::file_url(path),
        status,
        reason: e.to_string(),
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch_bytes(&self, url: &str, cancel: &CancelScope) -> UpdateResult<Vec<u8>> {
        cancel.check()?;

        if let Some(path) = layout::local_path(url) {
            return cancel
                .guard(async { fs::read(&path).await.map_err(|e| local_error(&path, e)) })
                .await;
        }

        cancel
            .guard(async {
                let response = self.get(url).await?;
                let bytes = response.bytes().await.map_err(|e| self.map_error(url, e))?;
                Ok(bytes.to_vec())
            })
            .await
    }

    async fn fetch_to_path(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        cancel.check()?;

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| UpdateError::create_dir(parent, e))?;
        }

        let part = part_path(dest);
        let result = match layout::local_path(url) {
            Some(source) => self.stream_local(&source, &part, on_progress, cancel).await,
            None => self.stream_http(url, &part, on_progress, cancel).await,
        };

        match result {
            Ok(bytes) => {
                fs::rename(&part, dest)
                    .await
                    .map_err(|e| UpdateError::write(dest, e))?;
                debug!(url = %url, dest = %dest.display(), bytes, "Transfer complete");
                Ok(bytes)
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }
}

//! In-memory transport used by unit tests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::cancel::CancelScope;
use crate::error::{UpdateError, UpdateResult};
use crate::progress::TransferCallback;
use crate::transport::{part_path, Transport};

/// Chunk size used when streaming mock content.
const CHUNK_SIZE: usize = 16 * 1024;

/// Transport serving canned responses keyed by URL.
///
/// Unknown URLs answer with a 404 transport error. URLs starting with a
/// prefix registered through [`MockTransport::with_delay`] wait before
/// sending their first byte.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    delays: Arc<Mutex<Vec<(String, Duration)>>>,
    requests: Arc<Mutex<Vec<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, url: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(url, data);
        self
    }

    pub fn with_delay(self, prefix: impl Into<String>, delay: Duration) -> Self {
        self.delays.lock().push((prefix.into(), delay));
        self
    }

    pub fn insert(&self, url: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.lock().insert(url.into(), data.into());
    }

    pub fn request_log(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.requests)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn delay_for(&self, url: &str) -> Option<Duration> {
        self.delays
            .lock()
            .iter()
            .find(|(prefix, _)| url.starts_with(prefix.as_str()))
            .map(|(_, d)| *d)
    }

    fn lookup(&self, url: &str) -> UpdateResult<Vec<u8>> {
        self.files
            .lock()
            .get(url)
            .cloned()
            .ok_or_else(|| UpdateError::Transport {
                url: url.to_string(),
                status: Some(404),
                reason: "HTTP 404 Not Found".to_string(),
            })
    }

    async fn wait(&self, url: &str, cancel: &CancelScope) -> UpdateResult<()> {
        if let Some(delay) = self.delay_for(url) {
            cancel
                .guard(async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
        }
        Ok(())
    }

    async fn stream(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        self.wait(url, cancel).await?;
        let data = self.lookup(url)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| UpdateError::create_dir(parent, e))?;
        }

        let part = part_path(dest);
        let mut written = Vec::with_capacity(data.len());
        for chunk in data.chunks(CHUNK_SIZE) {
            if let Err(e) = cancel.check() {
                let _ = fs::remove_file(&part);
                return Err(e);
            }
            written.extend_from_slice(chunk);
            fs::write(&part, &written).map_err(|e| UpdateError::write(&part, e))?;
            on_progress(written.len() as u64, Some(data.len() as u64));
            tokio::task::yield_now().await;
        }
        if data.is_empty() {
            fs::write(&part, b"").map_err(|e| UpdateError::write(&part, e))?;
        }
        fs::rename(&part, dest).map_err(|e| UpdateError::write(dest, e))?;
        Ok(data.len() as u64)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn fetch_bytes(&self, url: &str, cancel: &CancelScope) -> UpdateResult<Vec<u8>> {
        cancel.check()?;
        self.requests.lock().push(url.to_string());
        self.wait(url, cancel).await?;
        self.lookup(url)
    }

    async fn fetch_to_path(
        &self,
        url: &str,
        dest: &Path,
        on_progress: &TransferCallback,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        cancel.check()?;
        self.requests.lock().push(url.to_string());

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        let result = self.stream(url, dest, on_progress, cancel).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

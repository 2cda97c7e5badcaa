//! Mirror selection by measured throughput.
//!
//! Every candidate serves the same content, so the selector downloads a
//! sample from each in parallel and keeps the fastest. Each probe stops as
//! soon as it has seen enough bytes or spent enough time to estimate its
//! throughput.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::cancel::CancelScope;
use crate::error::{UpdateError, UpdateResult};
use crate::transport::Transport;

/// Default time after which a probe stops (3 seconds).
pub const DEFAULT_PROBE_TIME: Duration = Duration::from_secs(3);

/// Default byte count after which a probe stops (100 KiB).
pub const DEFAULT_PROBE_BYTES: u64 = 100 * 1024;

/// Thresholds for a single mirror probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Stop probing once this much time has elapsed.
    pub time_threshold: Duration,
    /// Stop probing once this many bytes have arrived.
    pub byte_threshold: u64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            time_threshold: DEFAULT_PROBE_TIME,
            byte_threshold: DEFAULT_PROBE_BYTES,
        }
    }
}

/// Throughput measured for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    /// Candidate base URL.
    pub candidate: String,
    /// Bytes per second, or `None` if the transfer failed outright.
    pub throughput: Option<u64>,
}

impl ProbeResult {
    fn usable(&self) -> Option<u64> {
        self.throughput.filter(|t| *t > 0)
    }
}

/// Races candidate mirrors and returns the fastest.
#[derive(Debug, Clone)]
pub struct MirrorSelector {
    transport: Arc<dyn Transport>,
    probe_dir: PathBuf,
    options: ProbeOptions,
}

impl MirrorSelector {
    /// Create a selector writing probe files into `probe_dir`.
    pub fn new(transport: Arc<dyn Transport>, probe_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            probe_dir: probe_dir.into(),
            options: ProbeOptions::default(),
        }
    }

    /// Override the probe thresholds.
    pub fn with_options(mut self, options: ProbeOptions) -> Self {
        self.options = options;
        self
    }

    /// Probe thresholds in use.
    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Select the fastest candidate.
    ///
    /// Each candidate is probed at `<candidate><probe_suffix>`. A single
    /// candidate is returned without touching the network.
    pub async fn select(
        &self,
        candidates: &[String],
        probe_suffix: &str,
        cancel: &CancelScope,
    ) -> UpdateResult<String> {
        cancel.check()?;

        match candidates {
            [] => return Err(UpdateError::NoMirrorAvailable { candidates: 0 }),
            [only] => return Ok(only.clone()),
            _ => {}
        }

        let results = self.probe_all(candidates, probe_suffix, cancel).await?;
        best_of(&results)
            .map(|r| {
                info!(
                    mirror = %r.candidate,
                    throughput = r.throughput.unwrap_or(0),
                    "Selected mirror"
                );
                r.candidate.clone()
            })
            .ok_or(UpdateError::NoMirrorAvailable {
                candidates: candidates.len(),
            })
    }

    /// Probe every candidate in parallel and report the raw measurements.
    pub async fn probe_all(
        &self,
        candidates: &[String],
        probe_suffix: &str,
        cancel: &CancelScope,
    ) -> UpdateResult<Vec<ProbeResult>> {
        tokio::fs::create_dir_all(&self.probe_dir)
            .await
            .map_err(|e| UpdateError::create_dir(&self.probe_dir, e))?;

        let scopes: Vec<CancelScope> = candidates.iter().map(|_| cancel.child()).collect();
        let probes = candidates.iter().zip(scopes.iter()).map(|(candidate, scope)| {
            let url = format!("{}{}", candidate.trim_end_matches('/'), probe_suffix);
            self.probe(candidate.clone(), url, scope.clone(), cancel)
        });
        let results = join_all(probes).await;

        for scope in &scopes {
            scope.cancel("mirror selection finished");
        }
        cancel.check()?;

        Ok(results)
    }

    async fn probe(
        &self,
        candidate: String,
        url: String,
        scope: CancelScope,
        parent: &CancelScope,
    ) -> ProbeResult {
        let temp = match tempfile::Builder::new()
            .prefix("speedtest.")
            .suffix(".tmp")
            .tempfile_in(&self.probe_dir)
        {
            Ok(file) => file.into_temp_path(),
            Err(e) => {
                warn!(mirror = %candidate, error = %e, "Failed to create probe file");
                return ProbeResult {
                    candidate,
                    throughput: None,
                };
            }
        };

        let start = Instant::now();
        let transferred = Arc::new(AtomicU64::new(0));
        let speed = Arc::new(AtomicU64::new(0));

        let options = self.options.clone();
        let progress_scope = scope.clone();
        let progress_transferred = Arc::clone(&transferred);
        let progress_speed = Arc::clone(&speed);
        let on_progress = move |done: u64, _total: Option<u64>| {
            let elapsed = elapsed_millis(start);
            progress_transferred.store(done, Ordering::SeqCst);
            progress_speed.store(done * 1000 / elapsed, Ordering::SeqCst);
            if elapsed >= options.time_threshold.as_millis() as u64
                || done >= options.byte_threshold
            {
                progress_scope.cancel("probe threshold reached");
            }
        };

        let result = {
            let fetch = self
                .transport
                .fetch_to_path(&url, &temp, &on_progress, &scope);
            tokio::pin!(fetch);

            tokio::select! {
                result = &mut fetch => result,
                _ = tokio::time::sleep(self.options.time_threshold) => {
                    scope.cancel("probe time limit reached");
                    fetch.await
                }
            }
        };

        let throughput = match result {
            // A completed transfer is usable even when the sample is empty.
            Ok(bytes) => Some((bytes * 1000 / elapsed_millis(start)).max(1)),
            Err(e) if e.is_cancelled() && !parent.is_cancelled() => {
                let bytes = transferred.load(Ordering::SeqCst);
                if bytes == 0 {
                    Some(0)
                } else {
                    Some(speed.load(Ordering::SeqCst))
                }
            }
            Err(e) => {
                debug!(mirror = %candidate, error = %e, "Mirror probe failed");
                None
            }
        };

        debug!(mirror = %candidate, throughput = ?throughput, "Mirror probe finished");
        // Dropping the temp path deletes the probe file.
        drop(temp);

        ProbeResult {
            candidate,
            throughput,
        }
    }
}

/// Fastest usable result; ties keep candidate order.
fn best_of(results: &[ProbeResult]) -> Option<&ProbeResult> {
    let mut best: Option<(&ProbeResult, u64)> = None;
    for result in results {
        if let Some(throughput) = result.usable() {
            if best.map_or(true, |(_, b)| throughput > b) {
                best = Some((result, throughput));
            }
        }
    }
    best.map(|(r, _)| r)
}

fn elapsed_millis(start: Instant) -> u64 {
    (start.elapsed().as_millis() as u64).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockTransport;
    use tempfile::TempDir;

    fn selector(transport: MockTransport, dir: &TempDir) -> MirrorSelector {
        MirrorSelector::new(Arc::new(transport), dir.path().join("probe"))
    }

    #[test]
    fn test_probe_options_default() {
        let options = ProbeOptions::default();
        assert_eq!(options.time_threshold, Duration::from_secs(3));
        assert_eq!(options.byte_threshold, 100 * 1024);
    }

    #[test]
    fn test_best_of_discards_non_positive() {
        let results = vec![
            ProbeResult {
                candidate: "a".into(),
                throughput: None,
            },
            ProbeResult {
                candidate: "b".into(),
                throughput: Some(0),
            },
            ProbeResult {
                candidate: "c".into(),
                throughput: Some(10),
            },
            ProbeResult {
                candidate: "d".into(),
                throughput: Some(10),
            },
        ];
        assert_eq!(best_of(&results).unwrap().candidate, "c");
        assert!(best_of(&results[..2]).is_none());
    }

    #[tokio::test]
    async fn test_single_candidate_is_not_probed() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new();
        let requests = transport.request_log();
        let selector = selector(transport, &dir);

        let chosen = selector
            .select(&["http://only".to_string()], "/files/aa", &CancelScope::new())
            .await
            .unwrap();

        assert_eq!(chosen, "http://only");
        assert!(requests.lock().is_empty());
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let dir = TempDir::new().unwrap();
        let selector = selector(MockTransport::new(), &dir);
        let err = selector
            .select(&[], "/files/aa", &CancelScope::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::NoMirrorAvailable { candidates: 0 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_mirror_beats_slow_mirror() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .with_file("http://slow/files/aa", vec![1u8; 4096])
            .with_delay("http://slow", Duration::from_secs(5))
            .with_file("http://fast/files/aa", vec![1u8; 4096]);
        let selector = selector(transport, &dir);

        let chosen = selector
            .select(
                &["http://slow".to_string(), "http://fast".to_string()],
                "/files/aa",
                &CancelScope::new(),
            )
            .await
            .unwrap();

        assert_eq!(chosen, "http://fast");
    }

    #[tokio::test]
    async fn test_all_failed_candidates() {
        let dir = TempDir::new().unwrap();
        let selector = selector(MockTransport::new(), &dir);

        let err = selector
            .select(
                &["http://a".to_string(), "http://b".to_string()],
                "/files/missing",
                &CancelScope::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::NoMirrorAvailable { candidates: 2 }));
    }

    #[tokio::test]
    async fn test_byte_threshold_stops_probe_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .with_file("http://a/files/big", vec![0u8; 512 * 1024])
            .with_file("http://b/files/big", vec![0u8; 512 * 1024]);
        let selector = selector(transport, &dir);

        let results = selector
            .probe_all(
                &["http://a".to_string(), "http://b".to_string()],
                "/files/big",
                &CancelScope::new(),
            )
            .await
            .unwrap();

        assert!(results.iter().all(|r| r.throughput.unwrap_or(0) > 0));
        let leftovers = std::fs::read_dir(dir.path().join("probe")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_parent_cancellation_propagates() {
        let dir = TempDir::new().unwrap();
        let selector = selector(MockTransport::new(), &dir);
        let cancel = CancelScope::new();
        cancel.cancel("user");

        let err = selector
            .select(
                &["http://a".to_string(), "http://b".to_string()],
                "/files/aa",
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_completed_empty_probe_is_usable() {
        let dir = TempDir::new().unwrap();
        let transport = MockTransport::new()
            .with_file("http://a/files/ef", Vec::new())
            .with_file("http://b/files/ef", Vec::new());
        let selector = selector(transport, &dir);

        let chosen = selector
            .select(
                &["http://a".to_string(), "http://b".to_string()],
                "/files/ef",
                &CancelScope::new(),
            )
            .await
            .unwrap();

        assert_eq!(chosen, "http://a");
    }
}

//! Bounded-concurrency acquisition of patches and full files.
//!
//! A fixed pool of worker tasks drains a shared queue of descriptors grouped
//! by new digest. For each descriptor the delta patch is tried first; any
//! failure other than cancellation falls back to the full file addressed by
//! the new digest. Within a group, an acquired full file or delta is reused
//! by every later descriptor that can use it.
//!
//! ```text
//! FetchOrchestrator
//!         │
//!         ├── worker 0 ─┐
//!         ├── worker 1 ─┼── queue of PatchDescriptor groups
//!         └── worker N ─┘
//!                 │
//!                 ├── cached?      <storage>/<new>            → Cached
//!                 ├── delta        <base>/patch/<old>_<new>    → Delta
//!                 └── full file    <base>/files/<new>          → Full
//! ```

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::cancel::CancelScope;
use crate::digest::{lookup_async, ContentHasher};
use crate::error::{UpdateError, UpdateResult};
use crate::layout::RemoteLayout;
use crate::progress::ProgressTracker;
use crate::resolver::{group_by_new_digest, PatchDescriptor};
use crate::storage::StorageLayout;
use crate::transport::Transport;

/// Where the bytes for a descriptor come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchSource {
    /// A delta patch to apply to the live file.
    Delta(PathBuf),
    /// A full replacement file.
    Full(PathBuf),
    /// A converged artifact already present in storage.
    Cached(PathBuf),
}

/// A descriptor together with its acquired local source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPatch {
    /// The descriptor this source belongs to.
    pub descriptor: PatchDescriptor,
    /// Acquired local source.
    pub source: PatchSource,
    /// True if the delta was unavailable and the full file was used instead.
    pub fell_back: bool,
}

impl ResolvedPatch {
    /// Local delta patch path, or `None` for full replacements.
    pub fn patch_path(&self) -> Option<&Path> {
        match &self.source {
            PatchSource::Delta(path) => Some(path),
            _ => None,
        }
    }
}

/// Downloads everything a list of descriptors needs into storage.
#[derive(Debug, Clone)]
pub struct FetchOrchestrator {
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn ContentHasher>,
    storage: StorageLayout,
    concurrency: usize,
}

impl FetchOrchestrator {
    /// Create an orchestrator running at most `concurrency` transfers.
    pub fn new(
        transport: Arc<dyn Transport>,
        hasher: Arc<dyn ContentHasher>,
        storage: StorageLayout,
        concurrency: usize,
    ) -> Self {
        Self {
            transport,
            hasher,
            storage,
            concurrency: concurrency.max(1),
        }
    }

    /// Maximum number of concurrent transfers.
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Acquire every descriptor from the mirror at `base_url`.
    ///
    /// Results are returned in input order. The first fatal error stops the
    /// remaining workers and is returned.
    pub async fn fetch_all(
        &self,
        needed: Vec<PatchDescriptor>,
        base_url: &str,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<Vec<ResolvedPatch>> {
        cancel.check()?;
        if needed.is_empty() {
            return Ok(Vec::new());
        }

        let download_dir = self.storage.download_dir();
        tokio::fs::create_dir_all(&download_dir)
            .await
            .map_err(|e| UpdateError::create_dir(&download_dir, e))?;

        let total = needed.len();
        let groups = group_by_new_digest(needed.into_iter().enumerate(), |d| d);
        let group_count = groups.len();
        let queue = Arc::new(Mutex::new(groups.into_iter().collect::<VecDeque<_>>()));
        let results: Arc<Mutex<Vec<Option<ResolvedPatch>>>> =
            Arc::new(Mutex::new(vec![None; total]));
        let layout = RemoteLayout::new(base_url);
        let worker_scope = cancel.child();
        let worker_count = self.concurrency.min(group_count);

        info!(
            files = total,
            workers = worker_count,
            mirror = %layout.base(),
            "Fetching patches"
        );

        let mut workers = JoinSet::new();
        for _ in 0..worker_count {
            let this = self.clone();
            let queue = Arc::clone(&queue);
            let results = Arc::clone(&results);
            let layout = layout.clone();
            let tracker = tracker.clone();
            let scope = worker_scope.clone();

            workers.spawn(async move {
                loop {
                    let next = queue.lock().pop_front();
                    let Some(group) = next else {
                        break;
                    };
                    scope.check()?;
                    let resolved = this.fetch_group(group, &layout, &tracker, &scope).await?;
                    let mut slots = results.lock();
                    for (index, patch) in resolved {
                        slots[index] = Some(patch);
                    }
                }
                Ok::<(), UpdateError>(())
            });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(UpdateError::from).and_then(|r| r);
            if let Err(e) = outcome {
                if first_error.is_none() {
                    worker_scope.cancel("fetch failed");
                    first_error = Some(e);
                }
            }
        }

        cancel.check()?;
        if let Some(e) = first_error {
            return Err(e);
        }

        let collected = std::mem::take(&mut *results.lock());
        collected
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| UpdateError::TaskFailed("fetch worker lost a result".to_string()))
    }

    /// Acquire one group of descriptors sharing a new digest, in order.
    async fn fetch_group(
        &self,
        group: Vec<(usize, PatchDescriptor)>,
        layout: &RemoteLayout,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<Vec<(usize, ResolvedPatch)>> {
        let mut acquired = Acquired::default();
        let mut resolved = Vec::with_capacity(group.len());
        for (index, descriptor) in group {
            cancel.check()?;
            let patch = match acquired.reuse(&descriptor) {
                Some(source) => {
                    debug!(path = %descriptor.relative_path, "Sharing artifact with identical file");
                    ResolvedPatch {
                        descriptor,
                        source,
                        fell_back: false,
                    }
                }
                None => {
                    let patch = self
                        .fetch_one(index, descriptor, layout, tracker, cancel)
                        .await?;
                    acquired.record(&patch);
                    patch
                }
            };
            resolved.push((index, patch));
        }
        Ok(resolved)
    }

    async fn fetch_one(
        &self,
        id: usize,
        descriptor: PatchDescriptor,
        layout: &RemoteLayout,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<ResolvedPatch> {
        let converged = self.storage.converged_path(&descriptor.new_digest);
        let cached = lookup_async(Arc::clone(&self.hasher), converged.clone()).await?;
        if cached.matches(&descriptor.new_digest) {
            debug!(path = %descriptor.relative_path, "Converged artifact already cached");
            return Ok(ResolvedPatch {
                descriptor,
                source: PatchSource::Cached(converged),
                fell_back: false,
            });
        }

        let mut fell_back = false;
        if !descriptor.is_new_file() {
            let url = layout.patch_url(&descriptor.old_digest, &descriptor.new_digest);
            let dest = self
                .storage
                .delta_path(&descriptor.old_digest, &descriptor.new_digest);

            match self
                .download(id, &descriptor.relative_path, &url, &dest, tracker, cancel)
                .await
            {
                Ok(bytes) => {
                    debug!(path = %descriptor.relative_path, bytes, "Downloaded delta patch");
                    return Ok(ResolvedPatch {
                        descriptor,
                        source: PatchSource::Delta(dest),
                        fell_back: false,
                    });
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        path = %descriptor.relative_path,
                        error = %e,
                        "Delta patch unavailable, falling back to full file"
                    );
                    fell_back = true;
                }
            }
        }

        let url = layout.file_url(&descriptor.new_digest);
        let dest = self.storage.full_path(&descriptor.new_digest);
        let bytes = self
            .download(id, &descriptor.relative_path, &url, &dest, tracker, cancel)
            .await?;
        debug!(path = %descriptor.relative_path, bytes, "Downloaded full file");

        Ok(ResolvedPatch {
            descriptor,
            source: PatchSource::Full(dest),
            fell_back,
        })
    }

    async fn download(
        &self,
        id: usize,
        name: &str,
        url: &str,
        dest: &Path,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        tracker.begin(id, name);
        let progress = tracker.clone();
        let on_progress = move |done: u64, total: Option<u64>| progress.update(id, done, total);
        let result = self
            .transport
            .fetch_to_path(url, dest, &on_progress, cancel)
            .await;
        tracker.finish(id);
        result
    }
}

/// Sources already acquired for one new digest.
#[derive(Debug, Default)]
struct Acquired {
    /// A cached or full artifact, usable whatever the old content.
    complete: Option<PatchSource>,
    /// Deltas by old digest.
    deltas: HashMap<String, PathBuf>,
}

impl Acquired {
    fn reuse(&self, descriptor: &PatchDescriptor) -> Option<PatchSource> {
        if let Some(patch) = self.deltas.get(&descriptor.old_digest) {
            return Some(PatchSource::Delta(patch.clone()));
        }
        self.complete.clone()
    }

    fn record(&mut self, patch: &ResolvedPatch) {
        match &patch.source {
            PatchSource::Delta(path) => {
                self.deltas
                    .insert(patch.descriptor.old_digest.clone(), path.clone());
            }
            source => self.complete = Some(source.clone()),
        }
    }
}

//! Top-level update client.
//!
//! [`UpdateClient`] owns the connection pool, the hasher, the delta engine
//! and the archive extractor, and runs the two update flows on top of them:
//!
//! ```text
//! update()         ReadLocalVersion → FetchRemoteVersion → FetchManifest
//!                  → VerifyLocalFiles → DownloadPatch → PatchFile
//! simple_update()  FetchBundle → VerifyBundle → InstallBundle
//! ```

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use tracing::{info, warn};

use crate::applicator::{ApplyReport, PatchApplicator};
use crate::bundle::{self, BundleWorkflow, PreUpdateHook};
use crate::cancel::CancelScope;
use crate::config::{ClientConfig, UpdateOptions};
use crate::delta::{BsdiffEngine, DeltaEngine};
use crate::digest::{ContentHasher, Xxh64Hasher};
use crate::error::{UpdateError, UpdateResult};
use crate::extractor::{ArchiveExtractor, ZipExtractor};
use crate::fetch::FetchOrchestrator;
use crate::layout::RemoteLayout;
use crate::manifest::Manifest;
use crate::mirror::MirrorSelector;
use crate::progress::{ProgressCallback, ProgressTracker, Stage};
use crate::resolver::DiffResolver;
use crate::storage::StorageLayout;
use crate::transport::{fetch_text, HttpTransport, Transport};
use crate::version::{compare_versions, is_newer, parse_version, read_local_version, write_local_version};

/// Terminal result of an update operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// A new version is installed.
    Updated {
        /// Installed version.
        version: String,
        /// Version installed before the update, if any.
        previous_version: Option<String>,
        /// Files swapped into place.
        report: ApplyReport,
        /// Files fetched in full because their delta was unavailable.
        fallbacks: usize,
        /// True if the whole root was replaced from a full bundle.
        reinstalled: bool,
    },
    /// Nothing to do.
    NoUpdate {
        /// Installed version, if any.
        local_version: Option<String>,
    },
}

impl UpdateOutcome {
    /// Version installed after the operation.
    pub fn version(&self) -> Option<&str> {
        match self {
            Self::Updated { version, .. } => Some(version),
            Self::NoUpdate { local_version } => local_version.as_deref(),
        }
    }

    /// Returns true if the operation installed something.
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}

/// Installed and available versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatus {
    /// Installed version, if any.
    pub local_version: Option<String>,
    /// Version published as `latest`.
    pub remote_version: String,
    /// Mirror that answered.
    pub mirror: String,
    /// True if the remote version is newer than the installed one.
    pub update_available: bool,
}

/// Client updating one artifact root.
pub struct UpdateClient {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn ContentHasher>,
    engine: Arc<dyn DeltaEngine>,
    extractor: Arc<dyn ArchiveExtractor>,
    progress: Option<ProgressCallback>,
}

impl fmt::Debug for UpdateClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateClient")
            .field("config", &self.config)
            .field("transport", &self.transport)
            .field("hasher", &self.hasher)
            .field("engine", &self.engine)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

impl UpdateClient {
    /// Create a client using HTTP with the configured timeout.
    pub fn new(config: ClientConfig) -> UpdateResult<Self> {
        let transport = HttpTransport::with_timeout(config.timeout)?;
        Ok(Self::with_transport(config, Arc::new(transport)))
    }

    /// Create a client on top of a custom transport.
    pub fn with_transport(config: ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            hasher: Arc::new(Xxh64Hasher),
            engine: Arc::new(BsdiffEngine),
            extractor: Arc::new(ZipExtractor),
            progress: None,
        }
    }

    /// Use a different content hasher.
    pub fn with_hasher(mut self, hasher: Arc<dyn ContentHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Use a different delta engine.
    pub fn with_engine(mut self, engine: Arc<dyn DeltaEngine>) -> Self {
        self.engine = engine;
        self
    }

    /// Use a different archive extractor.
    pub fn with_extractor(mut self, extractor: Arc<dyn ArchiveExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Receive progress snapshots.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn storage(&self) -> StorageLayout {
        StorageLayout::new(&self.config.storage)
    }

    fn tracker(&self) -> ProgressTracker {
        ProgressTracker::new(self.progress.clone())
    }

    fn applicator(&self, options: &UpdateOptions) -> PatchApplicator {
        PatchApplicator::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.hasher),
            self.storage(),
            options.apply_options(),
        )
    }

    /// Compare the installed version with the remote `latest`.
    pub async fn status(&self, cancel: &CancelScope) -> UpdateResult<UpdateStatus> {
        cancel.check()?;
        let local_version = read_local_version(&self.config.root)?;
        let (remote_version, mirror) = self.fetch_latest(cancel).await?;
        let update_available = is_newer(&remote_version, local_version.as_deref())?;
        Ok(UpdateStatus {
            local_version,
            remote_version,
            mirror,
            update_available,
        })
    }

    /// Bring the artifact root to the latest (or requested) version.
    ///
    /// Without a forced target, a remote version that is not newer than the
    /// installed one yields [`UpdateOutcome::NoUpdate`].
    pub async fn update(
        &self,
        options: &UpdateOptions,
        cancel: &CancelScope,
    ) -> UpdateResult<UpdateOutcome> {
        let tracker = self.tracker();
        let root = &self.config.root;

        tracker.stage(Stage::ReadLocalVersion);
        cancel.check()?;
        let local_version = read_local_version(root)?;

        tracker.stage(Stage::FetchRemoteVersion);
        cancel.check()?;
        let target = match &options.target_version {
            Some(forced) => {
                parse_version(forced)?;
                forced.trim().to_string()
            }
            None => {
                let (latest, _) = self.fetch_latest(cancel).await?;
                if !is_newer(&latest, local_version.as_deref())? {
                    info!(
                        local = ?local_version,
                        remote = %latest,
                        "Installed version is up to date"
                    );
                    return Ok(UpdateOutcome::NoUpdate { local_version });
                }
                latest
            }
        };
        info!(local = ?local_version, target = %target, "Updating");

        tracker.stage(Stage::FetchManifest);
        let manifest = self.fetch_manifest(&target, cancel).await?;

        tracker.stage(Stage::VerifyLocalFiles);
        let needed = DiffResolver::new(Arc::clone(&self.hasher), options.concurrency)
            .resolve(&manifest, root, cancel)
            .await?;

        let already_installed = match &local_version {
            Some(local) => compare_versions(local, &target)? == Ordering::Equal,
            None => false,
        };
        if needed.is_empty() && already_installed {
            return Ok(UpdateOutcome::NoUpdate { local_version });
        }

        tracker.stage(Stage::DownloadPatch);
        let storage = self.storage();
        storage.ensure()?;
        let resolved = if needed.is_empty() {
            Vec::new()
        } else {
            let selector = MirrorSelector::new(Arc::clone(&self.transport), storage.probe_dir())
                .with_options(self.config.probe.clone());
            let suffix = RemoteLayout::manifest_suffix(&target);
            let base = selector.select(&self.config.mirrors, &suffix, cancel).await?;
            FetchOrchestrator::new(
                Arc::clone(&self.transport),
                Arc::clone(&self.hasher),
                storage,
                options.concurrency,
            )
            .fetch_all(needed, &base, &tracker, cancel)
            .await?
        };
        let fallbacks = resolved.iter().filter(|r| r.fell_back).count();

        tracker.stage(Stage::PatchFile);
        let report = self
            .applicator(options)
            .apply(resolved, &tracker, cancel)
            .await?;
        write_local_version(root, &target)?;

        info!(
            version = %target,
            changed = report.changed(),
            fallbacks,
            "Update complete"
        );
        Ok(UpdateOutcome::Updated {
            version: target,
            previous_version: local_version,
            report,
            fallbacks,
            reinstalled: false,
        })
    }

    /// Update from the configured patch bundle, reinstalling from the full
    /// bundle if the patch does not apply.
    pub async fn simple_update(
        &self,
        hook: Option<&PreUpdateHook>,
        cancel: &CancelScope,
    ) -> UpdateResult<UpdateOutcome> {
        let options = &self.config.update;
        let workflow = BundleWorkflow::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.hasher),
            Arc::clone(&self.engine),
            Arc::clone(&self.extractor),
            self.storage(),
            &self.config.root,
            self.config.probe.clone(),
            options.apply_options(),
        );
        workflow
            .run(
                &self.config.bundle.patch_mirrors,
                &self.config.bundle.full_mirrors,
                hook,
                &self.tracker(),
                cancel,
            )
            .await
    }

    /// Undo an update using the backups it left behind.
    ///
    /// Restores the previous `.version` marker as well. A full reinstall is
    /// undone by swapping the version-named backup directory back in.
    pub async fn rollback(&self, outcome: &UpdateOutcome) -> UpdateResult<()> {
        let UpdateOutcome::Updated {
            version,
            previous_version,
            report,
            reinstalled,
            ..
        } = outcome
        else {
            return Ok(());
        };
        let root = self.config.root.clone();

        if *reinstalled {
            let previous = previous_version.clone();
            let current = version.clone();
            tokio::task::spawn_blocking(move || {
                bundle::restore_reinstall(&root, previous.as_deref(), &current)
            })
            .await??;
        } else {
            self.applicator(&self.config.update).rollback(report).await?;
            match previous_version {
                Some(previous) => write_local_version(&root, previous)?,
                None => {
                    let marker = root.join(crate::version::VERSION_FILE);
                    if let Err(e) = std::fs::remove_file(&marker) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(UpdateError::write(marker, e));
                        }
                    }
                }
            }
        }

        info!(version = ?previous_version, "Rolled back update");
        Ok(())
    }

    /// Delete the staging storage folder, backups included.
    pub fn cleanup(&self) -> UpdateResult<()> {
        info!(storage = %self.config.storage.display(), "Removing staging storage");
        self.storage().remove()
    }

    /// Fetch `latest` from the mirrors in order; first answer wins.
    async fn fetch_latest(&self, cancel: &CancelScope) -> UpdateResult<(String, String)> {
        self.fetch_first(|layout| layout.latest_url(), cancel).await
    }

    async fn fetch_manifest(&self, version: &str, cancel: &CancelScope) -> UpdateResult<Manifest> {
        let (text, mirror) = self
            .fetch_first(|layout| layout.manifest_url(version), cancel)
            .await?;
        let manifest = Manifest::parse(&text)?;
        info!(version, mirror = %mirror, files = manifest.len(), "Fetched manifest");
        Ok(manifest)
    }

    async fn fetch_first<F>(&self, url_for: F, cancel: &CancelScope) -> UpdateResult<(String, String)>
    where
        F: Fn(&RemoteLayout) -> String,
    {
        let mut last_error = UpdateError::NoMirrorAvailable { candidates: 0 };
        for mirror in &self.config.mirrors {
            cancel.check()?;
            let layout = RemoteLayout::new(mirror);
            let url = url_for(&layout);
            match fetch_text(self.transport.as_ref(), &url, cancel).await {
                Ok(text) => return Ok((text, mirror.clone())),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(url = %url, error = %e, "Mirror failed, trying next");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

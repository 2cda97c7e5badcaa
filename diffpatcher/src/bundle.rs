//! Self-contained bundle updates.
//!
//! A patch bundle carries everything needed to move one installed version to
//! the next. If it does not apply, the workflow falls through to a full
//! bundle which replaces the whole artifact root.
//!
//! Patch bundle layout (zip):
//!
//! ```text
//! .bundle               "<expected_from_version>\t<target_version>"
//! .manifest             manifest of the target version
//! files/<digest>        full file contents
//! patch/<old>_<new>     delta patches
//! ```
//!
//! A full bundle is the complete artifact tree including its `.version`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};

use crate::applicator::{ApplyOptions, PatchApplicator};
use crate::cancel::CancelScope;
use crate::client::UpdateOutcome;
use crate::delta::DeltaEngine;
use crate::digest::ContentHasher;
use crate::error::{UpdateError, UpdateResult};
use crate::extractor::ArchiveExtractor;
use crate::fetch::{PatchSource, ResolvedPatch};
use crate::layout::patch_name;
use crate::manifest::Manifest;
use crate::mirror::{MirrorSelector, ProbeOptions};
use crate::progress::{ProgressTracker, Stage};
use crate::resolver::{DiffResolver, PatchDescriptor};
use crate::storage::StorageLayout;
use crate::transport::Transport;
use crate::version::{read_local_version, write_local_version, VERSION_FILE};

/// Name of the precondition record inside a patch bundle.
pub const BUNDLE_HEADER_FILE: &str = ".bundle";

/// Name of the target manifest inside a patch bundle.
pub const BUNDLE_MANIFEST_FILE: &str = ".manifest";

/// Callback run right before the artifact root is modified.
///
/// Receives the target version. Returning an error aborts the update.
pub type PreUpdateHook = Arc<dyn Fn(&str) -> Result<(), String> + Send + Sync>;

/// Precondition record of a patch bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleHeader {
    /// Version the bundle must be applied to.
    pub from_version: String,
    /// Version installed by the bundle.
    pub to_version: String,
}

impl BundleHeader {
    /// Parse `"<from>\t<to>"`.
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let (from, to) = text
            .trim()
            .split_once('\t')
            .ok_or_else(|| UpdateError::InvalidVersion(format!("bad bundle header: {:?}", text)))?;
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() {
            return Err(UpdateError::InvalidVersion(format!(
                "bad bundle header: {:?}",
                text
            )));
        }
        Ok(Self {
            from_version: from.to_string(),
            to_version: to.to_string(),
        })
    }
}

/// Runs the patch bundle flow with full reinstall fallback.
#[derive(Debug, Clone)]
pub struct BundleWorkflow {
    transport: Arc<dyn Transport>,
    hasher: Arc<dyn ContentHasher>,
    engine: Arc<dyn DeltaEngine>,
    extractor: Arc<dyn ArchiveExtractor>,
    storage: StorageLayout,
    root: PathBuf,
    probe: ProbeOptions,
    apply: ApplyOptions,
}

impl BundleWorkflow {
    /// Create a workflow updating `root` through `storage`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn Transport>,
        hasher: Arc<dyn ContentHasher>,
        engine: Arc<dyn DeltaEngine>,
        extractor: Arc<dyn ArchiveExtractor>,
        storage: StorageLayout,
        root: impl Into<PathBuf>,
        probe: ProbeOptions,
        apply: ApplyOptions,
    ) -> Self {
        Self {
            transport,
            hasher,
            engine,
            extractor,
            storage,
            root: root.into(),
            probe,
            apply,
        }
    }

    /// Update from a patch bundle, or reinstall from a full bundle.
    ///
    /// Any patch-path failure other than cancellation or a hook refusal
    /// falls through to the full reinstall.
    pub async fn run(
        &self,
        patch_mirrors: &[String],
        full_mirrors: &[String],
        hook: Option<&PreUpdateHook>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<UpdateOutcome> {
        cancel.check()?;
        let local_version = read_local_version(&self.root)?;

        match self
            .patch(patch_mirrors, local_version.as_deref(), hook, tracker, cancel)
            .await
        {
            Ok(outcome) => return Ok(outcome),
            Err(e) if e.is_cancelled() || matches!(e, UpdateError::Hook(_)) => return Err(e),
            Err(e) => {
                warn!(error = %e, "Patch bundle not applicable, falling back to full reinstall");
            }
        }

        self.reinstall(full_mirrors, local_version, hook, tracker, cancel)
            .await
    }

    async fn patch(
        &self,
        mirrors: &[String],
        local_version: Option<&str>,
        hook: Option<&PreUpdateHook>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<UpdateOutcome> {
        tracker.stage(Stage::FetchBundle);
        let bundle_dir = self.storage.bundle_dir();
        let archive = bundle_dir.join("patch.zip");
        self.download(mirrors, &archive, tracker, cancel).await?;

        tracker.stage(Stage::VerifyBundle);
        let extracted = bundle_dir.join("patch");
        self.extract(&archive, &extracted).await?;

        let header_path = extracted.join(BUNDLE_HEADER_FILE);
        let header = BundleHeader::parse(&read_text(&header_path)?)?;
        let actual = local_version.unwrap_or("none");
        if actual != header.from_version {
            warn!(
                expected = %header.from_version,
                actual,
                "Patch bundle does not apply to the installed version"
            );
            return Err(UpdateError::Precondition {
                expected: header.from_version,
                actual: actual.to_string(),
            });
        }

        let manifest = Manifest::parse(&read_text(&extracted.join(BUNDLE_MANIFEST_FILE))?)?;
        let needed = DiffResolver::new(Arc::clone(&self.hasher), self.apply.concurrency)
            .resolve(&manifest, &self.root, cancel)
            .await?;
        let resolved = needed
            .into_iter()
            .map(|descriptor| self.bundle_source(descriptor, &extracted))
            .collect::<UpdateResult<Vec<_>>>()?;
        let fallbacks = resolved.iter().filter(|r| r.fell_back).count();

        tracker.stage(Stage::InstallBundle);
        run_hook(hook, &header.to_version)?;

        let applicator = PatchApplicator::new(
            Arc::clone(&self.engine),
            Arc::clone(&self.hasher),
            self.storage.clone(),
            self.apply.clone(),
        );
        let report = applicator.apply(resolved, tracker, cancel).await?;
        write_local_version(&self.root, &header.to_version)?;
        remove_dir_if_exists(&bundle_dir)?;

        let version = read_local_version(&self.root)?.unwrap_or(header.to_version);
        info!(
            version = %version,
            changed = report.changed(),
            "Installed patch bundle"
        );
        Ok(UpdateOutcome::Updated {
            version,
            previous_version: local_version.map(String::from),
            report,
            fallbacks,
            reinstalled: false,
        })
    }

    /// Local source for a descriptor: bundled delta, leftover delta in
    /// storage, then bundled full file.
    fn bundle_source(
        &self,
        descriptor: PatchDescriptor,
        extracted: &Path,
    ) -> UpdateResult<ResolvedPatch> {
        if !descriptor.is_new_file() {
            let candidates = [
                extracted
                    .join("patch")
                    .join(patch_name(&descriptor.old_digest, &descriptor.new_digest)),
                self.storage
                    .local_delta_path(&descriptor.old_digest, &descriptor.new_digest),
            ];
            if let Some(delta) = candidates.into_iter().find(|p| p.is_file()) {
                return Ok(ResolvedPatch {
                    descriptor,
                    source: PatchSource::Delta(delta),
                    fell_back: false,
                });
            }
        }

        let full = extracted.join("files").join(&descriptor.new_digest);
        if full.is_file() {
            let fell_back = !descriptor.is_new_file();
            return Ok(ResolvedPatch {
                descriptor,
                source: PatchSource::Full(full),
                fell_back,
            });
        }

        Err(UpdateError::Extraction {
            path: extracted.to_path_buf(),
            reason: format!("bundle has no content for {}", descriptor.relative_path),
        })
    }

    async fn reinstall(
        &self,
        mirrors: &[String],
        local_version: Option<String>,
        hook: Option<&PreUpdateHook>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<UpdateOutcome> {
        tracker.stage(Stage::FetchBundle);
        let bundle_dir = self.storage.bundle_dir();
        let archive = bundle_dir.join("full.zip");
        self.download(mirrors, &archive, tracker, cancel).await?;

        tracker.stage(Stage::VerifyBundle);
        let staging = sibling(&self.root, ".staging")?;
        self.extract(&archive, &staging).await?;
        let target = read_local_version(&staging)?.ok_or_else(|| UpdateError::Extraction {
            path: archive.clone(),
            reason: format!("full bundle has no {} file", VERSION_FILE),
        })?;

        tracker.stage(Stage::InstallBundle);
        cancel.check()?;
        if let Err(e) = run_hook(hook, &target) {
            remove_dir_if_exists(&staging)?;
            return Err(e);
        }

        let backup = backup_path(&self.root, local_version.as_deref())?;
        let root = self.root.clone();
        let staging_dir = staging.clone();
        tokio::task::spawn_blocking(move || swap_directories(&root, &staging_dir, &backup))
            .await??;
        remove_dir_if_exists(&bundle_dir)?;

        let version = read_local_version(&self.root)?.unwrap_or(target);
        info!(version = %version, "Reinstalled from full bundle");
        Ok(UpdateOutcome::Updated {
            version,
            previous_version: local_version,
            report: Default::default(),
            fallbacks: 0,
            reinstalled: true,
        })
    }

    /// Pick the fastest mirror and download the bundle from it.
    async fn download(
        &self,
        mirrors: &[String],
        dest: &Path,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<u64> {
        let selector = MirrorSelector::new(Arc::clone(&self.transport), self.storage.probe_dir())
            .with_options(self.probe.clone());
        let url = selector.select(mirrors, "", cancel).await?;

        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        tracker.begin(0, name);
        let progress = tracker.clone();
        let on_progress = move |done: u64, total: Option<u64>| progress.update(0, done, total);
        let result = self
            .transport
            .fetch_to_path(&url, dest, &on_progress, cancel)
            .await;
        tracker.finish(0);

        let bytes = result?;
        info!(url = %url, bytes, "Downloaded bundle");
        Ok(bytes)
    }

    async fn extract(&self, archive: &Path, dest: &Path) -> UpdateResult<usize> {
        let extractor = Arc::clone(&self.extractor);
        let archive = archive.to_path_buf();
        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || {
            remove_dir_if_exists(&dest)?;
            extractor.extract(&archive, &dest)
        })
        .await?
    }
}

fn run_hook(hook: Option<&PreUpdateHook>, version: &str) -> UpdateResult<()> {
    match hook {
        Some(hook) => hook(version).map_err(UpdateError::Hook),
        None => Ok(()),
    }
}

/// `<parent>/<root name><suffix>`.
fn sibling(root: &Path, suffix: &str) -> UpdateResult<PathBuf> {
    let name = root.file_name().ok_or_else(|| {
        UpdateError::InvalidConfig(format!("artifact root {} has no name", root.display()))
    })?;
    let mut sibling = name.to_os_string();
    sibling.push(suffix);
    Ok(root.with_file_name(sibling))
}

/// `<root>.backup-<version>`.
fn backup_path(root: &Path, version: Option<&str>) -> UpdateResult<PathBuf> {
    sibling(root, &format!(".backup-{}", version.unwrap_or("unknown")))
}

/// Undo a full reinstall: the backup of `previous` goes back into place and
/// the current root becomes the backup of `current`.
pub(crate) fn restore_reinstall(
    root: &Path,
    previous: Option<&str>,
    current: &str,
) -> UpdateResult<()> {
    let previous_backup = backup_path(root, previous)?;
    if !previous_backup.is_dir() {
        return Err(UpdateError::read(
            &previous_backup,
            std::io::Error::new(std::io::ErrorKind::NotFound, "backup directory not found"),
        ));
    }
    let current_backup = backup_path(root, Some(current))?;
    swap_directories(root, &previous_backup, &current_backup)
}

/// Move `root` to `backup` and `staging` into place, undoing the first
/// rename if the second fails.
fn swap_directories(root: &Path, staging: &Path, backup: &Path) -> UpdateResult<()> {
    let had_root = root.exists();
    if had_root {
        remove_dir_if_exists(backup)?;
        fs::rename(root, backup).map_err(|e| UpdateError::write(backup, e))?;
    }

    if let Err(e) = fs::rename(staging, root) {
        if had_root {
            if let Err(undo) = fs::rename(backup, root) {
                warn!(error = %undo, backup = %backup.display(), "Failed to restore artifact root");
            }
        }
        return Err(UpdateError::write(root, e));
    }
    Ok(())
}

fn remove_dir_if_exists(path: &Path) -> UpdateResult<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(UpdateError::write(path, e)),
    }
}

fn read_text(path: &Path) -> UpdateResult<String> {
    fs::read_to_string(path).map_err(|e| UpdateError::read(path, e))
}

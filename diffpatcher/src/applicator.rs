//! Two-pass patch application.
//!
//! The apply pass converges every artifact into the storage folder, named by
//! the digest it must have. Files with identical new content are converged
//! once by a single task and share the artifact. Nothing under the artifact
//! root changes until
//! every artifact has converged and been verified. The swap pass then backs
//! up each live file and copies its artifact into place, restoring the
//! backups if any swap fails.
//!
//! ```text
//! apply pass (concurrent)                 swap pass (sequential)
//! live + patch ──► <storage>/<new>.tmp    live ──► <storage>/backup/<old>
//!        verify ──► <storage>/<new>       <storage>/<new> ──► live
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::cancel::CancelScope;
use crate::delta::DeltaEngine;
use crate::digest::{lookup_async, verify_async, ContentHasher, DigestLookup};
use crate::error::{UpdateError, UpdateResult};
use crate::fetch::{PatchSource, ResolvedPatch};
use crate::progress::ProgressTracker;
use crate::resolver::{group_by_new_digest, PatchDescriptor};
use crate::storage::StorageLayout;

/// Default number of delta application attempts.
pub const DEFAULT_APPLY_ATTEMPTS: u32 = 3;

/// Default delay between delta application attempts.
pub const DEFAULT_APPLY_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Tuning for the apply pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Maximum number of files converged at once.
    pub concurrency: usize,
    /// Check the live file against `old_digest` before patching.
    pub verify_before_patch: bool,
    /// Check every converged artifact against `new_digest`.
    pub verify_after_patch: bool,
    /// Delta application attempts per file.
    pub apply_attempts: u32,
    /// Delay between attempts.
    pub apply_retry_delay: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            concurrency: crate::config::DEFAULT_CONCURRENCY,
            verify_before_patch: false,
            verify_after_patch: true,
            apply_attempts: DEFAULT_APPLY_ATTEMPTS,
            apply_retry_delay: DEFAULT_APPLY_RETRY_DELAY,
        }
    }
}

/// A live file replaced by the swap pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwappedFile {
    /// Manifest path.
    pub relative_path: String,
    /// Live path that was replaced.
    pub target_path: PathBuf,
    /// Backup of the previous content, `None` if the file is new.
    pub backup_path: Option<PathBuf>,
    /// Digest now installed at `target_path`.
    pub new_digest: String,
}

/// Outcome of a successful apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Files swapped into place, in input order.
    pub swapped: Vec<SwappedFile>,
    /// Files whose live content already matched.
    pub skipped: usize,
}

impl ApplyReport {
    /// Number of files changed under the artifact root.
    pub fn changed(&self) -> usize {
        self.swapped.len()
    }
}

/// An artifact ready for the swap pass.
#[derive(Debug)]
struct Staged {
    index: usize,
    descriptor: PatchDescriptor,
    artifact: Option<PathBuf>,
}

/// Converges artifacts in storage and swaps them into the artifact root.
#[derive(Debug, Clone)]
pub struct PatchApplicator {
    engine: Arc<dyn DeltaEngine>,
    hasher: Arc<dyn ContentHasher>,
    storage: StorageLayout,
    options: ApplyOptions,
}

impl PatchApplicator {
    /// Create an applicator staging artifacts in `storage`.
    pub fn new(
        engine: Arc<dyn DeltaEngine>,
        hasher: Arc<dyn ContentHasher>,
        storage: StorageLayout,
        options: ApplyOptions,
    ) -> Self {
        Self {
            engine,
            hasher,
            storage,
            options,
        }
    }

    /// Options in use.
    pub fn options(&self) -> &ApplyOptions {
        &self.options
    }

    /// Converge and swap every resolved patch.
    ///
    /// If any file fails to converge, the artifact root is left untouched.
    pub async fn apply(
        &self,
        resolved: Vec<ResolvedPatch>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<ApplyReport> {
        cancel.check()?;
        if resolved.is_empty() {
            return Ok(ApplyReport::default());
        }
        let root = self.storage.root().to_path_buf();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| UpdateError::create_dir(&root, e))?;

        let concurrency = self.options.concurrency.max(1);
        let groups = group_by_new_digest(resolved.into_iter().enumerate(), |patch| {
            &patch.descriptor
        });
        let converging = stream::iter(groups)
            .map(|group| self.converge_group(group, tracker, cancel))
            .buffer_unordered(concurrency)
            .try_collect::<Vec<_>>();
        let mut staged: Vec<Staged> = cancel
            .guard(converging)
            .await?
            .into_iter()
            .flatten()
            .collect();
        staged.sort_by_key(|s| s.index);

        // Last chance to stop before the artifact root is touched.
        cancel.check()?;

        let skipped = staged.iter().filter(|s| s.artifact.is_none()).count();
        let this = self.clone();
        let swapped = tokio::task::spawn_blocking(move || this.swap_all(staged)).await??;

        info!(
            changed = swapped.len(),
            skipped,
            "Applied update to artifact root"
        );
        Ok(ApplyReport { swapped, skipped })
    }

    /// Restore every file of `report` from its backup.
    ///
    /// New files are removed. All files are attempted; the first error is
    /// returned.
    pub async fn rollback(&self, report: &ApplyReport) -> UpdateResult<()> {
        let swapped = report.swapped.clone();
        tokio::task::spawn_blocking(move || restore(&swapped)).await?
    }

    /// Delete the storage folder.
    pub fn cleanup(&self) -> UpdateResult<()> {
        self.storage.remove()
    }

    /// Converge files sharing a new digest, producing the artifact once.
    async fn converge_group(
        &self,
        group: Vec<(usize, ResolvedPatch)>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<Vec<Staged>> {
        let mut artifact = None;
        let mut staged = Vec::with_capacity(group.len());
        for (index, patch) in group {
            staged.push(
                self.converge(index, patch, &mut artifact, tracker, cancel)
                    .await?,
            );
        }
        Ok(staged)
    }

    async fn converge(
        &self,
        index: usize,
        patch: ResolvedPatch,
        shared: &mut Option<PathBuf>,
        tracker: &ProgressTracker,
        cancel: &CancelScope,
    ) -> UpdateResult<Staged> {
        cancel.check()?;
        let ResolvedPatch {
            descriptor, source, ..
        } = patch;
        let live = &descriptor.target_path;

        let live_lookup = lookup_async(Arc::clone(&self.hasher), live.clone()).await?;
        if live_lookup.matches(&descriptor.new_digest) {
            debug!(path = %descriptor.relative_path, "Live file already up to date");
            return Ok(Staged {
                index,
                descriptor,
                artifact: None,
            });
        }

        if self.options.verify_before_patch {
            check_live(live, &live_lookup, &descriptor.old_digest)?;
        }

        if let Some(artifact) = shared {
            debug!(path = %descriptor.relative_path, "Sharing converged artifact");
            return Ok(Staged {
                index,
                artifact: Some(artifact.clone()),
                descriptor,
            });
        }

        tracker.begin(index, descriptor.relative_path.clone());
        let result = self.converge_artifact(&descriptor, source, cancel).await;
        tracker.finish(index);

        let artifact = result?;
        *shared = Some(artifact.clone());
        Ok(Staged {
            index,
            artifact: Some(artifact),
            descriptor,
        })
    }

    async fn converge_artifact(
        &self,
        descriptor: &PatchDescriptor,
        source: PatchSource,
        cancel: &CancelScope,
    ) -> UpdateResult<PathBuf> {
        let converged = self.storage.converged_path(&descriptor.new_digest);
        if let PatchSource::Cached(path) = source {
            return Ok(path);
        }
        let cached = lookup_async(Arc::clone(&self.hasher), converged.clone()).await?;
        if cached.matches(&descriptor.new_digest) {
            debug!(path = %descriptor.relative_path, "Reusing converged artifact");
            return Ok(converged);
        }

        let temp = self
            .storage
            .root()
            .join(format!("{}.tmp", descriptor.new_digest));

        let produced = match source {
            PatchSource::Delta(patch) => {
                self.apply_with_retry(descriptor, &patch, &temp, cancel)
                    .await
            }
            PatchSource::Full(full) => copy_blocking(full, temp.clone()).await,
            PatchSource::Cached(path) => return Ok(path),
        };
        if let Err(e) = produced {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(e);
        }

        if self.options.verify_after_patch {
            if let Err(e) = verify_async(
                Arc::clone(&self.hasher),
                temp.clone(),
                descriptor.new_digest.clone(),
            )
            .await
            {
                warn!(path = %descriptor.relative_path, error = %e, "Converged file failed verification");
                let _ = tokio::fs::remove_file(&temp).await;
                return Err(e);
            }
        }

        tokio::fs::rename(&temp, &converged)
            .await
            .map_err(|e| UpdateError::write(&converged, e))?;
        debug!(path = %descriptor.relative_path, artifact = %converged.display(), "Converged file");
        Ok(converged)
    }

    async fn apply_with_retry(
        &self,
        descriptor: &PatchDescriptor,
        patch: &Path,
        temp: &Path,
        cancel: &CancelScope,
    ) -> UpdateResult<()> {
        let attempts = self.options.apply_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            cancel.check()?;
            let engine = Arc::clone(&self.engine);
            let old = descriptor.target_path.clone();
            let patch = patch.to_path_buf();
            let new = temp.to_path_buf();

            match tokio::task::spawn_blocking(move || engine.apply(&old, &patch, &new)).await? {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        path = %descriptor.relative_path,
                        attempt,
                        attempts,
                        error = %e,
                        "Delta application failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                let delay = self.options.apply_retry_delay;
                cancel
                    .guard(async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
            }
        }

        Err(UpdateError::Apply {
            path: descriptor.target_path.clone(),
            attempts,
            reason: last_error,
        })
    }

    fn swap_all(&self, staged: Vec<Staged>) -> UpdateResult<Vec<SwappedFile>> {
        let mut swapped = Vec::new();
        for item in staged {
            let Some(artifact) = item.artifact else {
                continue;
            };
            match self.swap_one(&item.descriptor, &artifact) {
                Ok(file) => swapped.push(file),
                Err(e) => {
                    warn!(
                        path = %item.descriptor.relative_path,
                        error = %e,
                        restoring = swapped.len(),
                        "Swap failed, restoring replaced files"
                    );
                    if let Err(restore_err) = restore(&swapped) {
                        warn!(error = %restore_err, "Failed to restore all files");
                    }
                    return Err(e);
                }
            }
        }
        Ok(swapped)
    }

    fn swap_one(&self, descriptor: &PatchDescriptor, artifact: &Path) -> UpdateResult<SwappedFile> {
        let live = &descriptor.target_path;

        let mut backup_path = None;
        if !descriptor.is_new_file() && live.exists() {
            let backup = self.storage.backup_path(&descriptor.old_digest);
            let backup_dir = self.storage.backup_dir();
            fs::create_dir_all(&backup_dir).map_err(|e| UpdateError::create_dir(&backup_dir, e))?;
            move_file(live, &backup)?;
            backup_path = Some(backup);
        }

        let installed = install(artifact, live);
        if let Err(e) = installed {
            // Put this file back before the caller restores the rest.
            let file = SwappedFile {
                relative_path: descriptor.relative_path.clone(),
                target_path: live.clone(),
                backup_path,
                new_digest: descriptor.new_digest.clone(),
            };
            if let Err(restore_err) = restore(std::slice::from_ref(&file)) {
                warn!(error = %restore_err, "Failed to restore file after swap error");
            }
            return Err(e);
        }

        debug!(path = %descriptor.relative_path, "Swapped file into place");
        Ok(SwappedFile {
            relative_path: descriptor.relative_path.clone(),
            target_path: live.clone(),
            backup_path,
            new_digest: descriptor.new_digest.clone(),
        })
    }
}

fn check_live(live: &Path, lookup: &DigestLookup, old_digest: &str) -> UpdateResult<()> {
    let actual = match lookup {
        DigestLookup::Present(d) => d.as_str(),
        DigestLookup::Absent => "",
    };
    if actual != old_digest {
        return Err(UpdateError::Verification {
            path: live.to_path_buf(),
            expected: old_digest.to_string(),
            actual: actual.to_string(),
        });
    }
    Ok(())
}

async fn copy_blocking(from: PathBuf, to: PathBuf) -> UpdateResult<()> {
    tokio::task::spawn_blocking(move || {
        fs::copy(&from, &to)
            .map(|_| ())
            .map_err(|e| UpdateError::write(&to, e))
    })
    .await?
}

/// Copy `artifact` over `live`, creating parent directories.
fn install(artifact: &Path, live: &Path) -> UpdateResult<()> {
    if let Some(parent) = live.parent() {
        fs::create_dir_all(parent).map_err(|e| UpdateError::create_dir(parent, e))?;
    }
    fs::copy(artifact, live)
        .map(|_| ())
        .map_err(|e| UpdateError::write(live, e))
}

/// Rename, falling back to copy and remove across devices.
fn move_file(from: &Path, to: &Path) -> UpdateResult<()> {
    if fs::rename(from, to).is_ok() {
        return Ok(());
    }
    fs::copy(from, to).map_err(|e| UpdateError::write(to, e))?;
    fs::remove_file(from).map_err(|e| UpdateError::write(from, e))
}

/// Undo swaps in reverse order.
///
/// Backups are copied rather than moved since identical files share one.
fn restore(swapped: &[SwappedFile]) -> UpdateResult<()> {
    let mut first_error = None;
    for file in swapped.iter().rev() {
        let result = match &file.backup_path {
            Some(backup) => fs::copy(backup, &file.target_path).map(|_| ()),
            None => match fs::remove_file(&file.target_path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        if let Err(e) = result {
            warn!(path = %file.relative_path, error = %e, "Failed to restore file");
            first_error.get_or_insert(UpdateError::write(&file.target_path, e));
        } else {
            debug!(path = %file.relative_path, "Restored file");
        }
    }
    first_error.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::BsdiffEngine;
    use crate::digest::Xxh64Hasher;
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Fixture {
        _temp: TempDir,
        root: PathBuf,
        storage: StorageLayout,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let root = temp.path().join("root");
            let storage = StorageLayout::new(temp.path().join("storage"));
            fs::create_dir_all(&root).unwrap();
            storage.ensure().unwrap();
            Self {
                _temp: temp,
                root,
                storage,
            }
        }

        fn applicator(&self) -> PatchApplicator {
            PatchApplicator::new(
                Arc::new(BsdiffEngine),
                Arc::new(Xxh64Hasher),
                self.storage.clone(),
                ApplyOptions {
                    apply_attempts: 2,
                    apply_retry_delay: Duration::ZERO,
                    ..Default::default()
                },
            )
        }

        fn live(&self, name: &str, content: &[u8]) {
            let path = self.root.join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }

        fn read(&self, name: &str) -> Vec<u8> {
            fs::read(self.root.join(name)).unwrap()
        }

        fn delta(&self, name: &str, old: &[u8], new: &[u8]) -> ResolvedPatch {
            let mut patch = Vec::new();
            qbsdiff::Bsdiff::new(old, new)
                .compare(Cursor::new(&mut patch))
                .unwrap();
            let (d_old, d_new) = (digest(old), digest(new));
            let path = self.storage.delta_path(&d_old, &d_new);
            fs::write(&path, patch).unwrap();
            self.resolved(name, d_old, d_new, PatchSource::Delta(path))
        }

        fn full(&self, name: &str, old: Option<&[u8]>, new: &[u8]) -> ResolvedPatch {
            let d_new = digest(new);
            let path = self.storage.full_path(&d_new);
            fs::write(&path, new).unwrap();
            let d_old = old.map(digest).unwrap_or_default();
            self.resolved(name, d_old, d_new, PatchSource::Full(path))
        }

        fn resolved(&self, name: &str, old: String, new: String, source: PatchSource) -> ResolvedPatch {
            ResolvedPatch {
                descriptor: PatchDescriptor {
                    relative_path: name.to_string(),
                    target_path: self.root.join(name),
                    old_digest: old,
                    new_digest: new,
                },
                source,
                fell_back: false,
            }
        }
    }

    fn digest(data: &[u8]) -> String {
        Xxh64Hasher.digest_bytes(data)
    }

    #[tokio::test]
    async fn test_apply_delta_and_new_file() {
        let fx = Fixture::new();
        fx.live("a.txt", b"hello old world");

        let resolved = vec![
            fx.delta("a.txt", b"hello old world", b"hello new world"),
            fx.full("sub/b.txt", None, b"brand new"),
        ];
        let report = fx
            .applicator()
            .apply(resolved, &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap();

        assert_eq!(fx.read("a.txt"), b"hello new world");
        assert_eq!(fx.read("sub/b.txt"), b"brand new");
        assert_eq!(report.changed(), 2);
        assert_eq!(report.skipped, 0);

        let backup = report.swapped[0].backup_path.as_ref().unwrap();
        assert_eq!(fs::read(backup).unwrap(), b"hello old world");
        assert!(report.swapped[1].backup_path.is_none());
    }

    #[tokio::test]
    async fn test_failed_apply_leaves_root_untouched() {
        let fx = Fixture::new();
        fx.live("a.txt", b"alpha");
        fx.live("b.txt", b"beta");

        let good = fx.full("a.txt", Some(b"alpha"), b"alpha 2");
        let bad = fx.delta("b.txt", b"beta", b"beta 2");
        if let PatchSource::Delta(path) = &bad.source {
            fs::write(path, b"corrupt patch").unwrap();
        }

        let err = fx
            .applicator()
            .apply(vec![good, bad], &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Apply { attempts: 2, .. }));
        assert_eq!(fx.read("a.txt"), b"alpha");
        assert_eq!(fx.read("b.txt"), b"beta");
        assert!(!fx.storage.backup_dir().exists());
    }

    #[tokio::test]
    async fn test_post_check_rejects_wrong_content() {
        let fx = Fixture::new();
        fx.live("a.txt", b"one");

        let mut resolved = fx.full("a.txt", Some(b"one"), b"two");
        resolved.descriptor.new_digest = digest(b"three");
        let full = fx.storage.full_path(&resolved.descriptor.new_digest);
        fs::write(&full, b"two").unwrap();
        resolved.source = PatchSource::Full(full);

        let err = fx
            .applicator()
            .apply(vec![resolved], &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Verification { .. }));
        assert_eq!(fx.read("a.txt"), b"one");
        let leftover_temp = fx.storage.root().join(format!("{}.tmp", digest(b"three")));
        assert!(!leftover_temp.exists());
    }

    #[tokio::test]
    async fn test_pre_check_detects_modified_live_file() {
        let fx = Fixture::new();
        fx.live("a.txt", b"locally edited");

        let resolved = fx.full("a.txt", Some(b"original"), b"updated");
        let applicator = PatchApplicator::new(
            Arc::new(BsdiffEngine),
            Arc::new(Xxh64Hasher),
            fx.storage.clone(),
            ApplyOptions {
                verify_before_patch: true,
                ..Default::default()
            },
        );

        let err = applicator
            .apply(vec![resolved], &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap_err();
        match err {
            UpdateError::Verification { expected, actual, .. } => {
                assert_eq!(expected, digest(b"original"));
                assert_eq!(actual, digest(b"locally edited"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_reapply_is_idempotent() {
        let fx = Fixture::new();
        fx.live("a.txt", b"v1");
        let resolved = vec![fx.full("a.txt", Some(b"v1"), b"v2")];

        let applicator = fx.applicator();
        let first = applicator
            .apply(resolved.clone(), &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap();
        let second = applicator
            .apply(resolved, &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap();

        assert_eq!(first.changed(), 1);
        assert_eq!(second.changed(), 0);
        assert_eq!(second.skipped, 1);
        assert_eq!(fx.read("a.txt"), b"v2");
    }

    #[tokio::test]
    async fn test_swap_failure_restores_earlier_files() {
        let fx = Fixture::new();
        fx.live("b.txt", b"old b");

        // A regular file where the backup directory should be makes the
        // backup of b.txt fail after new.txt was already installed.
        fs::write(fx.storage.backup_dir(), b"in the way").unwrap();

        let resolved = vec![
            fx.full("new.txt", None, b"fresh"),
            fx.full("b.txt", Some(b"old b"), b"new b"),
        ];
        let err = fx
            .applicator()
            .apply(resolved, &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::CreateDirFailed { .. }));
        assert!(!fx.root.join("new.txt").exists());
        assert_eq!(fx.read("b.txt"), b"old b");
    }

    #[tokio::test]
    async fn test_rollback_restores_previous_content() {
        let fx = Fixture::new();
        fx.live("a.txt", b"before");
        let applicator = fx.applicator();

        let report = applicator
            .apply(
                vec![
                    fx.full("a.txt", Some(b"before"), b"after"),
                    fx.full("added.txt", None, b"extra"),
                ],
                &ProgressTracker::silent(),
                &CancelScope::new(),
            )
            .await
            .unwrap();
        assert_eq!(fx.read("a.txt"), b"after");

        applicator.rollback(&report).await.unwrap();
        assert_eq!(fx.read("a.txt"), b"before");
        assert!(!fx.root.join("added.txt").exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_apply() {
        let fx = Fixture::new();
        fx.live("a.txt", b"v1");
        let cancel = CancelScope::new();
        cancel.cancel("user");

        let err = fx
            .applicator()
            .apply(
                vec![fx.full("a.txt", Some(b"v1"), b"v2")],
                &ProgressTracker::silent(),
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(fx.read("a.txt"), b"v1");
    }

    #[test]
    fn test_cleanup_removes_storage() {
        let fx = Fixture::new();
        fx.applicator().cleanup().unwrap();
        assert!(!fx.storage.root().exists());
    }

    #[tokio::test]
    async fn test_identical_files_converge_once() {
        let fx = Fixture::new();
        fx.live("a.bin", b"shared old content");
        fx.live("b.bin", b"shared old content");

        let resolved = vec![
            fx.delta("a.bin", b"shared old content", b"shared new content"),
            fx.delta("b.bin", b"shared old content", b"shared new content"),
            fx.full("c.bin", None, b"shared new content"),
            fx.full("d.bin", None, b"shared new content"),
        ];
        let report = fx
            .applicator()
            .apply(resolved, &ProgressTracker::silent(), &CancelScope::new())
            .await
            .unwrap();

        assert_eq!(report.changed(), 4);
        for name in ["a.bin", "b.bin", "c.bin", "d.bin"] {
            assert_eq!(fx.read(name), b"shared new content");
        }
        let converged = fx.storage.converged_path(&digest(b"shared new content"));
        assert!(report.swapped.iter().all(|f| f.new_digest == digest(b"shared new content")));
        assert!(converged.exists());
        assert!(!converged.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_shared_backup_restores_every_file() {
        let fx = Fixture::new();
        fx.live("a.txt", b"common");
        fx.live("b.txt", b"common");
        let applicator = fx.applicator();

        let report = applicator
            .apply(
                vec![
                    fx.full("a.txt", Some(b"common"), b"new a"),
                    fx.full("b.txt", Some(b"common"), b"new b"),
                ],
                &ProgressTracker::silent(),
                &CancelScope::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.swapped[0].backup_path, report.swapped[1].backup_path);

        applicator.rollback(&report).await.unwrap();
        assert_eq!(fx.read("a.txt"), b"common");
        assert_eq!(fx.read("b.txt"), b"common");
    }

    #[tokio::test]
    async fn test_swap_failure_restores_files_sharing_a_backup() {
        let fx = Fixture::new();
        fx.live("a.txt", b"common");
        fx.live("b.txt", b"common");
        fx.live("c.txt", b"old c");

        // A non-empty directory at c.txt's backup path makes its backup fail
        // after a.txt and b.txt were swapped through the same backup file.
        let blocked = fx.storage.backup_path(&digest(b"old c"));
        fs::create_dir_all(blocked.join("occupied")).unwrap();

        let err = fx
            .applicator()
            .apply(
                vec![
                    fx.full("a.txt", Some(b"common"), b"new a"),
                    fx.full("b.txt", Some(b"common"), b"new b"),
                    fx.full("c.txt", Some(b"old c"), b"new c"),
                ],
                &ProgressTracker::silent(),
                &CancelScope::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::WriteFailed { .. }));
        assert_eq!(fx.read("a.txt"), b"common");
        assert_eq!(fx.read("b.txt"), b"common");
        assert_eq!(fx.read("c.txt"), b"old c");
    }
}

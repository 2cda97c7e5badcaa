//! Layout of the staging storage folder.
//!
//! ```text
//! <storage>/download/<old>_<new>   downloaded delta patches
//! <storage>/download/<new>         downloaded full files
//! <storage>/<new>                  converged artifacts awaiting the swap
//! <storage>/<old>_<new>            leftover local deltas (bundle fallback)
//! <storage>/backup/<old>           live files replaced by the last update
//! <storage>/bundle/                bundle downloads and extraction
//! <storage>/probe/                 mirror probe scratch files
//! ```
//!
//! Every name is a digest, so an interrupted update can resume from whatever
//! the folder already holds.

use std::path::{Path, PathBuf};

use crate::error::{UpdateError, UpdateResult};
use crate::layout::patch_name;

/// Paths inside a staging storage folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageLayout {
    root: PathBuf,
}

impl StorageLayout {
    /// Create a layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The storage folder itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding downloaded artifacts.
    pub fn download_dir(&self) -> PathBuf {
        self.root.join("download")
    }

    /// Downloaded delta patch.
    pub fn delta_path(&self, old_digest: &str, new_digest: &str) -> PathBuf {
        self.download_dir().join(patch_name(old_digest, new_digest))
    }

    /// Downloaded full file.
    pub fn full_path(&self, new_digest: &str) -> PathBuf {
        self.download_dir().join(new_digest)
    }

    /// Converged artifact named by the digest it must have.
    pub fn converged_path(&self, new_digest: &str) -> PathBuf {
        self.root.join(new_digest)
    }

    /// Delta left directly in the storage folder by an earlier run.
    pub fn local_delta_path(&self, old_digest: &str, new_digest: &str) -> PathBuf {
        self.root.join(patch_name(old_digest, new_digest))
    }

    /// Directory holding backups of replaced files.
    pub fn backup_dir(&self) -> PathBuf {
        self.root.join("backup")
    }

    /// Backup of a replaced live file.
    pub fn backup_path(&self, old_digest: &str) -> PathBuf {
        self.backup_dir().join(old_digest)
    }

    /// Scratch directory for bundle downloads.
    pub fn bundle_dir(&self) -> PathBuf {
        self.root.join("bundle")
    }

    /// Scratch directory for mirror probes.
    pub fn probe_dir(&self) -> PathBuf {
        self.root.join("probe")
    }

    /// Create the storage folder and its download directory.
    pub fn ensure(&self) -> UpdateResult<()> {
        let download = self.download_dir();
        std::fs::create_dir_all(&download).map_err(|e| UpdateError::create_dir(download, e))
    }

    /// Delete the storage folder and everything in it.
    pub fn remove(&self) -> UpdateResult<()> {
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(UpdateError::write(&self.root, e)),
        }
    }
}

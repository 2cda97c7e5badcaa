//! Delta patch application.
//!
//! The engine is a seam: anything that turns `(old, patch)` into `new` can be
//! plugged into the applicator. The default engine applies bsdiff 4.0 patches.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::error::{UpdateError, UpdateResult};

/// Applies a binary delta to produce a new file.
///
/// Implementations are called from the blocking pool and may be invoked
/// concurrently for different files.
pub trait DeltaEngine: Send + Sync + fmt::Debug {
    /// Write the result of applying `patch` to `old` into `new`.
    ///
    /// `new` is created or truncated. On error its content is unspecified.
    fn apply(&self, old: &Path, patch: &Path, new: &Path) -> UpdateResult<()>;
}

/// bsdiff 4.0 engine backed by `qbsdiff`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BsdiffEngine;

impl DeltaEngine for BsdiffEngine {
    fn apply(&self, old: &Path, patch: &Path, new: &Path) -> UpdateResult<()> {
        let source = fs::read(old).map_err(|e| UpdateError::read(old, e))?;
        let delta = fs::read(patch).map_err(|e| UpdateError::read(patch, e))?;

        let patcher = qbsdiff::Bspatch::new(&delta).map_err(|e| UpdateError::Apply {
            path: patch.to_path_buf(),
            attempts: 1,
            reason: format!("invalid patch: {}", e),
        })?;

        let file = File::create(new).map_err(|e| UpdateError::write(new, e))?;
        let mut writer = BufWriter::new(file);
        patcher
            .apply(&source, &mut writer)
            .map_err(|e| UpdateError::Apply {
                path: old.to_path_buf(),
                attempts: 1,
                reason: e.to_string(),
            })?;
        writer.flush().map_err(|e| UpdateError::write(new, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn make_patch(source: &[u8], target: &[u8]) -> Vec<u8> {
        let mut patch = Vec::new();
        qbsdiff::Bsdiff::new(source, target)
            .compare(Cursor::new(&mut patch))
            .unwrap();
        patch
    }

    #[test]
    fn test_apply_bsdiff_patch() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let patch = dir.path().join("patch");
        let new = dir.path().join("new");

        let source = b"the quick brown fox jumps over the lazy dog".repeat(20);
        let mut target = source.clone();
        target.extend_from_slice(b" and keeps running");
        fs::write(&old, &source).unwrap();
        fs::write(&patch, make_patch(&source, &target)).unwrap();

        BsdiffEngine.apply(&old, &patch, &new).unwrap();
        assert_eq!(fs::read(&new).unwrap(), target);
    }

    #[test]
    fn test_garbage_patch_is_apply_error() {
        let dir = TempDir::new().unwrap();
        let old = dir.path().join("old");
        let patch = dir.path().join("patch");
        fs::write(&old, b"content").unwrap();
        fs::write(&patch, b"not a bsdiff patch").unwrap();

        let err = BsdiffEngine
            .apply(&old, &patch, &dir.path().join("new"))
            .unwrap_err();
        assert!(matches!(err, UpdateError::Apply { .. }));
    }

    #[test]
    fn test_missing_old_file() {
        let dir = TempDir::new().unwrap();
        let patch = dir.path().join("patch");
        fs::write(&patch, make_patch(b"a", b"b")).unwrap();

        let err = BsdiffEngine
            .apply(&dir.path().join("missing"), &patch, &dir.path().join("new"))
            .unwrap_err();
        assert!(matches!(err, UpdateError::ReadFailed { .. }));
    }
}

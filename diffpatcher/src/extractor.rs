//! Archive extraction for update bundles.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::Path;

use zip::ZipArchive;

use crate::error::{UpdateError, UpdateResult};

/// Unpacks bundle archives.
pub trait ArchiveExtractor: Send + Sync + fmt::Debug {
    /// Extract `archive` into `dest_dir`, returning the number of files written.
    fn extract(&self, archive: &Path, dest_dir: &Path) -> UpdateResult<usize>;

    /// List the file entries of `archive` without extracting.
    fn list_contents(&self, archive: &Path) -> UpdateResult<Vec<String>>;
}

/// Zip extractor backed by the `zip` crate.
///
/// Entries whose names escape the destination directory are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct ZipExtractor;

impl ZipExtractor {
    fn open(archive: &Path) -> UpdateResult<ZipArchive<BufReader<File>>> {
        let file = File::open(archive).map_err(|e| UpdateError::read(archive, e))?;
        ZipArchive::new(BufReader::new(file)).map_err(|e| extraction(archive, e))
    }
}

impl ArchiveExtractor for ZipExtractor {
    fn extract(&self, archive_path: &Path, dest_dir: &Path) -> UpdateResult<usize> {
        let mut archive = Self::open(archive_path)?;
        fs::create_dir_all(dest_dir).map_err(|e| UpdateError::create_dir(dest_dir, e))?;

        let mut count = 0;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| extraction(archive_path, e))?;
            let Some(relative) = entry.enclosed_name() else {
                tracing::warn!(entry = entry.name(), "Skipping unsafe archive entry");
                continue;
            };
            let out_path = dest_dir.join(relative);

            if entry.is_dir() {
                fs::create_dir_all(&out_path)
                    .map_err(|e| UpdateError::create_dir(&out_path, e))?;
                continue;
            }

            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| UpdateError::create_dir(parent, e))?;
            }
            let mut out = File::create(&out_path).map_err(|e| UpdateError::write(&out_path, e))?;
            io::copy(&mut entry, &mut out).map_err(|e| UpdateError::write(&out_path, e))?;
            count += 1;
        }

        tracing::debug!(
            archive = %archive_path.display(),
            dest = %dest_dir.display(),
            files = count,
            "Extracted archive"
        );
        Ok(count)
    }

    fn list_contents(&self, archive_path: &Path) -> UpdateResult<Vec<String>> {
        let mut archive = Self::open(archive_path)?;
        let mut files = Vec::new();
        for i in 0..archive.len() {
            let entry = archive
                .by_index_raw(i)
                .map_err(|e| extraction(archive_path, e))?;
            if !entry.is_dir() {
                files.push(entry.name().to_string());
            }
        }
        Ok(files)
    }
}

fn extraction(path: &Path, err: impl fmt::Display) -> UpdateError {
    UpdateError::Extraction {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

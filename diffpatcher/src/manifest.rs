//! Version manifests.
//!
//! A manifest is the authoritative description of what an artifact root must
//! contain for one version: one `"<relative_path>\t<digest>"` line per file.

use std::collections::HashSet;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use crate::error::{UpdateError, UpdateResult};

/// One file of a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the artifact root, `/`-separated.
    pub relative_path: String,
    /// Content digest of the file.
    pub digest: String,
}

impl FileEntry {
    /// Create a new entry.
    pub fn new(relative_path: impl Into<String>, digest: impl Into<String>) -> Self {
        Self {
            relative_path: relative_path.into(),
            digest: digest.into(),
        }
    }

    /// Local path of this entry below `root`.
    pub fn local_path(&self, root: &Path) -> PathBuf {
        self.relative_path
            .split('/')
            .filter(|s| !s.is_empty())
            .fold(root.to_path_buf(), |path, segment| path.join(segment))
    }
}

/// Ordered list of file entries with unique paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    entries: Vec<FileEntry>,
}

impl Manifest {
    /// Build a manifest from entries, validating paths and uniqueness.
    pub fn from_entries(entries: Vec<FileEntry>) -> UpdateResult<Self> {
        let mut seen = HashSet::new();
        for (index, entry) in entries.iter().enumerate() {
            validate_path(&entry.relative_path, index + 1)?;
            if entry.digest.is_empty() {
                return Err(UpdateError::ManifestParse {
                    line: index + 1,
                    reason: format!("empty digest for {}", entry.relative_path),
                });
            }
            if !seen.insert(entry.relative_path.as_str()) {
                return Err(UpdateError::ManifestParse {
                    line: index + 1,
                    reason: format!("duplicate path {}", entry.relative_path),
                });
            }
        }
        Ok(Self { entries })
    }

    /// Parse manifest text.
    ///
    /// Lines are trimmed and blank lines skipped; every other line must be
    /// `<relative_path>\t<digest>`.
    pub fn parse(text: &str) -> UpdateResult<Self> {
        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        for (index, raw) in text.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let (path, digest) = line.split_once('\t').ok_or_else(|| UpdateError::ManifestParse {
                line: line_no,
                reason: "expected <path>\\t<digest>".to_string(),
            })?;
            let path = path.trim();
            let digest = digest.trim();

            if digest.is_empty() || digest.contains(char::is_whitespace) {
                return Err(UpdateError::ManifestParse {
                    line: line_no,
                    reason: format!("invalid digest {:?}", digest),
                });
            }
            validate_path(path, line_no)?;
            if !seen.insert(path.to_string()) {
                return Err(UpdateError::ManifestParse {
                    line: line_no,
                    reason: format!("duplicate path {}", path),
                });
            }

            entries.push(FileEntry::new(path, digest));
        }

        Ok(Self { entries })
    }

    /// Entries in manifest order.
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the manifest lists no files.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find the entry for a relative path.
    pub fn get(&self, relative_path: &str) -> Option<&FileEntry> {
        self.entries
            .iter()
            .find(|e| e.relative_path == relative_path)
    }
}

impl fmt::Display for Manifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines: Vec<String> = self
            .entries
            .iter()
            .map(|e| format!("{}\t{}", e.relative_path, e.digest))
            .collect();
        f.write_str(&lines.join("\n"))
    }
}

/// Reject paths that would escape the artifact root.
fn validate_path(path: &str, line: usize) -> UpdateResult<()> {
    let invalid = |reason: &str| UpdateError::ManifestParse {
        line,
        reason: format!("{}: {}", reason, path),
    };

    if path.is_empty() {
        return Err(invalid("empty path"));
    }
    if path.starts_with('/') || path.starts_with('\\') {
        return Err(invalid("absolute path"));
    }
    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(invalid("path escapes the artifact root")),
        }
    }
    if path.split(['/', '\\']).any(|s| s == "..") {
        return Err(invalid("path escapes the artifact root"));
    }
    Ok(())
}

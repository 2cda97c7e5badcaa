//! Manifest-driven diff resolution.
//!
//! Compares every manifest entry with the local artifact root and produces
//! the list of files that must change. Files whose digest already matches are
//! left out, which is the only thing preventing redundant transfers.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::cancel::CancelScope;
use crate::digest::{lookup_async, ContentHasher, DigestLookup};
use crate::error::{UpdateError, UpdateResult};
use crate::layout::patch_name;
use crate::manifest::Manifest;

/// One file that must be converged to a new digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchDescriptor {
    /// Manifest path, `/`-separated.
    pub relative_path: String,
    /// Live path below the artifact root.
    pub target_path: PathBuf,
    /// Digest of the local file, empty if there is none.
    pub old_digest: String,
    /// Digest the file must have after the update.
    pub new_digest: String,
}

impl PatchDescriptor {
    /// Returns true if there is no local file to patch.
    pub fn is_new_file(&self) -> bool {
        self.old_digest.is_empty()
    }

    /// CDN name of the delta for this descriptor, if one can exist.
    pub fn patch_name(&self) -> Option<String> {
        (!self.is_new_file()).then(|| patch_name(&self.old_digest, &self.new_digest))
    }
}

/// Computes the files needed to move an artifact root to a manifest.
#[derive(Debug, Clone)]
pub struct DiffResolver {
    hasher: Arc<dyn ContentHasher>,
    concurrency: usize,
}

impl DiffResolver {
    /// Create a resolver digesting up to `concurrency` files at once.
    pub fn new(hasher: Arc<dyn ContentHasher>, concurrency: usize) -> Self {
        Self {
            hasher,
            concurrency: concurrency.max(1),
        }
    }

    /// Resolve the descriptors needed to bring `root` to `manifest`.
    ///
    /// The result keeps manifest order. A missing local file yields a
    /// descriptor with an empty `old_digest`; any other read error is fatal.
    pub async fn resolve(
        &self,
        manifest: &Manifest,
        root: &Path,
        cancel: &CancelScope,
    ) -> UpdateResult<Vec<PatchDescriptor>> {
        cancel.check()?;

        let lookups = stream::iter(manifest.entries().iter().cloned().enumerate())
            .map(|(index, entry)| {
                let hasher = Arc::clone(&self.hasher);
                let path = entry.local_path(root);
                async move {
                    let lookup = lookup_async(hasher, path.clone()).await?;
                    Ok::<_, UpdateError>((index, entry, path, lookup))
                }
            })
            .buffer_unordered(self.concurrency)
            .try_collect::<Vec<_>>();

        let mut lookups = cancel.guard(lookups).await?;
        lookups.sort_by_key(|(index, ..)| *index);

        let needed: Vec<PatchDescriptor> = lookups
            .into_iter()
            .filter_map(|(_, entry, path, lookup)| {
                if lookup.matches(&entry.digest) {
                    return None;
                }
                let old_digest = match lookup {
                    DigestLookup::Present(d) => d,
                    DigestLookup::Absent => String::new(),
                };
                debug!(
                    path = %entry.relative_path,
                    old = %old_digest,
                    new = %entry.digest,
                    "File needs update"
                );
                Some(PatchDescriptor {
                    relative_path: entry.relative_path,
                    target_path: path,
                    old_digest,
                    new_digest: entry.digest,
                })
            })
            .collect();

        info!(
            needed = needed.len(),
            total = manifest.len(),
            "Resolved local differences"
        );
        Ok(needed)
    }
}

/// Group indexed items by the new digest of their descriptor.
///
/// Groups keep first-appearance order and items keep input order within a
/// group. Files sharing content share one staging artifact, so each group
/// must be acquired and converged by a single task.
pub(crate) fn group_by_new_digest<T>(
    items: impl IntoIterator<Item = (usize, T)>,
    descriptor: impl Fn(&T) -> &PatchDescriptor,
) -> Vec<Vec<(usize, T)>> {
    let mut slots: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<Vec<(usize, T)>> = Vec::new();
    for (index, item) in items {
        let digest = descriptor(&item).new_digest.clone();
        match slots.get(&digest) {
            Some(&slot) => groups[slot].push((index, item)),
            None => {
                slots.insert(digest, groups.len());
                groups.push(vec![(index, item)]);
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::Xxh64Hasher;
    use crate::manifest::FileEntry;
    use std::fs;
    use tempfile::TempDir;

    fn digest(data: &[u8]) -> String {
        Xxh64Hasher.digest_bytes(data)
    }

    fn resolver() -> DiffResolver {
        DiffResolver::new(Arc::new(Xxh64Hasher), 4)
    }

    #[tokio::test]
    async fn test_resolve_changed_and_new_files() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a.txt"), "old a").unwrap();
        fs::write(root.path().join("same.txt"), "same").unwrap();

        let d1 = digest(b"old a");
        let d2 = digest(b"new a");
        let d3 = digest(b"new b");
        let manifest = Manifest::from_entries(vec![
            FileEntry::new("a.txt", d2.clone()),
            FileEntry::new("b.txt", d3.clone()),
            FileEntry::new("same.txt", digest(b"same")),
        ])
        .unwrap();

        let needed = resolver()
            .resolve(&manifest, root.path(), &CancelScope::new())
            .await
            .unwrap();

        assert_eq!(needed.len(), 2);
        assert_eq!(needed[0].relative_path, "a.txt");
        assert_eq!(needed[0].old_digest, d1);
        assert_eq!(needed[0].new_digest, d2);
        assert_eq!(needed[0].patch_name(), Some(format!("{}_{}", d1, d2)));
        assert_eq!(needed[1].relative_path, "b.txt");
        assert!(needed[1].is_new_file());
        assert_eq!(needed[1].new_digest, d3);
        assert_eq!(needed[1].patch_name(), None);
        assert_eq!(needed[1].target_path, root.path().join("b.txt"));
    }

    #[tokio::test]
    async fn test_resolve_converged_root_is_empty() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("lib")).unwrap();
        fs::write(root.path().join("lib/x.so"), "x").unwrap();

        let manifest =
            Manifest::from_entries(vec![FileEntry::new("lib/x.so", digest(b"x"))]).unwrap();

        let needed = resolver()
            .resolve(&manifest, root.path(), &CancelScope::new())
            .await
            .unwrap();
        assert!(needed.is_empty());
    }

    #[tokio::test]
    async fn test_resolve_directory_in_place_of_file_is_fatal() {
        let root = TempDir::new().unwrap();
        fs::create_dir_all(root.path().join("a.txt")).unwrap();
        let manifest = Manifest::from_entries(vec![FileEntry::new("a.txt", "00")]).unwrap();

        let result = resolver()
            .resolve(&manifest, root.path(), &CancelScope::new())
            .await;
        assert!(matches!(result, Err(UpdateError::ReadFailed { .. })));
    }

    #[tokio::test]
    async fn test_resolve_cancelled() {
        let root = TempDir::new().unwrap();
        let cancel = CancelScope::new();
        cancel.cancel("user");

        let result = resolver()
            .resolve(&Manifest::default(), root.path(), &cancel)
            .await;
        assert!(result.unwrap_err().is_cancelled());
    }

    #[test]
    fn test_group_by_new_digest() {
        let desc = |name: &str, new: &str| PatchDescriptor {
            relative_path: name.to_string(),
            target_path: PathBuf::from(name),
            old_digest: String::new(),
            new_digest: new.to_string(),
        };
        let items = vec![
            (0, desc("a", "n1")),
            (1, desc("b", "n2")),
            (2, desc("c", "n1")),
            (3, desc("d", "n1")),
        ];

        let groups = group_by_new_digest(items, |d| d);

        let names: Vec<Vec<(usize, &str)>> = groups
            .iter()
            .map(|g| g.iter().map(|(i, d)| (*i, d.relative_path.as_str())).collect())
            .collect();
        assert_eq!(
            names,
            vec![vec![(0, "a"), (2, "c"), (3, "d")], vec![(1, "b")]]
        );
    }
}

//! CDN wire layout.
//!
//! ```text
//! <base_url>/latest                          version string
//! <base_url>/manifest/<version>              "<relative_path>\t<digest>" lines
//! <base_url>/files/<digest>                  full file content
//! <base_url>/patch/<oldDigest>_<newDigest>   delta patch
//! ```
//!
//! Paths are literal and case-sensitive. A `file://` base URL points at a
//! local directory with the same layout.

use std::path::PathBuf;

use reqwest::Url;

/// Scheme prefix for local-filesystem URLs.
pub const FILE_SCHEME: &str = "file://";

/// Name of the patch transforming `old_digest` content into `new_digest`.
pub fn patch_name(old_digest: &str, new_digest: &str) -> String {
    format!("{}_{}", old_digest, new_digest)
}

/// URL layout rooted at one mirror's base URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    base: String,
}

impl RemoteLayout {
    /// Create a layout for `base_url`. Trailing slashes are ignored.
    pub fn new(base_url: impl AsRef<str>) -> Self {
        Self {
            base: base_url.as_ref().trim_end_matches('/').to_string(),
        }
    }

    /// The normalised base URL.
    pub fn base(&self) -> &str {
        &self.base
    }

    /// URL of the latest-version pointer.
    pub fn latest_url(&self) -> String {
        self.join("latest")
    }

    /// URL of the manifest for `version`.
    pub fn manifest_url(&self, version: &str) -> String {
        self.join(&format!("manifest/{}", version))
    }

    /// URL of the full file with `digest`.
    pub fn file_url(&self, digest: &str) -> String {
        self.join(&format!("files/{}", digest))
    }

    /// URL of the patch from `old_digest` to `new_digest`.
    pub fn patch_url(&self, old_digest: &str, new_digest: &str) -> String {
        self.join(&format!("patch/{}", patch_name(old_digest, new_digest)))
    }

    /// Path suffix of the manifest for `version`, used as a mirror probe.
    ///
    /// A manifest listing at least one file is never empty, unlike the
    /// files it names.
    pub fn manifest_suffix(version: &str) -> String {
        format!("/manifest/{}", version)
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{}", self.base, path)
    }
}

/// Resolve a `file://` URL to a local path.
///
/// Returns `None` for any other scheme.
pub fn local_path(url: &str) -> Option<PathBuf> {
    if !url.starts_with(FILE_SCHEME) {
        return None;
    }
    Url::parse(url)
        .ok()
        .and_then(|u| u.to_file_path().ok())
        .or_else(|| Some(PathBuf::from(&url[FILE_SCHEME.len()..])))
}

/// Build a `file://` URL for a local directory or file.
pub fn file_url(path: &std::path::Path) -> String {
    match Url::from_file_path(path) {
        Ok(url) => url.to_string(),
        Err(()) => format!("{}{}", FILE_SCHEME, path.display()),
    }
}

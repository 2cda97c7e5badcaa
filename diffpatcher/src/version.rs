//! Installed-version marker and version ordering.
//!
//! Every artifact root carries a `.version` file with the installed version
//! string. Versions follow the publisher's `<number>[.<number>]*` format and
//! are ordered with `semver` after padding to three components.

use std::cmp::Ordering;
use std::fs;
use std::io::{self, Write};
use std::path::Path;

use semver::Version;
use tempfile::NamedTempFile;

use crate::error::{UpdateError, UpdateResult};

/// Name of the version marker file inside an artifact root.
pub const VERSION_FILE: &str = ".version";

/// Parse a publisher version string into a comparable [`Version`].
///
/// `"1"` and `"1.2"` are padded to `1.0.0` and `1.2.0`. Full semver strings
/// (with pre-release or build metadata) are accepted as-is.
pub fn parse_version(raw: &str) -> UpdateResult<Version> {
    let trimmed = raw.trim();
    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    let parts: Vec<&str> = trimmed.split('.').collect();
    if parts.is_empty()
        || parts.len() > 3
        || parts
            .iter()
            .any(|p| p.is_empty() || !p.chars().all(|c| c.is_ascii_digit()))
    {
        return Err(UpdateError::InvalidVersion(raw.to_string()));
    }

    let mut padded: Vec<&str> = parts.clone();
    while padded.len() < 3 {
        padded.push("0");
    }
    Version::parse(&padded.join(".")).map_err(|_| UpdateError::InvalidVersion(raw.to_string()))
}

/// Compare two publisher version strings.
///
/// Versions with more than three numeric components are compared
/// component-wise.
pub fn compare_versions(a: &str, b: &str) -> UpdateResult<Ordering> {
    match (parse_version(a), parse_version(b)) {
        (Ok(a), Ok(b)) => Ok(a.cmp(&b)),
        _ => {
            let a_parts = numeric_components(a)?;
            let b_parts = numeric_components(b)?;
            Ok(a_parts.cmp(&b_parts))
        }
    }
}

/// Returns true if `remote` should replace `local`.
///
/// With no local version every remote version qualifies.
pub fn is_newer(remote: &str, local: Option<&str>) -> UpdateResult<bool> {
    match local {
        None => {
            // Still validate the remote string.
            compare_versions(remote, remote)?;
            Ok(true)
        }
        Some(local) => Ok(compare_versions(remote, local)? == Ordering::Greater),
    }
}

fn numeric_components(raw: &str) -> UpdateResult<Vec<u64>> {
    let trimmed = raw.trim();
    let mut parts: Vec<u64> = trimmed
        .split('.')
        .map(|p| p.parse::<u64>())
        .collect::<Result<_, _>>()
        .map_err(|_| UpdateError::InvalidVersion(raw.to_string()))?;
    while parts.len() > 1 && parts.last() == Some(&0) {
        parts.pop();
    }
    Ok(parts)
}

/// Read the installed version of an artifact root.
///
/// Returns `None` if the marker does not exist.
pub fn read_local_version(root: &Path) -> UpdateResult<Option<String>> {
    let path = root.join(VERSION_FILE);
    match fs::read_to_string(&path) {
        Ok(content) => {
            let version = content.trim();
            if version.is_empty() {
                Ok(None)
            } else {
                Ok(Some(version.to_string()))
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(UpdateError::read(path, e)),
    }
}

/// Atomically write the version marker of an artifact root.
pub fn write_local_version(root: &Path, version: &str) -> UpdateResult<()> {
    fs::create_dir_all(root).map_err(|e| UpdateError::create_dir(root, e))?;
    let path = root.join(VERSION_FILE);

    let mut temp = NamedTempFile::new_in(root).map_err(|e| UpdateError::write(&path, e))?;
    temp.write_all(version.trim().as_bytes())
        .map_err(|e| UpdateError::write(&path, e))?;
    temp.flush().map_err(|e| UpdateError::write(&path, e))?;
    temp.persist(&path)
        .map_err(|e| UpdateError::write(&path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_version_pads_components() {
        assert_eq!(parse_version("1").unwrap(), Version::new(1, 0, 0));
        assert_eq!(parse_version("0.0.3").unwrap(), Version::new(0, 0, 3));
        assert_eq!(parse_version(" 1.2 ").unwrap(), Version::new(1, 2, 0));
    }

    #[test]
    fn test_parse_version_rejects_garbage() {
        assert!(parse_version("").is_err());
        assert!(parse_version("v1.x").is_err());
        assert!(parse_version("1..2").is_err());
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("0.0.3", "0.0.2").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("0.0.2", "0.0.2").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("0.0.10", "0.0.9").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert_eq!(compare_versions("1.2.3.4", "1.2.3").unwrap(), Ordering::Greater);
        assert_eq!(compare_versions("1.2.3.0", "1.2.3").unwrap(), Ordering::Equal);
    }

    #[test]
    fn test_is_newer_never_downgrades() {
        assert!(!is_newer("0.0.2", Some("0.0.2")).unwrap());
        assert!(!is_newer("0.0.1", Some("0.0.2")).unwrap());
        assert!(is_newer("0.0.3", Some("0.0.2")).unwrap());
        assert!(is_newer("0.0.1", None).unwrap());
        assert!(is_newer("garbage", None).is_err());
    }

    #[test]
    fn test_local_version_round_trip() {
        let temp = TempDir::new().unwrap();
        assert_eq!(read_local_version(temp.path()).unwrap(), None);

        write_local_version(temp.path(), "0.0.3\n").unwrap();
        assert_eq!(
            read_local_version(temp.path()).unwrap().as_deref(),
            Some("0.0.3")
        );

        write_local_version(temp.path(), "0.0.4").unwrap();
        assert_eq!(
            fs::read_to_string(temp.path().join(VERSION_FILE)).unwrap(),
            "0.0.4"
        );
    }

    proptest! {
        #[test]
        fn prop_compare_matches_numeric_order(
            a in proptest::collection::vec(0u32..1000, 3),
            b in proptest::collection::vec(0u32..1000, 3),
        ) {
            let a_str = a.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(".");
            let b_str = b.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(".");
            prop_assert_eq!(compare_versions(&a_str, &b_str).unwrap(), a.cmp(&b));
        }
    }
}

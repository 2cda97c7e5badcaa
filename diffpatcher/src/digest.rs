//! Content digests used for addressing and integrity checks.
//!
//! The CDN addresses full files and patches by digest, so the client must
//! produce byte-exact tokens: xxh64 with seed 0, rendered as 16 lowercase hex
//! characters. A SHA-256 hasher is available for deployments that cannot
//! trust their mirrors.

use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use xxhash_rust::xxh64::Xxh64;

use crate::error::{UpdateError, UpdateResult};

/// Buffer size for reading files during digest calculation (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of digesting a local path that may not exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestLookup {
    /// The file exists and has this digest.
    Present(String),
    /// There is no file at the path.
    Absent,
}

impl DigestLookup {
    /// The digest, or the empty string for an absent file.
    pub fn into_token(self) -> String {
        match self {
            Self::Present(digest) => digest,
            Self::Absent => String::new(),
        }
    }

    /// Returns true if the file exists and has the given digest.
    pub fn matches(&self, expected: &str) -> bool {
        matches!(self, Self::Present(d) if d == expected)
    }
}

/// Content hash producing fixed-format hex tokens.
pub trait ContentHasher: Send + Sync + fmt::Debug {
    /// Digest everything readable from `reader`.
    fn digest_reader(&self, reader: &mut dyn Read) -> io::Result<String>;

    /// Digest an in-memory buffer.
    fn digest_bytes(&self, bytes: &[u8]) -> String {
        let mut cursor = io::Cursor::new(bytes);
        // Reading from an in-memory cursor cannot fail.
        self.digest_reader(&mut cursor).unwrap_or_default()
    }

    /// Digest a file that is expected to exist.
    fn digest_file(&self, path: &Path) -> UpdateResult<String> {
        let mut file = File::open(path).map_err(|e| UpdateError::read(path, e))?;
        self.digest_reader(&mut file)
            .map_err(|e| UpdateError::read(path, e))
    }

    /// Digest a file, reporting a missing file as [`DigestLookup::Absent`].
    ///
    /// Any other read failure (including the path being a directory) is an
    /// error.
    fn lookup(&self, path: &Path) -> UpdateResult<DigestLookup> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(DigestLookup::Absent),
            Err(e) => return Err(UpdateError::read(path, e)),
        };
        let is_dir = file
            .metadata()
            .map_err(|e| UpdateError::read(path, e))?
            .is_dir();
        if is_dir {
            return Err(UpdateError::read(
                path,
                io::Error::new(io::ErrorKind::Other, "expected a file, found a directory"),
            ));
        }
        self.digest_reader(&mut file)
            .map(DigestLookup::Present)
            .map_err(|e| UpdateError::read(path, e))
    }
}

/// xxh64 (seed 0) hasher matching the publisher's digests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Xxh64Hasher;

impl ContentHasher for Xxh64Hasher {
    fn digest_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Xxh64::new(0);
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(format!("{:016x}", hasher.digest()))
    }
}

/// SHA-256 hasher for mirrors outside the trust boundary.
///
/// Tokens are 64 lowercase hex characters; the publisher must emit the same
/// digests for this hasher to be usable.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sha256Hasher;

impl ContentHasher for Sha256Hasher {
    fn digest_reader(&self, reader: &mut dyn Read) -> io::Result<String> {
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let bytes_read = reader.read(&mut buffer)?;
            if bytes_read == 0 {
                break;
            }
            hasher.update(&buffer[..bytes_read]);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Look up a digest on the blocking pool.
pub async fn lookup_async(
    hasher: Arc<dyn ContentHasher>,
    path: PathBuf,
) -> UpdateResult<DigestLookup> {
    tokio::task::spawn_blocking(move || hasher.lookup(&path)).await?
}

/// Verify on the blocking pool that `path` digests to `expected`.
pub async fn verify_async(
    hasher: Arc<dyn ContentHasher>,
    path: PathBuf,
    expected: String,
) -> UpdateResult<()> {
    tokio::task::spawn_blocking(move || {
        let actual = hasher.digest_file(&path)?;
        if actual != expected {
            return Err(UpdateError::Verification {
                path,
                expected,
                actual,
            });
        }
        Ok(())
    })
    .await?
}

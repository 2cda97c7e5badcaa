//! diffpatcher - Delta-first updates from content-addressed mirrors
//!
//! This library keeps a local artifact root in sync with a versioned release
//! published on one or more CDN mirrors. Files are addressed by content
//! digest; changed files are fetched as binary deltas when available and as
//! full files otherwise, converged in a staging folder, verified, and only
//! then swapped into place.
//!
//! ```no_run
//! use diffpatcher::{CancelScope, ClientConfig, UpdateClient, UpdateOptions};
//!
//! # async fn run() -> diffpatcher::UpdateResult<()> {
//! let config = ClientConfig::new("/opt/app")
//!     .with_mirror("https://cdn.example.com/update/app")
//!     .with_storage("/var/cache/app-update");
//! let client = UpdateClient::new(config)?;
//! let outcome = client
//!     .update(&UpdateOptions::default(), &CancelScope::new())
//!     .await?;
//! println!("installed: {:?}", outcome.version());
//! # Ok(())
//! # }
//! ```

pub mod applicator;
pub mod bundle;
pub mod cancel;
pub mod client;
pub mod config;
pub mod delta;
pub mod digest;
pub mod error;
pub mod extractor;
pub mod fetch;
pub mod layout;
pub mod logging;
pub mod manifest;
pub mod mirror;
pub mod progress;
pub mod resolver;
pub mod storage;
pub mod transport;
pub mod version;

#[cfg(test)]
mod testing;

pub use applicator::{ApplyOptions, ApplyReport, PatchApplicator, SwappedFile};
pub use bundle::{BundleHeader, BundleWorkflow, PreUpdateHook};
pub use cancel::CancelScope;
pub use client::{UpdateClient, UpdateOutcome, UpdateStatus};
pub use config::{BundleOptions, ClientConfig, UpdateOptions};
pub use delta::{BsdiffEngine, DeltaEngine};
pub use digest::{ContentHasher, DigestLookup, Sha256Hasher, Xxh64Hasher};
pub use error::{ErrorKind, UpdateError, UpdateResult};
pub use extractor::{ArchiveExtractor, ZipExtractor};
pub use fetch::{FetchOrchestrator, PatchSource, ResolvedPatch};
pub use manifest::{FileEntry, Manifest};
pub use mirror::{MirrorSelector, ProbeOptions, ProbeResult};
pub use progress::{FileTransfer, ProgressCallback, ProgressEvent, ProgressTracker, Stage};
pub use resolver::{DiffResolver, PatchDescriptor};
pub use storage::StorageLayout;
pub use transport::{HttpTransport, Transport};

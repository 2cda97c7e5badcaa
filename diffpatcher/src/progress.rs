//! Progress reporting for update operations.
//!
//! Progress is purely informational: the engine emits immutable
//! [`ProgressEvent`] snapshots at stage transitions and whenever a transfer
//! advances, and never reads them back for control decisions.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

/// Progress callback receiving stage-tagged snapshots.
pub type ProgressCallback = Arc<dyn Fn(&ProgressEvent) + Send + Sync>;

/// Per-transfer byte callback: `(transferred, total)`.
///
/// `total` is `None` when the size is not known up front.
pub type TransferCallback = dyn Fn(u64, Option<u64>) + Send + Sync;

/// Stages of the two update flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// Reading the installed `.version` marker.
    ReadLocalVersion,
    /// Fetching the remote `latest` pointer.
    FetchRemoteVersion,
    /// Fetching the manifest of the target version.
    FetchManifest,
    /// Digesting local files against the manifest.
    VerifyLocalFiles,
    /// Downloading patches and full files.
    DownloadPatch,
    /// Applying patches and swapping files into place.
    PatchFile,
    /// Selecting a mirror and downloading a bundle.
    FetchBundle,
    /// Extracting the bundle and checking its precondition.
    VerifyBundle,
    /// Applying the bundle or reinstalling from the full bundle.
    InstallBundle,
}

impl Stage {
    /// Stages of the versioned (manifest driven) flow, in order.
    pub const VERSIONED: [Stage; 6] = [
        Stage::ReadLocalVersion,
        Stage::FetchRemoteVersion,
        Stage::FetchManifest,
        Stage::VerifyLocalFiles,
        Stage::DownloadPatch,
        Stage::PatchFile,
    ];

    /// Stages of the simple bundle flow, in order.
    pub const BUNDLE: [Stage; 3] = [Stage::FetchBundle, Stage::VerifyBundle, Stage::InstallBundle];

    /// Get a human-readable name for the stage.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadLocalVersion => "Reading local version",
            Self::FetchRemoteVersion => "Fetching remote version",
            Self::FetchManifest => "Fetching manifest",
            Self::VerifyLocalFiles => "Verifying local files",
            Self::DownloadPatch => "Downloading patches",
            Self::PatchFile => "Patching files",
            Self::FetchBundle => "Fetching bundle",
            Self::VerifyBundle => "Verifying bundle",
            Self::InstallBundle => "Installing bundle",
        }
    }

    /// 1-based position of the stage within its flow, and the flow length.
    pub fn step(&self) -> (usize, usize) {
        let flow: &[Stage] = if Self::VERSIONED.contains(self) {
            &Self::VERSIONED
        } else {
            &Self::BUNDLE
        };
        let index = flow.iter().position(|s| s == self).unwrap_or(0);
        (index + 1, flow.len())
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte progress of one in-flight transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileTransfer {
    /// Display name (relative path or artifact name).
    pub name: String,
    /// Bytes transferred so far.
    pub transferred: u64,
    /// Total bytes, if known.
    pub total: Option<u64>,
}

/// Immutable progress snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Current stage.
    pub stage: Stage,
    /// 1-based index of the stage within its flow.
    pub step_index: usize,
    /// Number of stages in the flow.
    pub total_steps: usize,
    /// Transfers currently in flight.
    pub transfers: Vec<FileTransfer>,
}

impl ProgressEvent {
    /// Total bytes transferred across the in-flight transfers.
    pub fn transferred_bytes(&self) -> u64 {
        self.transfers.iter().map(|t| t.transferred).sum()
    }
}

#[derive(Debug)]
struct TrackerState {
    stage: Stage,
    in_flight: BTreeMap<usize, FileTransfer>,
}

/// Aggregates per-transfer updates into [`ProgressEvent`] snapshots.
///
/// Cheap to clone; all clones share the same state and callback.
#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<Mutex<TrackerState>>,
    callback: Option<ProgressCallback>,
}

impl fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("state", &self.state)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}

impl ProgressTracker {
    /// Create a tracker forwarding snapshots to `callback`.
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState {
                stage: Stage::ReadLocalVersion,
                in_flight: BTreeMap::new(),
            })),
            callback,
        }
    }

    /// A tracker that discards every event.
    pub fn silent() -> Self {
        Self::new(None)
    }

    /// Enter a new stage and emit a snapshot.
    pub fn stage(&self, stage: Stage) {
        let event = {
            let mut state = self.state.lock();
            state.stage = stage;
            state.in_flight.clear();
            Self::snapshot(&state)
        };
        self.emit(&event);
    }

    /// Register an in-flight transfer.
    pub fn begin(&self, id: usize, name: impl Into<String>) {
        let event = {
            let mut state = self.state.lock();
            state.in_flight.insert(
                id,
                FileTransfer {
                    name: name.into(),
                    transferred: 0,
                    total: None,
                },
            );
            Self::snapshot(&state)
        };
        self.emit(&event);
    }

    /// Record byte progress for an in-flight transfer.
    pub fn update(&self, id: usize, transferred: u64, total: Option<u64>) {
        let event = {
            let mut state = self.state.lock();
            match state.in_flight.get_mut(&id) {
                Some(entry) => {
                    entry.transferred = transferred;
                    entry.total = total;
                }
                None => return,
            }
            Self::snapshot(&state)
        };
        self.emit(&event);
    }

    /// Remove a transfer from the in-flight list.
    pub fn finish(&self, id: usize) {
        let event = {
            let mut state = self.state.lock();
            if state.in_flight.remove(&id).is_none() {
                return;
            }
            Self::snapshot(&state)
        };
        self.emit(&event);
    }

    /// Number of transfers currently registered.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    fn snapshot(state: &TrackerState) -> ProgressEvent {
        let (step_index, total_steps) = state.stage.step();
        ProgressEvent {
            stage: state.stage,
            step_index,
            total_steps,
            transfers: state.in_flight.values().cloned().collect(),
        }
    }

    fn emit(&self, event: &ProgressEvent) {
        if let Some(ref cb) = self.callback {
            cb(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_tracker() -> (ProgressTracker, Arc<Mutex<Vec<ProgressEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let tracker = ProgressTracker::new(Some(Arc::new(move |event: &ProgressEvent| {
            sink.lock().push(event.clone());
        })));
        (tracker, events)
    }

    #[test]
    fn test_stage_steps() {
        assert_eq!(Stage::ReadLocalVersion.step(), (1, 6));
        assert_eq!(Stage::PatchFile.step(), (6, 6));
        assert_eq!(Stage::FetchBundle.step(), (1, 3));
        assert_eq!(Stage::InstallBundle.step(), (3, 3));
    }

    #[test]
    fn test_stage_name() {
        assert_eq!(Stage::DownloadPatch.name(), "Downloading patches");
        assert_eq!(Stage::VerifyBundle.to_string(), "Verifying bundle");
    }

    #[test]
    fn test_tracker_merges_transfers() {
        let (tracker, events) = recording_tracker();

        tracker.stage(Stage::DownloadPatch);
        tracker.begin(0, "a.txt");
        tracker.begin(1, "b.txt");
        tracker.update(0, 10, Some(100));
        tracker.update(1, 5, None);

        let last = events.lock().last().cloned().unwrap();
        assert_eq!(last.stage, Stage::DownloadPatch);
        assert_eq!(last.step_index, 5);
        assert_eq!(last.transfers.len(), 2);
        assert_eq!(last.transferred_bytes(), 15);
    }

    #[test]
    fn test_finished_transfers_leave_in_flight_list() {
        let (tracker, events) = recording_tracker();

        tracker.stage(Stage::DownloadPatch);
        tracker.begin(0, "a.txt");
        tracker.begin(1, "b.txt");
        tracker.finish(0);

        assert_eq!(tracker.in_flight(), 1);
        let last = events.lock().last().cloned().unwrap();
        assert_eq!(last.transfers[0].name, "b.txt");
    }

    #[test]
    fn test_update_for_unknown_transfer_is_ignored() {
        let (tracker, events) = recording_tracker();

        tracker.update(7, 10, None);
        tracker.finish(7);

        assert!(events.lock().is_empty());
    }

    #[test]
    fn test_silent_tracker() {
        let tracker = ProgressTracker::silent();
        tracker.stage(Stage::FetchManifest);
        tracker.begin(0, "x");
        assert_eq!(tracker.in_flight(), 1);
    }
}

//! Scan progress reporting.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dirscope_core::Entry;

use crate::cancel::CancelToken;
use parking_lot::Mutex;
use strum::Display;
use tokio::sync::broadcast;

/// Lifecycle of a scan session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum SessionState {
    #[default]
    Idle,
    Planning,
    Walking,
    Aggregating,
    Committing,
    Done,
    Failed,
}

impl SessionState {
    /// Check if the session has finished, successfully or not.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether a cancellation request is still honoured in this state.
    pub fn is_cancellable(self) -> bool {
        matches!(
            self,
            SessionState::Idle
                | SessionState::Planning
                | SessionState::Walking
                | SessionState::Aggregating
        )
    }
}

/// Progress information during a scan.
#[derive(Debug, Clone)]
pub struct ScanProgress {
    /// Current session state.
    pub state: SessionState,
    /// Number of entries seen so far.
    pub entries_scanned: u64,
    /// Number of entries that carried an error.
    pub errors_seen: u64,
    /// Number of directories read so far.
    pub dirs_walked: u64,
    /// Total bytes of files seen so far.
    pub bytes_scanned: u64,
    /// Current path being scanned.
    pub current_path: PathBuf,
    /// Time elapsed since the session started.
    pub elapsed: Duration,
}

impl ScanProgress {
    /// Create initial progress state.
    pub fn new() -> Self {
        Self {
            state: SessionState::Idle,
            entries_scanned: 0,
            errors_seen: 0,
            dirs_walked: 0,
            bytes_scanned: 0,
            current_path: PathBuf::new(),
            elapsed: Duration::ZERO,
        }
    }
}

impl Default for ScanProgress {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared progress counters for one session.
///
/// Workers record entries concurrently; a snapshot is broadcast every
/// `interval` entries and on every state change.
#[derive(Debug)]
pub struct ProgressTracker {
    start_time: Instant,
    state: Mutex<SessionState>,
    entries_scanned: AtomicU64,
    errors_seen: AtomicU64,
    dirs_walked: AtomicU64,
    bytes_scanned: AtomicU64,
    current_path: Mutex<PathBuf>,
    interval: u64,
    progress_tx: broadcast::Sender<ScanProgress>,
}

impl ProgressTracker {
    /// Create a tracker publishing every `interval` entries.
    pub fn new(interval: u64) -> Self {
        let (progress_tx, _) = broadcast::channel(100);
        Self {
            start_time: Instant::now(),
            state: Mutex::new(SessionState::Idle),
            entries_scanned: AtomicU64::new(0),
            errors_seen: AtomicU64::new(0),
            dirs_walked: AtomicU64::new(0),
            bytes_scanned: AtomicU64::new(0),
            current_path: Mutex::new(PathBuf::new()),
            interval: interval.max(1),
            progress_tx,
        }
    }

    /// Subscribe to progress updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanProgress> {
        self.progress_tx.subscribe()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Move to a new state and publish a snapshot.
    pub fn set_state(&self, state: SessionState) {
        *self.state.lock() = state;
        self.publish();
    }

    /// Cancel `token` if the current state still honours it.
    ///
    /// Returns whether the request took effect.
    pub fn cancel_if_cancellable(&self, token: &CancelToken) -> bool {
        let state = self.state.lock();
        if !state.is_cancellable() {
            return false;
        }
        token.cancel();
        true
    }

    /// Move to `Committing` unless `token` was cancelled first.
    ///
    /// Shares the state lock with [`cancel_if_cancellable`], so a cancel
    /// either stops the commit or is refused.
    ///
    /// [`cancel_if_cancellable`]: Self::cancel_if_cancellable
    pub fn begin_commit(&self, token: &CancelToken) -> bool {
        {
            let mut state = self.state.lock();
            if token.was_cancelled() {
                return false;
            }
            *state = SessionState::Committing;
        }
        self.publish();
        true
    }

    /// Record one entry produced by a walker or listing.
    pub fn record_entry(&self, entry: &Entry) {
        if entry.has_error() {
            self.errors_seen.fetch_add(1, Ordering::Relaxed);
        } else if entry.is_dir() {
            self.dirs_walked.fetch_add(1, Ordering::Relaxed);
        } else {
            self.bytes_scanned.fetch_add(entry.size, Ordering::Relaxed);
        }

        let count = self.entries_scanned.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.interval == 0 {
            self.set_current_path(&entry.path);
            self.publish();
        }
    }

    /// Set the path shown in progress reports.
    pub fn set_current_path(&self, path: &Path) {
        let mut current = self.current_path.lock();
        current.clear();
        current.push(path);
    }

    /// Take a snapshot of the counters.
    pub fn snapshot(&self) -> ScanProgress {
        ScanProgress {
            state: self.state(),
            entries_scanned: self.entries_scanned.load(Ordering::Relaxed),
            errors_seen: self.errors_seen.load(Ordering::Relaxed),
            dirs_walked: self.dirs_walked.load(Ordering::Relaxed),
            bytes_scanned: self.bytes_scanned.load(Ordering::Relaxed),
            current_path: self.current_path.lock().clone(),
            elapsed: self.start_time.elapsed(),
        }
    }

    /// Time since the tracker was created.
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    fn publish(&self) {
        // No receivers is not an error.
        let _ = self.progress_tx.send(self.snapshot());
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(1000)
    }
}

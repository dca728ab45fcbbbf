//! Session handles and outcomes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tokio::sync::broadcast;

use dirscope_core::{FileTree, ScanError};
use dirscope_scan::{CancelToken, ProgressTracker, ScanProgress, SessionState};

/// What one session did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Directories read with a shallow listing during planning.
    pub dirs_listed: u64,
    /// Directories re-listed and updated in place.
    pub dirs_patched: u64,
    /// Subtrees walked from scratch.
    pub subtrees_walked: u64,
    /// Subtrees taken from the cache unchanged.
    pub subtrees_reused: u64,
    /// Tombstoned subtrees brought back without walking.
    pub subtrees_revived: u64,
    /// Records newly tombstoned.
    pub paths_tombstoned: u64,
    /// Entries seen by listings and walkers.
    pub entries_scanned: u64,
    /// Entries that carried an error.
    pub errors_seen: u64,
}

impl ScanSummary {
    /// Directories whose contents were read again, patched or walked.
    pub fn dirs_rewalked(&self) -> u64 {
        self.dirs_patched + self.subtrees_walked
    }
}

/// Result of a completed session.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
    pub tree: Arc<FileTree>,
    pub summary: ScanSummary,
}

#[derive(Debug)]
pub(crate) struct SessionShared {
    pub(crate) id: u64,
    pub(crate) root: PathBuf,
    pub(crate) progress: ProgressTracker,
    pub(crate) cancel: CancelToken,
    outcome: Mutex<Option<Result<ScanOutcome, ScanError>>>,
    finished: Condvar,
}

impl SessionShared {
    pub(crate) fn new(id: u64, root: PathBuf, progress_interval: u64, cancel: CancelToken) -> Self {
        Self {
            id,
            root,
            progress: ProgressTracker::new(progress_interval),
            cancel,
            outcome: Mutex::new(None),
            finished: Condvar::new(),
        }
    }

    /// Store the outcome and wake every waiter.
    pub(crate) fn finish(&self, outcome: Result<ScanOutcome, ScanError>) {
        let state = if outcome.is_ok() {
            SessionState::Done
        } else {
            SessionState::Failed
        };
        let mut slot = self.outcome.lock();
        *slot = Some(outcome);
        self.progress.set_state(state);
        self.finished.notify_all();
    }
}

/// Handle to a running or finished scan session.
///
/// Handles are cheap to clone and may be shared across threads.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub(crate) shared: Arc<SessionShared>,
}

impl SessionHandle {
    /// Session identifier, unique within a coordinator.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Normalized root of the session.
    pub fn root(&self) -> &Path {
        &self.shared.root
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.shared.progress.state()
    }

    /// Snapshot of the progress counters.
    pub fn progress(&self) -> ScanProgress {
        self.shared.progress.snapshot()
    }

    /// Subscribe to progress updates.
    pub fn subscribe(&self) -> broadcast::Receiver<ScanProgress> {
        self.shared.progress.subscribe()
    }

    /// Request cancellation. Refused once the session is committing.
    ///
    /// Returns whether the request took effect.
    pub fn cancel(&self) -> bool {
        self.shared.progress.cancel_if_cancellable(&self.shared.cancel)
    }

    /// Check if the session has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// Block until the session finishes.
    pub fn wait(&self) -> Result<ScanOutcome, ScanError> {
        let mut slot = self.shared.outcome.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.shared.finished.wait(&mut slot);
        }
    }

    /// The finished tree, once the session is done.
    pub fn snapshot(&self) -> Option<Arc<FileTree>> {
        match self.shared.outcome.lock().as_ref() {
            Some(Ok(outcome)) => Some(Arc::clone(&outcome.tree)),
            _ => None,
        }
    }

    /// The session summary, once the session is done.
    pub fn summary(&self) -> Option<ScanSummary> {
        match self.shared.outcome.lock().as_ref() {
            Some(Ok(outcome)) => Some(outcome.summary.clone()),
            _ => None,
        }
    }

    /// The failure, if the session failed.
    pub fn error(&self) -> Option<ScanError> {
        match self.shared.outcome.lock().as_ref() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn shared() -> Arc<SessionShared> {
        Arc::new(SessionShared::new(1, PathBuf::from("/data"), 1000, CancelToken::new()))
    }

    #[test]
    fn test_wait_returns_failure() {
        let shared = shared();
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };

        let waiter = {
            let handle = handle.clone();
            thread::spawn(move || handle.wait())
        };
        shared.finish(Err(ScanError::SessionCancelled));

        let result = waiter.join().unwrap();
        assert!(result.unwrap_err().is_cancelled());
        assert_eq!(handle.state(), SessionState::Failed);
        assert!(handle.snapshot().is_none());
        assert!(handle.is_finished());
    }

    #[test]
    fn test_cancel_ignored_while_committing() {
        let shared = shared();
        let handle = SessionHandle {
            shared: Arc::clone(&shared),
        };

        shared.progress.set_state(SessionState::Committing);
        assert!(!handle.cancel());
        assert!(!shared.cancel.was_cancelled());

        shared.progress.set_state(SessionState::Walking);
        assert!(handle.cancel());
        assert!(shared.cancel.was_cancelled());
        assert!(!shared.progress.begin_commit(&shared.cancel));
    }

    #[test]
    fn test_dirs_rewalked() {
        let summary = ScanSummary {
            dirs_patched: 2,
            subtrees_walked: 3,
            ..Default::default()
        };
        assert_eq!(summary.dirs_rewalked(), 5);
    }
}

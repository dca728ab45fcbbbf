//! Error types for scanning operations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure attached to a single entry.
///
/// Entry errors never abort a walk. The affected entry is recorded with
/// zero size and the error is counted on every ancestor directory.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum EntryError {
    /// Permission was denied while reading the entry or its children.
    #[error("permission denied")]
    PermissionDenied,

    /// The entry disappeared between listing and reading its metadata.
    #[error("entry vanished during scan")]
    Vanished,

    /// Any other I/O failure.
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The directory is already on the active ancestor chain.
    #[error("directory cycle detected")]
    CycleDetected,
}

impl EntryError {
    /// Classify an I/O error.
    pub fn from_io(err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            std::io::ErrorKind::NotFound => Self::Vanished,
            _ => Self::Io {
                message: err.to_string(),
            },
        }
    }
}

/// Errors that end a scan session.
#[derive(Debug, Clone, Error)]
pub enum ScanError {
    /// The root is missing or is not a directory.
    #[error("Root unavailable: {path}: {reason}")]
    RootUnavailable { path: PathBuf, reason: String },

    /// Another session is active on the same or an overlapping root.
    #[error("Scan already in progress for {root}")]
    ScanAlreadyInProgress { root: PathBuf },

    /// The session was cancelled before committing.
    #[error("Scan session cancelled")]
    SessionCancelled,

    /// Invalid configuration.
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    /// The cache store failed.
    #[error("Cache store error: {message}")]
    Cache { message: String },

    /// The in-memory tree rejected an update.
    #[error(transparent)]
    Tree(#[from] TreeError),

    /// Other error.
    #[error("{message}")]
    Other { message: String },
}

impl ScanError {
    /// Create a root-unavailable error from an I/O failure.
    pub fn root_io(path: impl Into<PathBuf>, source: &std::io::Error) -> Self {
        Self::RootUnavailable {
            path: path.into(),
            reason: source.to_string(),
        }
    }

    /// Whether the session ended because of a cancellation request.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::SessionCancelled)
    }
}

/// Errors from incremental tree updates.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    /// The path does not lie under the tree root.
    #[error("{path} is outside the tree rooted at {root}")]
    OutsideRoot { path: PathBuf, root: PathBuf },

    /// No node exists at the path.
    #[error("No node at {path}")]
    NotFound { path: PathBuf },

    /// An ancestor of the path is not a directory.
    #[error("{path} is not a directory")]
    NotADirectory { path: PathBuf },
}

/// Non-fatal problem recorded during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanWarning {
    /// Path where the warning occurred.
    pub path: PathBuf,
    /// What went wrong.
    pub error: EntryError,
}

impl ScanWarning {
    /// Create a new scan warning.
    pub fn new(path: impl Into<PathBuf>, error: EntryError) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }

    /// Human-readable message.
    pub fn message(&self) -> String {
        format!("{}: {}", self.path.display(), self.error)
    }
}

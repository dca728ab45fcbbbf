//! Raw entries produced by a walk pass.

use std::path::PathBuf;
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::error::EntryError;

/// Kind of filesystem object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    /// Regular file.
    File,
    /// Directory.
    Directory,
    /// Symbolic link (never descended).
    Symlink,
    /// Sockets, devices, fifos.
    Special,
    /// Metadata or contents could not be read.
    Inaccessible,
}

impl EntryKind {
    /// Check if this is a directory.
    pub fn is_dir(self) -> bool {
        matches!(self, EntryKind::Directory)
    }

    /// Stable one-byte tag, used when fingerprinting.
    pub fn tag(self) -> u8 {
        match self {
            EntryKind::File => b'f',
            EntryKind::Directory => b'd',
            EntryKind::Symlink => b'l',
            EntryKind::Special => b's',
            EntryKind::Inaccessible => b'x',
        }
    }
}

/// Inode information for cycle detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeInfo {
    /// Inode number.
    pub inode: u64,
    /// Device ID.
    pub device: u64,
}

impl InodeInfo {
    /// Create new inode info.
    pub fn new(inode: u64, device: u64) -> Self {
        Self { inode, device }
    }
}

/// Resolved target of a symbolic link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Link target path as stored in the link.
    pub target: CompactString,
    /// Whether the link target exists.
    pub broken: bool,
}

/// One filesystem object as reported by a single walk pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Absolute normalized path.
    pub path: PathBuf,
    /// Final path component.
    pub name: CompactString,
    /// Kind of object.
    pub kind: EntryKind,
    /// Size in bytes (0 for directories and errored entries).
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
    /// Depth relative to the walk root (root is 0).
    pub depth: usize,
    /// Device and inode, when metadata was readable.
    pub inode: Option<InodeInfo>,
    /// Link target, only resolved when the policy asks for it.
    pub link: Option<LinkTarget>,
    /// Why the entry could not be read.
    pub error: Option<EntryError>,
}

impl Entry {
    /// Create an entry for an object whose metadata could not be read.
    pub fn inaccessible(
        path: impl Into<PathBuf>,
        name: impl Into<CompactString>,
        depth: usize,
        error: EntryError,
    ) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            kind: EntryKind::Inaccessible,
            size: 0,
            modified: SystemTime::UNIX_EPOCH,
            depth,
            inode: None,
            link: None,
            error: Some(error),
        }
    }

    /// Check if this entry is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this entry carries an error.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    /// Mark the entry as unreadable, dropping its size.
    pub fn mark_failed(&mut self, error: EntryError) {
        self.kind = EntryKind::Inaccessible;
        self.size = 0;
        self.error = Some(error);
    }
}

//! Persisted per-path scan results.

use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::entry::{EntryKind, LinkTarget};
use crate::error::EntryError;
use crate::fingerprint::Fingerprint;
use crate::node::{NodeKind, TreeNode};

/// Last known scan result for one path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// Kind of object.
    pub kind: EntryKind,
    /// Own size for files, cumulative size for directories.
    pub size: u64,
    /// Files below this path (1 for a file).
    pub file_count: u64,
    /// Errors on this path and below.
    pub error_count: u64,
    /// Modification time observed at scan time.
    pub modified: SystemTime,
    /// Fingerprint of the child set (directories only).
    pub fingerprint: Option<Fingerprint>,
    /// Why the path could not be read.
    pub error: Option<EntryError>,
    /// Resolved symlink target.
    pub link: Option<LinkTarget>,
    /// When this record was last confirmed against the filesystem.
    pub last_scanned: SystemTime,
    /// When the path was first observed missing.
    pub tombstoned_at: Option<SystemTime>,
}

impl CacheRecord {
    /// Record a node. Directories should pass their child fingerprint.
    pub fn from_node(node: &TreeNode, fingerprint: Option<Fingerprint>, now: SystemTime) -> Self {
        let link = match &node.kind {
            NodeKind::Symlink { link } => link.clone(),
            _ => None,
        };
        Self {
            kind: node.kind.entry_kind(),
            size: node.size,
            file_count: node.file_count(),
            error_count: node.error_count,
            modified: node.modified,
            fingerprint: if node.is_dir() { fingerprint } else { None },
            error: node.error.clone(),
            link,
            last_scanned: now,
            tombstoned_at: None,
        }
    }

    /// Rebuild a childless node. Directory aggregates are recomputed once
    /// children are attached.
    pub fn to_node(&self, name: impl Into<CompactString>) -> TreeNode {
        let mut node = TreeNode::new_file(name, 0, self.modified, self.last_scanned);
        node.kind = NodeKind::from_entry_kind(self.kind, self.link.clone());
        if !node.is_dir() && self.error.is_none() {
            node.size = self.size;
        }
        node.error = self.error.clone();
        node.error_count = u64::from(self.error.is_some());
        node
    }

    /// Check if this is a directory record.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if the path was observed missing.
    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned_at.is_some()
    }

    /// Whether a live directory still matches this record.
    pub fn matches(&self, modified: SystemTime, fingerprint: &Fingerprint) -> bool {
        self.is_dir()
            && self.error.is_none()
            && self.modified == modified
            && self.fingerprint.as_ref() == Some(fingerprint)
    }

    /// Copy marked as missing since `at`. Existing tombstones keep their time.
    pub fn tombstoned(&self, at: SystemTime) -> Self {
        Self {
            tombstoned_at: Some(self.tombstoned_at.unwrap_or(at)),
            ..self.clone()
        }
    }

    /// Copy with the tombstone cleared.
    pub fn revived(&self) -> Self {
        Self {
            tombstoned_at: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dir_record(fp: Fingerprint) -> CacheRecord {
        let node = TreeNode::new_directory("d", SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH);
        CacheRecord::from_node(&node, Some(fp), SystemTime::UNIX_EPOCH)
    }

    #[test]
    fn test_matches() {
        let fp = Fingerprint::new([1; 32]);
        let record = dir_record(fp);

        assert!(record.matches(SystemTime::UNIX_EPOCH, &fp));
        assert!(!record.matches(SystemTime::UNIX_EPOCH + Duration::from_secs(1), &fp));
        assert!(!record.matches(SystemTime::UNIX_EPOCH, &Fingerprint::new([2; 32])));
    }

    #[test]
    fn test_file_record_has_no_fingerprint() {
        let node = TreeNode::new_file("f", 10, SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH);
        let record = CacheRecord::from_node(&node, Some(Fingerprint::new([1; 32])), SystemTime::UNIX_EPOCH);
        assert!(record.fingerprint.is_none());
        assert_eq!(record.to_node("f").size, 10);
    }

    #[test]
    fn test_tombstone_keeps_first_time() {
        let record = dir_record(Fingerprint::new([1; 32]));
        let first = SystemTime::UNIX_EPOCH + Duration::from_secs(10);
        let second = SystemTime::UNIX_EPOCH + Duration::from_secs(20);

        let stoned = record.tombstoned(first).tombstoned(second);
        assert_eq!(stoned.tombstoned_at, Some(first));
        assert!(!stoned.revived().is_tombstoned());
    }
}

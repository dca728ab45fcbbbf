//! Aggregation tree nodes.

use std::sync::OnceLock;
use std::time::SystemTime;

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::entry::{Entry, EntryKind, LinkTarget};
use crate::error::EntryError;
use crate::fingerprint::{Fingerprint, FingerprintItem};

/// Type of tree node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    /// Regular file.
    File,
    /// Directory.
    Directory {
        /// Total number of files in this subtree.
        file_count: u64,
        /// Total number of directories in this subtree.
        dir_count: u64,
    },
    /// Symbolic link.
    Symlink {
        /// Link target, when it was resolved.
        link: Option<LinkTarget>,
    },
    /// Sockets, devices, fifos.
    Special,
    /// Could not be read.
    Inaccessible,
}

impl NodeKind {
    /// Check if this is a directory.
    pub fn is_dir(&self) -> bool {
        matches!(self, NodeKind::Directory { .. })
    }

    /// Check if this is a regular file.
    pub fn is_file(&self) -> bool {
        matches!(self, NodeKind::File)
    }

    /// Check if this is a symlink.
    pub fn is_symlink(&self) -> bool {
        matches!(self, NodeKind::Symlink { .. })
    }

    /// The walker kind this node was built from.
    pub fn entry_kind(&self) -> EntryKind {
        match self {
            NodeKind::File => EntryKind::File,
            NodeKind::Directory { .. } => EntryKind::Directory,
            NodeKind::Symlink { .. } => EntryKind::Symlink,
            NodeKind::Special => EntryKind::Special,
            NodeKind::Inaccessible => EntryKind::Inaccessible,
        }
    }

    /// Build a kind with zeroed directory counts.
    pub fn from_entry_kind(kind: EntryKind, link: Option<LinkTarget>) -> Self {
        match kind {
            EntryKind::File => NodeKind::File,
            EntryKind::Directory => NodeKind::Directory {
                file_count: 0,
                dir_count: 0,
            },
            EntryKind::Symlink => NodeKind::Symlink { link },
            EntryKind::Special => NodeKind::Special,
            EntryKind::Inaccessible => NodeKind::Inaccessible,
        }
    }
}

/// What a node contributes to its parent's aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub size: u64,
    pub files: u64,
    pub dirs: u64,
    pub errors: u64,
}

/// Change of a subtree's contribution, applied to every ancestor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SizeDelta {
    pub removed: Totals,
    pub added: Totals,
}

impl SizeDelta {
    /// Delta for replacing `old` (if any) with `new` (if any).
    pub fn between(old: Option<&TreeNode>, new: Option<&TreeNode>) -> Self {
        Self {
            removed: old.map(TreeNode::totals).unwrap_or_default(),
            added: new.map(TreeNode::totals).unwrap_or_default(),
        }
    }

    /// Net change in bytes.
    pub fn net_size(&self) -> i128 {
        self.added.size as i128 - self.removed.size as i128
    }
}

fn shift(value: u64, removed: u64, added: u64) -> u64 {
    debug_assert!(value + added >= removed, "aggregate underflow");
    (value + added).saturating_sub(removed)
}

/// A single file or directory in the aggregation tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    /// File/directory name (not full path).
    pub name: CompactString,

    /// Node type and associated counts.
    pub kind: NodeKind,

    /// Size in bytes (cumulative for directories).
    pub size: u64,

    /// Why this node could not be read.
    pub error: Option<EntryError>,

    /// Errors on this node and all of its descendants.
    pub error_count: u64,

    /// Last modification time reported by the filesystem.
    pub modified: SystemTime,

    /// When this node's data was last read from disk.
    pub scanned_at: SystemTime,

    /// Children sorted by name.
    children: Vec<TreeNode>,

    /// Child indices sorted by size descending, built on first use.
    #[serde(skip)]
    by_size: OnceLock<Vec<usize>>,
}

impl TreeNode {
    /// Create a new file node.
    pub fn new_file(
        name: impl Into<CompactString>,
        size: u64,
        modified: SystemTime,
        scanned_at: SystemTime,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::File,
            size,
            error: None,
            error_count: 0,
            modified,
            scanned_at,
            children: Vec::new(),
            by_size: OnceLock::new(),
        }
    }

    /// Create a new, empty directory node.
    pub fn new_directory(
        name: impl Into<CompactString>,
        modified: SystemTime,
        scanned_at: SystemTime,
    ) -> Self {
        Self {
            kind: NodeKind::Directory {
                file_count: 0,
                dir_count: 0,
            },
            size: 0,
            ..Self::new_file(name, 0, modified, scanned_at)
        }
    }

    /// Create a childless node from a walker entry.
    pub fn from_entry(entry: &Entry, scanned_at: SystemTime) -> Self {
        let kind = NodeKind::from_entry_kind(entry.kind, entry.link.clone());
        let size = if kind.is_dir() || entry.error.is_some() {
            0
        } else {
            entry.size
        };
        Self {
            name: entry.name.clone(),
            kind,
            size,
            error_count: u64::from(entry.error.is_some()),
            error: entry.error.clone(),
            modified: entry.modified,
            scanned_at,
            children: Vec::new(),
            by_size: OnceLock::new(),
        }
    }

    /// Check if this node is a directory.
    pub fn is_dir(&self) -> bool {
        self.kind.is_dir()
    }

    /// Check if this node is a file.
    pub fn is_file(&self) -> bool {
        self.kind.is_file()
    }

    /// Check if this node is a symlink.
    pub fn is_symlink(&self) -> bool {
        self.kind.is_symlink()
    }

    /// Children sorted by name.
    pub fn children(&self) -> &[TreeNode] {
        &self.children
    }

    /// Get the number of direct children.
    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Find a direct child by name.
    pub fn child(&self, name: &str) -> Option<&TreeNode> {
        self.find(name).ok().map(|i| &self.children[i])
    }

    /// Find a direct child by name for mutation.
    ///
    /// Callers that change sizes must fix the ancestors' aggregates
    /// themselves.
    pub fn child_mut(&mut self, name: &str) -> Option<&mut TreeNode> {
        match self.find(name) {
            Ok(i) => Some(&mut self.children[i]),
            Err(_) => None,
        }
    }

    fn find(&self, name: &str) -> Result<usize, usize> {
        self.children.binary_search_by(|c| c.name.as_str().cmp(name))
    }

    /// Get file count for directories, 1 for files.
    pub fn file_count(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory { file_count, .. } => *file_count,
            NodeKind::File => 1,
            _ => 0,
        }
    }

    /// Get directory count for directories.
    pub fn dir_count(&self) -> u64 {
        match &self.kind {
            NodeKind::Directory { dir_count, .. } => *dir_count,
            _ => 0,
        }
    }

    /// What this node contributes to its parent.
    pub fn totals(&self) -> Totals {
        Totals {
            size: self.size,
            files: self.file_count(),
            dirs: if self.is_dir() { self.dir_count() + 1 } else { 0 },
            errors: self.error_count,
        }
    }

    /// Insert or replace a child, keeping this node's aggregates exact.
    ///
    /// Returns the replaced child, if any.
    pub fn add_child(&mut self, child: TreeNode) -> Option<TreeNode> {
        let added = child.totals();
        let replaced = self.put_child(child);
        let removed = replaced.as_ref().map(TreeNode::totals).unwrap_or_default();
        self.apply_delta(&SizeDelta { removed, added });
        replaced
    }

    /// Remove a child by name, keeping this node's aggregates exact.
    pub fn remove_child(&mut self, name: &str) -> Option<TreeNode> {
        let removed = self.take_child(name)?;
        self.apply_delta(&SizeDelta {
            removed: removed.totals(),
            added: Totals::default(),
        });
        Some(removed)
    }

    /// Insert or replace a child without touching aggregates.
    ///
    /// Used for bulk loads followed by [`TreeNode::recompute_all`].
    pub fn put_child(&mut self, child: TreeNode) -> Option<TreeNode> {
        self.by_size = OnceLock::new();
        match self.find(child.name.as_str()) {
            Ok(i) => Some(std::mem::replace(&mut self.children[i], child)),
            Err(i) => {
                self.children.insert(i, child);
                None
            }
        }
    }

    /// Remove without touching aggregates.
    pub(crate) fn take_child(&mut self, name: &str) -> Option<TreeNode> {
        let i = self.find(name).ok()?;
        self.by_size = OnceLock::new();
        Some(self.children.remove(i))
    }

    /// Apply a child's change to this node's aggregates.
    pub fn apply_delta(&mut self, delta: &SizeDelta) {
        let SizeDelta { removed, added } = delta;
        self.size = shift(self.size, removed.size, added.size);
        self.error_count = shift(self.error_count, removed.errors, added.errors);
        if let NodeKind::Directory {
            file_count,
            dir_count,
        } = &mut self.kind
        {
            *file_count = shift(*file_count, removed.files, added.files);
            *dir_count = shift(*dir_count, removed.dirs, added.dirs);
        }
        self.by_size = OnceLock::new();
    }

    fn children_sum(&self) -> Totals {
        let mut sum = Totals::default();
        for child in &self.children {
            let t = child.totals();
            sum.size += t.size;
            sum.files += t.files;
            sum.dirs += t.dirs;
            sum.errors += t.errors;
        }
        sum
    }

    /// Recompute this node's aggregates from its direct children.
    pub fn recompute_totals(&mut self) {
        let own_error = u64::from(self.error.is_some());
        let sum = self.children_sum();
        if let NodeKind::Directory {
            file_count,
            dir_count,
        } = &mut self.kind
        {
            *file_count = sum.files;
            *dir_count = sum.dirs;
            self.size = sum.size;
        }
        self.error_count = own_error + sum.errors;
        self.by_size = OnceLock::new();
    }

    /// Recompute aggregates for the whole subtree, bottom-up.
    pub fn recompute_all(&mut self) {
        for child in &mut self.children {
            child.recompute_all();
        }
        self.recompute_totals();
    }

    /// Children ordered by size descending (ties by name).
    ///
    /// The order is computed on first call and cached until the next
    /// mutation of this node.
    pub fn children_by_size(&self) -> impl Iterator<Item = &TreeNode> + '_ {
        let order = self.by_size.get_or_init(|| {
            let mut order: Vec<usize> = (0..self.children.len()).collect();
            order.sort_by(|&a, &b| {
                let (a, b) = (&self.children[a], &self.children[b]);
                b.size.cmp(&a.size).then_with(|| a.name.cmp(&b.name))
            });
            order
        });
        order.iter().map(move |&i| &self.children[i])
    }

    /// Check that every directory's aggregates equal the sum of its children.
    pub fn is_consistent(&self) -> bool {
        self.children.iter().all(TreeNode::is_consistent) && self.totals_match_children()
    }

    /// Check this node's aggregates against its direct children only.
    pub fn totals_match_children(&self) -> bool {
        let sum = self.children_sum();
        let errors_ok = self.error_count == u64::from(self.error.is_some()) + sum.errors;
        match &self.kind {
            NodeKind::Directory {
                file_count,
                dir_count,
            } => {
                errors_ok
                    && self.size == sum.size
                    && *file_count == sum.files
                    && *dir_count == sum.dirs
            }
            _ => errors_ok && self.children.is_empty(),
        }
    }

    /// Compare two subtrees, ignoring when they were scanned.
    pub fn structurally_eq(&self, other: &TreeNode) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.size == other.size
            && self.error == other.error
            && self.error_count == other.error_count
            && self.modified == other.modified
            && self.children.len() == other.children.len()
            && self
                .children
                .iter()
                .zip(&other.children)
                .all(|(a, b)| a.structurally_eq(b))
    }

    /// This node as one item of its parent's fingerprint.
    pub fn fingerprint_item(&self) -> FingerprintItem<'_> {
        FingerprintItem {
            name: self.name.as_str(),
            kind: self.kind.entry_kind(),
            modified: self.modified,
            size: self.size,
        }
    }

    /// Fingerprint of this node's direct children.
    pub fn child_fingerprint(&self) -> Fingerprint {
        Fingerprint::compute(self.children.iter().map(TreeNode::fingerprint_item))
    }
}

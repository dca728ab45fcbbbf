//! Aggregation tree builder.

use std::time::SystemTime;

use dirscope_core::{Entry, ScanError, ScanWarning, TreeNode};

use crate::progress::ProgressTracker;
use crate::walker::Walker;

/// Builds a subtree from a pre-order entry stream.
///
/// Directories stay open on a stack until an entry at the same or a
/// shallower depth arrives, at which point they are closed and attached to
/// their parent with exact aggregates.
#[derive(Debug)]
pub struct TreeBuilder {
    stack: Vec<TreeNode>,
    root: Option<TreeNode>,
    scanned_at: SystemTime,
    warnings: Vec<ScanWarning>,
    entries: u64,
}

/// A finished subtree and what was learned while building it.
#[derive(Debug)]
pub struct BuiltSubtree {
    pub root: TreeNode,
    pub warnings: Vec<ScanWarning>,
    pub entries: u64,
}

impl TreeBuilder {
    /// Create a builder stamping nodes with `scanned_at`.
    pub fn new(scanned_at: SystemTime) -> Self {
        Self {
            stack: Vec::new(),
            root: None,
            scanned_at,
            warnings: Vec::new(),
            entries: 0,
        }
    }

    /// Add the next entry of the stream.
    pub fn push(&mut self, entry: &Entry) {
        self.entries += 1;
        if let Some(err) = &entry.error {
            self.warnings.push(ScanWarning::new(&entry.path, err.clone()));
        }

        let depth = if self.root.is_none() && self.stack.is_empty() {
            0
        } else {
            entry.depth.max(1)
        };
        while self.stack.len() > depth {
            self.close_top();
        }

        let node = TreeNode::from_entry(entry, self.scanned_at);
        if node.is_dir() {
            self.stack.push(node);
        } else if let Some(parent) = self.stack.last_mut() {
            parent.add_child(node);
        } else if self.root.is_none() {
            self.root = Some(node);
        }
    }

    fn close_top(&mut self) {
        let Some(node) = self.stack.pop() else {
            return;
        };
        match self.stack.last_mut() {
            Some(parent) => {
                parent.add_child(node);
            }
            None => self.root = Some(node),
        }
    }

    /// Close every open directory and return the subtree root.
    pub fn finish(mut self) -> Option<BuiltSubtree> {
        while !self.stack.is_empty() {
            self.close_top();
        }
        let root = self.root?;
        Some(BuiltSubtree {
            root,
            warnings: self.warnings,
            entries: self.entries,
        })
    }
}

/// Walk a subtree and build it, recording progress as entries arrive.
pub fn build_subtree(
    walker: Walker,
    scanned_at: SystemTime,
    progress: &ProgressTracker,
) -> Result<BuiltSubtree, ScanError> {
    let root = walker.root().to_path_buf();
    let mut iter = walker.walk();
    let mut builder = TreeBuilder::new(scanned_at);

    for entry in iter.by_ref() {
        progress.record_entry(&entry);
        builder.push(&entry);
    }
    if iter.was_cancelled() {
        return Err(ScanError::SessionCancelled);
    }

    builder.finish().ok_or_else(|| ScanError::Other {
        message: format!("walk of {} produced no entries", root.display()),
    })
}

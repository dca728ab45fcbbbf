//! Directory identity tracking for cycle detection.

use std::fs::Metadata;

#[cfg(unix)]
use std::os::unix::fs::MetadataExt;

use dirscope_core::InodeInfo;

/// Identities of the directories on the path from the walk root down to
/// the directory currently being read.
///
/// Only the active chain is kept, so the same directory reached through two
/// unrelated parents (a bind mount seen twice) is not treated as a cycle.
#[derive(Debug, Clone, Default)]
pub struct AncestorChain {
    chain: Vec<InodeInfo>,
}

impl AncestorChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self { chain: Vec::new() }
    }

    /// Append a directory to the chain.
    pub fn push(&mut self, info: InodeInfo) {
        self.chain.push(info);
    }

    /// Copy of the chain extended by one directory.
    pub fn child(&self, info: Option<InodeInfo>) -> Self {
        let mut next = self.clone();
        if let Some(info) = info {
            next.push(info);
        }
        next
    }

    /// Check if a directory is already on the chain.
    pub fn contains(&self, info: &InodeInfo) -> bool {
        self.chain.contains(info)
    }

    /// Number of directories on the chain.
    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Check if the chain is empty.
    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

/// Device and inode of a filesystem object.
#[cfg(unix)]
pub fn identity(metadata: &Metadata) -> Option<InodeInfo> {
    Some(InodeInfo::new(metadata.ino(), metadata.dev()))
}

#[cfg(not(unix))]
pub fn identity(_metadata: &Metadata) -> Option<InodeInfo> {
    None
}

/// Get the device ID from metadata.
#[cfg(unix)]
pub fn device(metadata: &Metadata) -> u64 {
    metadata.dev()
}

#[cfg(not(unix))]
pub fn device(_metadata: &Metadata) -> u64 {
    0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let mut chain = AncestorChain::new();
        let info = InodeInfo::new(12345, 1);

        assert!(!chain.contains(&info));
        chain.push(info);
        assert!(chain.contains(&info));
        assert_eq!(chain.len(), 1);
    }

    #[test]
    fn test_different_devices() {
        let mut chain = AncestorChain::new();
        chain.push(InodeInfo::new(12345, 1));

        assert!(!chain.contains(&InodeInfo::new(12345, 2)));
    }

    #[test]
    fn test_child_leaves_parent_untouched() {
        let parent = AncestorChain::new();
        let child = parent.child(Some(InodeInfo::new(7, 1)));

        assert!(parent.is_empty());
        assert_eq!(child.len(), 1);
        assert_eq!(parent.child(None).len(), 0);
    }
}

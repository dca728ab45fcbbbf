//! File tree container, statistics and incremental updates.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use compact_str::CompactString;
use serde::{Deserialize, Serialize};

use crate::config::ScanPolicy;
use crate::error::{EntryError, ScanWarning, TreeError};
use crate::node::{NodeKind, SizeDelta, TreeNode};

/// Summary statistics for a scanned tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeStats {
    /// Total size in bytes.
    pub total_size: u64,
    /// Total number of files.
    pub total_files: u64,
    /// Total number of directories, root included.
    pub total_dirs: u64,
    /// Total number of symbolic links.
    pub total_symlinks: u64,
    /// Entries that could not be read.
    pub total_errors: u64,
    /// Maximum depth reached.
    pub max_depth: u32,
    /// Largest file (path, size).
    pub largest_file: Option<(PathBuf, u64)>,
    /// Bytes per lowercase file extension.
    pub extension_sizes: BTreeMap<String, u64>,
}

impl TreeStats {
    /// Create new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Update stats with a file entry.
    pub fn record_file(&mut self, path: &Path, size: u64, depth: u32) {
        self.total_files += 1;
        self.total_size += size;
        self.max_depth = self.max_depth.max(depth);

        if self.largest_file.as_ref().is_none_or(|(_, s)| size > *s) {
            self.largest_file = Some((path.to_path_buf(), size));
        }

        if let Some(ext) = path.extension() {
            let ext = ext.to_string_lossy().to_lowercase();
            *self.extension_sizes.entry(ext).or_default() += size;
        }
    }

    /// Record a directory.
    pub fn record_dir(&mut self, depth: u32) {
        self.total_dirs += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    /// Record a symlink.
    pub fn record_symlink(&mut self) {
        self.total_symlinks += 1;
    }

    /// Compute stats for a whole tree.
    pub fn collect(tree: &FileTree) -> Self {
        let mut stats = Self::new();
        tree.visit(|path, node, depth| {
            let depth = depth as u32;
            match &node.kind {
                NodeKind::File => stats.record_file(path, node.size, depth),
                NodeKind::Directory { .. } => stats.record_dir(depth),
                NodeKind::Symlink { .. } => stats.record_symlink(),
                NodeKind::Special | NodeKind::Inaccessible => {}
            }
            if node.error.is_some() {
                stats.total_errors += 1;
            }
        });
        stats
    }
}

/// Complete aggregation tree with metadata.
///
/// Once a session completes the tree is shared read-only. Before that the
/// coordinator patches it in place through the incremental operations,
/// each of which touches only the ancestors of the changed path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileTree {
    /// Root node of the tree.
    pub root: TreeNode,

    /// Normalized root path.
    pub root_path: PathBuf,

    /// When this scan was performed.
    pub scanned_at: SystemTime,

    /// Duration of the scan.
    pub scan_duration: Duration,

    /// Policy the tree was scanned with.
    pub policy: ScanPolicy,

    /// Summary statistics.
    pub stats: TreeStats,

    /// Warnings encountered during the session.
    pub warnings: Vec<ScanWarning>,
}

impl FileTree {
    /// Create a new file tree.
    pub fn new(root: TreeNode, root_path: impl Into<PathBuf>, policy: ScanPolicy) -> Self {
        let mut tree = Self {
            root,
            root_path: root_path.into(),
            scanned_at: SystemTime::now(),
            scan_duration: Duration::ZERO,
            policy,
            stats: TreeStats::default(),
            warnings: Vec::new(),
        };
        tree.refresh_stats();
        tree
    }

    /// Get the total size of the tree.
    pub fn total_size(&self) -> u64 {
        self.root.size
    }

    /// Get the total number of files.
    pub fn total_files(&self) -> u64 {
        self.root.file_count()
    }

    /// Get the total number of directories below the root.
    pub fn total_dirs(&self) -> u64 {
        self.root.dir_count()
    }

    /// Number of unreadable entries in the tree.
    pub fn error_count(&self) -> u64 {
        self.root.error_count
    }

    /// Check if there were any warnings during scanning.
    pub fn has_warnings(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Recompute summary statistics.
    pub fn refresh_stats(&mut self) {
        self.stats = TreeStats::collect(self);
    }

    fn names(&self, path: &Path) -> Result<Vec<CompactString>, TreeError> {
        let outside = || TreeError::OutsideRoot {
            path: path.to_path_buf(),
            root: self.root_path.clone(),
        };
        let rel = path.strip_prefix(&self.root_path).map_err(|_| outside())?;
        rel.components()
            .map(|c| match c {
                Component::Normal(name) => Ok(CompactString::new(name.to_string_lossy())),
                _ => Err(outside()),
            })
            .collect()
    }

    /// Look up a node by absolute path.
    pub fn get(&self, path: &Path) -> Option<&TreeNode> {
        let names = self.names(path).ok()?;
        let mut node = &self.root;
        for name in &names {
            node = node.child(name)?;
        }
        Some(node)
    }

    /// Check whether a node exists at the path.
    pub fn contains(&self, path: &Path) -> bool {
        self.get(path).is_some()
    }

    /// Insert or replace the subtree at `path`.
    ///
    /// The parent must already exist and be a directory. The size delta is
    /// applied to each ancestor on the way back up, so the cost is
    /// proportional to the depth of `path`.
    pub fn replace_subtree(&mut self, path: &Path, mut node: TreeNode) -> Result<SizeDelta, TreeError> {
        let names = self.names(path)?;
        let Some(last) = names.last() else {
            node.name = self.root.name.clone();
            let delta = SizeDelta::between(Some(&self.root), Some(&node));
            self.root = node;
            return Ok(delta);
        };
        node.name = last.clone();

        let (delta, ()) = descend(&mut self.root, &names, path, |parent, _| {
            if !parent.is_dir() {
                return Err(TreeError::NotADirectory {
                    path: path.to_path_buf(),
                });
            }
            let added = node.totals();
            let removed = parent.put_child(node).map(|old| old.totals()).unwrap_or_default();
            Ok((SizeDelta { removed, added }, ()))
        })?;
        Ok(delta)
    }

    /// Detach and return the subtree at `path`. The root cannot be removed.
    pub fn remove_subtree(&mut self, path: &Path) -> Result<TreeNode, TreeError> {
        let names = self.names(path)?;
        if names.is_empty() {
            return Err(TreeError::NotFound {
                path: path.to_path_buf(),
            });
        }

        let (_, removed) = descend(&mut self.root, &names, path, |parent, name| {
            let removed = parent.take_child(name).ok_or_else(|| TreeError::NotFound {
                path: path.to_path_buf(),
            })?;
            let delta = SizeDelta::between(Some(&removed), None);
            Ok((delta, removed))
        })?;
        Ok(removed)
    }

    /// Refresh a node's own timestamps without touching its children.
    pub fn update_dir_meta(
        &mut self,
        path: &Path,
        modified: SystemTime,
        scanned_at: SystemTime,
    ) -> Result<(), TreeError> {
        let names = self.names(path)?;
        let mut node = &mut self.root;
        for name in &names {
            node = node.child_mut(name).ok_or_else(|| TreeError::NotFound {
                path: path.to_path_buf(),
            })?;
        }
        node.modified = modified;
        node.scanned_at = scanned_at;
        Ok(())
    }

    /// Recompute aggregates from the node at `path` up to the root.
    pub fn recompute_ancestors(&mut self, path: &Path) -> Result<(), TreeError> {
        let names = self.names(path)?;
        recompute_path(&mut self.root, &names, path)
    }

    /// Check the aggregation invariant, returning the first offending path.
    pub fn verify_aggregates(&self) -> Result<(), PathBuf> {
        let mut offending = None;
        self.visit(|path, node, _| {
            if offending.is_some() {
                return;
            }
            if !node.totals_match_children() {
                offending = Some(path.to_path_buf());
            }
        });
        match offending {
            Some(path) => Err(path),
            None => Ok(()),
        }
    }

    /// Visit every node in pre-order with its reconstructed path and depth.
    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&Path, &TreeNode, usize),
    {
        let mut path = self.root_path.clone();
        visit_node(&self.root, &mut path, 0, true, &mut f);
    }

    /// Every node carrying its own error, with its path.
    pub fn errored_paths(&self) -> Vec<(PathBuf, EntryError)> {
        let mut out = Vec::new();
        self.visit(|path, node, _| {
            if let Some(err) = &node.error {
                out.push((path.to_path_buf(), err.clone()));
            }
        });
        out
    }

    /// Directories whose subtree contains at least one unreadable entry.
    pub fn partially_unreadable_dirs(&self) -> Vec<(PathBuf, u64)> {
        let mut out = Vec::new();
        self.visit(|path, node, _| {
            if node.is_dir() && node.error_count > 0 {
                out.push((path.to_path_buf(), node.error_count));
            }
        });
        out
    }
}

fn descend<R, F>(
    node: &mut TreeNode,
    names: &[CompactString],
    path: &Path,
    op: F,
) -> Result<(SizeDelta, R), TreeError>
where
    F: FnOnce(&mut TreeNode, &str) -> Result<(SizeDelta, R), TreeError>,
{
    let (first, rest) = names.split_first().ok_or_else(|| TreeError::NotFound {
        path: path.to_path_buf(),
    })?;

    let (delta, out) = if rest.is_empty() {
        op(node, first)?
    } else {
        let child = node.child_mut(first).ok_or_else(|| TreeError::NotFound {
            path: path.to_path_buf(),
        })?;
        if !child.is_dir() {
            return Err(TreeError::NotADirectory {
                path: path.to_path_buf(),
            });
        }
        descend(child, rest, path, op)?
    };

    node.apply_delta(&delta);
    Ok((delta, out))
}

fn recompute_path(node: &mut TreeNode, names: &[CompactString], path: &Path) -> Result<(), TreeError> {
    if let Some((first, rest)) = names.split_first() {
        let child = node.child_mut(first).ok_or_else(|| TreeError::NotFound {
            path: path.to_path_buf(),
        })?;
        recompute_path(child, rest, path)?;
    }
    node.recompute_totals();
    Ok(())
}

fn visit_node<F>(node: &TreeNode, path: &mut PathBuf, depth: usize, is_root: bool, f: &mut F)
where
    F: FnMut(&Path, &TreeNode, usize),
{
    if !is_root {
        path.push(node.name.as_str());
    }
    f(path, node, depth);
    for child in node.children() {
        visit_node(child, path, depth + 1, false, f);
    }
    if !is_root {
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> TreeNode {
        TreeNode::new_file(name, size, SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH)
    }

    fn dir(name: &str) -> TreeNode {
        TreeNode::new_directory(name, SystemTime::UNIX_EPOCH, SystemTime::UNIX_EPOCH)
    }

    fn sample() -> FileTree {
        let mut root = dir("data");
        root.add_child(file("a", 100));
        root.add_child(file("b", 200));
        let mut sub = dir("sub");
        sub.add_child(file("c", 50));
        root.add_child(sub);
        FileTree::new(root, "/data", ScanPolicy::default())
    }

    #[test]
    fn test_tree_stats_record_file() {
        let mut stats = TreeStats::new();
        stats.record_file(Path::new("/test/file.TXT"), 1024, 2);

        assert_eq!(stats.total_files, 1);
        assert_eq!(stats.total_size, 1024);
        assert_eq!(stats.max_depth, 2);
        assert_eq!(stats.extension_sizes.get("txt"), Some(&1024));
        assert!(stats.largest_file.is_some());
    }

    #[test]
    fn test_get_by_path() {
        let tree = sample();
        assert_eq!(tree.get(Path::new("/data")).map(|n| n.size), Some(350));
        assert_eq!(tree.get(Path::new("/data/sub/c")).map(|n| n.size), Some(50));
        assert!(tree.get(Path::new("/data/missing")).is_none());
        assert!(tree.get(Path::new("/elsewhere")).is_none());
    }

    #[test]
    fn test_replace_subtree_propagates() {
        let mut tree = sample();
        let mut sub = dir("ignored-name");
        sub.add_child(file("c", 50));
        sub.add_child(file("d", 25));

        let delta = tree.replace_subtree(Path::new("/data/sub"), sub).unwrap();

        assert_eq!(delta.net_size(), 25);
        assert_eq!(tree.total_size(), 375);
        assert_eq!(tree.total_files(), 4);
        assert!(tree.get(Path::new("/data/sub/d")).is_some());
        assert!(tree.verify_aggregates().is_ok());
    }

    #[test]
    fn test_replace_inserts_new_child() {
        let mut tree = sample();
        tree.replace_subtree(Path::new("/data/sub/e"), file("e", 5))
            .unwrap();

        assert_eq!(tree.get(Path::new("/data/sub")).map(|n| n.size), Some(55));
        assert_eq!(tree.total_size(), 355);
    }

    #[test]
    fn test_replace_under_file_fails() {
        let mut tree = sample();
        let err = tree
            .replace_subtree(Path::new("/data/a/x"), file("x", 1))
            .unwrap_err();
        assert!(matches!(err, TreeError::NotADirectory { .. }));
    }

    #[test]
    fn test_remove_subtree() {
        let mut tree = sample();
        let removed = tree.remove_subtree(Path::new("/data/sub/c")).unwrap();

        assert_eq!(removed.size, 50);
        assert_eq!(tree.total_size(), 300);
        assert_eq!(tree.get(Path::new("/data/sub")).map(|n| n.size), Some(0));
        assert!(tree.remove_subtree(Path::new("/data")).is_err());
        assert!(tree.verify_aggregates().is_ok());
    }

    #[test]
    fn test_recompute_ancestors_repairs_sizes() {
        let mut tree = sample();
        tree.root.size = 0;
        assert_eq!(tree.verify_aggregates(), Err(PathBuf::from("/data")));

        tree.recompute_ancestors(Path::new("/data/sub")).unwrap();
        assert_eq!(tree.total_size(), 350);
        assert!(tree.verify_aggregates().is_ok());
    }

    #[test]
    fn test_errored_paths() {
        let mut tree = sample();
        let mut locked = dir("locked");
        locked.kind = NodeKind::Inaccessible;
        locked.error = Some(EntryError::PermissionDenied);
        locked.recompute_totals();
        tree.replace_subtree(Path::new("/data/sub/locked"), locked)
            .unwrap();

        assert_eq!(tree.error_count(), 1);
        assert_eq!(
            tree.errored_paths(),
            vec![(PathBuf::from("/data/sub/locked"), EntryError::PermissionDenied)]
        );
        let partial: Vec<PathBuf> = tree
            .partially_unreadable_dirs()
            .into_iter()
            .map(|(p, _)| p)
            .collect();
        assert_eq!(partial, vec![PathBuf::from("/data"), PathBuf::from("/data/sub")]);
    }

    #[test]
    fn test_stats_collected() {
        let tree = sample();
        assert_eq!(tree.stats.total_files, 3);
        assert_eq!(tree.stats.total_dirs, 2);
        assert_eq!(tree.stats.total_size, 350);
        assert_eq!(
            tree.stats.largest_file,
            Some((PathBuf::from("/data/b"), 200))
        );
    }
}

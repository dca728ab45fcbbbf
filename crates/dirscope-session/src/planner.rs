//! Change detection against the cache.
//!
//! The planner walks down from the session root one shallow listing at a
//! time. A directory whose modification time and child fingerprint match
//! its cached record is trusted as a whole; anything else is either patched
//! in place or handed to a walker.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use dirscope_cache::{CacheStore, LoadedSubtree};
use dirscope_core::{CacheRecord, Entry, FileTree, ScanError, TreeNode};
use dirscope_scan::{AncestorChain, Listing, ProgressTracker, WalkOptions, list_dir};

/// A directory re-listed because its contents changed.
#[derive(Debug)]
pub(crate) struct Patch {
    pub(crate) path: PathBuf,
    pub(crate) listing: Listing,
}

/// A subtree that must be walked from scratch.
#[derive(Debug, Clone)]
pub(crate) struct WalkJob {
    pub(crate) path: PathBuf,
    /// Directories above `path`.
    pub(crate) ancestors: AncestorChain,
}

/// A tombstoned subtree that reappeared unchanged.
#[derive(Debug)]
pub(crate) struct Revive {
    pub(crate) path: PathBuf,
    pub(crate) node: TreeNode,
}

/// Everything the planner decided for one session.
#[derive(Debug, Default)]
pub(crate) struct Plan {
    /// Directories that could not be read, as error leaves.
    pub(crate) leaves: Vec<(PathBuf, TreeNode)>,
    /// Changed directories, in pre-order.
    pub(crate) patches: Vec<Patch>,
    pub(crate) walks: Vec<WalkJob>,
    pub(crate) revives: Vec<Revive>,
    /// Directories confirmed unchanged, with the record that confirmed them.
    pub(crate) fresh: Vec<(PathBuf, CacheRecord)>,
    pub(crate) dirs_listed: u64,
}

impl Plan {
    /// A plan that walks the whole root.
    pub(crate) fn walk_all(root: &Path) -> Self {
        Self {
            walks: vec![WalkJob {
                path: root.to_path_buf(),
                ancestors: AncestorChain::new(),
            }],
            ..Default::default()
        }
    }

    /// Paths whose subtree content comes from this session rather than the base.
    pub(crate) fn changed_paths(&self) -> impl Iterator<Item = &Path> {
        self.leaves
            .iter()
            .map(|(p, _)| p.as_path())
            .chain(self.patches.iter().map(|p| p.path.as_path()))
            .chain(self.walks.iter().map(|w| w.path.as_path()))
            .chain(self.revives.iter().map(|r| r.path.as_path()))
    }
}

/// Whether a listed child gets its own check rather than a leaf node.
pub(crate) fn descends(options: &WalkOptions, entry: &Entry) -> bool {
    entry.is_dir() && !entry.has_error() && options.may_descend(entry.inode.map(|i| i.device))
}

pub(crate) struct Planner<'a> {
    store: &'a CacheStore,
    options: &'a Arc<WalkOptions>,
    progress: &'a ProgressTracker,
    base: Option<&'a FileTree>,
    loaded: &'a LoadedSubtree,
    root: &'a Path,
    deep_verify: bool,
    now: SystemTime,
    plan: Plan,
}

impl<'a> Planner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: &'a CacheStore,
        options: &'a Arc<WalkOptions>,
        progress: &'a ProgressTracker,
        base: Option<&'a FileTree>,
        loaded: &'a LoadedSubtree,
        root: &'a Path,
        deep_verify: bool,
        now: SystemTime,
    ) -> Self {
        Self {
            store,
            options,
            progress,
            base,
            loaded,
            root,
            deep_verify,
            now,
            plan: Plan::default(),
        }
    }

    /// Check the whole root and return the plan.
    pub(crate) fn run(mut self) -> Result<Plan, ScanError> {
        let root = self.root;
        self.check_dir(root, &AncestorChain::new())?;
        Ok(self.plan)
    }

    fn check_dir(&mut self, path: &Path, ancestors: &AncestorChain) -> Result<(), ScanError> {
        if self.options.cancel_token().was_cancelled() {
            return Err(ScanError::SessionCancelled);
        }
        self.progress.set_current_path(path);

        let Some(record) = self.record(path)?.filter(CacheRecord::is_dir) else {
            debug!(path = %path.display(), "no directory record, walking");
            self.walk(path, ancestors);
            return Ok(());
        };

        let in_base = self
            .base
            .is_some_and(|tree| tree.get(path).is_some_and(TreeNode::is_dir));
        if !in_base && !record.is_tombstoned() {
            debug!(path = %path.display(), "record not reachable from a live parent, walking");
            self.walk(path, ancestors);
            return Ok(());
        }

        let listing = list_dir(path, self.options, ancestors).ok_or(ScanError::SessionCancelled)?;
        self.plan.dirs_listed += 1;
        self.progress.record_entry(&listing.dir);
        for child in &listing.children {
            self.progress.record_entry(child);
        }

        if !listing.is_readable() {
            if path == self.root {
                return Err(ScanError::RootUnavailable {
                    path: path.to_path_buf(),
                    reason: listing
                        .dir
                        .error
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "not a directory".to_string()),
                });
            }
            self.plan
                .leaves
                .push((path.to_path_buf(), TreeNode::from_entry(&listing.dir, self.now)));
            return Ok(());
        }

        let matches = record.matches(listing.dir.modified, &listing.fingerprint())
            && !self.loaded.has_corrupt_under(path);

        if !in_base {
            if matches {
                if let Some(node) = self.revivable(path)? {
                    debug!(path = %path.display(), "reviving tombstoned subtree");
                    self.plan.revives.push(Revive {
                        path: path.to_path_buf(),
                        node,
                    });
                    return Ok(());
                }
            }
            self.walk(path, ancestors);
            return Ok(());
        }

        let below = ancestors.child(listing.dir.inode);
        if matches {
            self.plan.fresh.push((path.to_path_buf(), record));
            if self.deep_verify {
                let dirs = self.descendable(&listing);
                for dir in dirs {
                    self.check_dir(&dir, &below)?;
                }
            }
            return Ok(());
        }

        debug!(path = %path.display(), "directory changed, patching");
        let dirs = self.descendable(&listing);
        self.plan.patches.push(Patch {
            path: path.to_path_buf(),
            listing,
        });
        for dir in dirs {
            self.check_dir(&dir, &below)?;
        }
        Ok(())
    }

    fn record(&self, path: &Path) -> Result<Option<CacheRecord>, ScanError> {
        match self.store.get(path) {
            Ok(record) => Ok(record),
            Err(err) if err.is_corrupt() => {
                warn!(error = %err, "corrupt cache row treated as miss");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn revivable(&self, path: &Path) -> Result<Option<TreeNode>, ScanError> {
        let loaded = self.store.load_subtree(path, true)?;
        if !loaded.corrupt.is_empty() {
            return Ok(None);
        }
        Ok(loaded.root.filter(TreeNode::is_dir))
    }

    fn descendable(&self, listing: &Listing) -> Vec<PathBuf> {
        listing
            .children
            .iter()
            .filter(|child| descends(self.options, child))
            .map(|child| child.path.clone())
            .collect()
    }

    fn walk(&mut self, path: &Path, ancestors: &AncestorChain) {
        self.plan.walks.push(WalkJob {
            path: path.to_path_buf(),
            ancestors: ancestors.clone(),
        });
    }
}

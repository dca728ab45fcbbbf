//! One scan session: plan, walk, aggregate, commit.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use compact_str::CompactString;
use tracing::{debug, info};

use dirscope_cache::{CacheStore, DirectoryBatch, LoadedSubtree};
use dirscope_core::{
    CacheRecord, FileTree, ScanError, ScanPolicy, ScanWarning, TreeError, TreeNode,
};
use dirscope_scan::{SessionState, WalkOptions, Walker, build_subtree};

use crate::handle::{ScanOutcome, ScanSummary, SessionShared};
use crate::planner::{Patch, Plan, Planner, WalkJob, descends};

/// Everything a session thread needs.
pub(crate) struct Session {
    pub(crate) shared: Arc<SessionShared>,
    pub(crate) store: Arc<CacheStore>,
    pub(crate) pool: Arc<rayon::ThreadPool>,
    pub(crate) options: Arc<WalkOptions>,
    pub(crate) policy: ScanPolicy,
    pub(crate) tombstone_ttl: Duration,
}

impl Session {
    /// Run the session to completion on the current thread.
    pub(crate) fn run(self) -> Result<ScanOutcome, ScanError> {
        let started = Instant::now();
        let now = SystemTime::now();
        let root = self.shared.root.clone();
        let progress = &self.shared.progress;
        let uses_cache = self.policy.uses_cache();

        progress.set_state(SessionState::Planning);
        let loaded = if uses_cache {
            self.store.load_subtree(&root, false)?
        } else {
            LoadedSubtree::default()
        };
        let (root_node, has_base) = match loaded.root.clone() {
            Some(node) if node.is_dir() => (node, true),
            _ => (TreeNode::new_directory(root_name(&root), UNIX_EPOCH, now), false),
        };
        let mut tree = FileTree::new(root_node, root.clone(), self.policy.clone());

        let plan = if uses_cache {
            Planner::new(
                &self.store,
                &self.options,
                progress,
                has_base.then_some(&tree),
                &loaded,
                &root,
                self.policy.deep_verify,
                now,
            )
            .run()?
        } else {
            Plan::walk_all(&root)
        };
        debug!(
            root = %root.display(),
            listed = plan.dirs_listed,
            patches = plan.patches.len(),
            walks = plan.walks.len(),
            revives = plan.revives.len(),
            fresh = plan.fresh.len(),
            "plan ready"
        );

        progress.set_state(SessionState::Walking);
        let walked = self.walk(&plan.walks, now)?;
        if self.shared.cancel.was_cancelled() {
            return Err(ScanError::SessionCancelled);
        }
        if let Some((_, node)) = walked.iter().find(|(path, _)| *path == root) {
            check_root(&root, node)?;
        }

        progress.set_state(SessionState::Aggregating);
        let walked_paths: Vec<PathBuf> = walked.iter().map(|(p, _)| p.clone()).collect();
        self.aggregate(&mut tree, &plan, walked, now)?;
        debug_assert!(tree.verify_aggregates().is_ok());
        tree.warnings = tree
            .errored_paths()
            .into_iter()
            .map(|(path, error)| ScanWarning::new(path, error))
            .collect();
        tree.scanned_at = now;
        tree.refresh_stats();

        if !progress.begin_commit(&self.shared.cancel) {
            return Err(ScanError::SessionCancelled);
        }
        let paths_tombstoned = if uses_cache {
            self.commit(&tree, &plan, &walked_paths, now)?
        } else {
            0
        };
        tree.scan_duration = started.elapsed();

        let counters = progress.snapshot();
        let summary = ScanSummary {
            dirs_listed: plan.dirs_listed,
            dirs_patched: plan.patches.len() as u64,
            subtrees_walked: plan.walks.len() as u64,
            subtrees_reused: plan.fresh.len() as u64,
            subtrees_revived: plan.revives.len() as u64,
            paths_tombstoned,
            entries_scanned: counters.entries_scanned,
            errors_seen: counters.errors_seen,
        };
        info!(
            root = %root.display(),
            size = tree.total_size(),
            files = tree.total_files(),
            walked = summary.subtrees_walked,
            patched = summary.dirs_patched,
            elapsed_ms = tree.scan_duration.as_millis() as u64,
            "scan complete"
        );

        Ok(ScanOutcome {
            tree: Arc::new(tree),
            summary,
        })
    }

    /// Walk every job on the pool and wait for all of them.
    fn walk(&self, jobs: &[WalkJob], now: SystemTime) -> Result<Vec<(PathBuf, TreeNode)>, ScanError> {
        if jobs.is_empty() {
            return Ok(Vec::new());
        }

        let (tx, rx) = crossbeam_channel::unbounded();
        for job in jobs {
            let tx = tx.clone();
            let shared = Arc::clone(&self.shared);
            let path = job.path.clone();
            let walker = Walker::new(&job.path, Arc::clone(&self.options)).with_ancestors(job.ancestors.clone());
            self.pool.spawn(move || {
                let result = build_subtree(walker, now, &shared.progress);
                let _ = tx.send((path, result));
            });
        }
        drop(tx);

        let mut built = Vec::with_capacity(jobs.len());
        let mut failure = None;
        for (path, result) in rx {
            match result {
                Ok(subtree) => built.push((path, subtree.root)),
                Err(err) => {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(built),
        }
    }

    /// Splice plan results into the base tree.
    fn aggregate(
        &self,
        tree: &mut FileTree,
        plan: &Plan,
        walked: Vec<(PathBuf, TreeNode)>,
        now: SystemTime,
    ) -> Result<(), TreeError> {
        for (path, node) in &plan.leaves {
            tree.replace_subtree(path, node.clone())?;
        }
        for patch in &plan.patches {
            self.apply_patch(tree, patch, now)?;
        }
        for revive in &plan.revives {
            tree.replace_subtree(&revive.path, revive.node.clone())?;
        }
        for (path, node) in walked {
            tree.replace_subtree(&path, node)?;
        }
        Ok(())
    }

    fn apply_patch(&self, tree: &mut FileTree, patch: &Patch, now: SystemTime) -> Result<(), TreeError> {
        let present: HashSet<&str> = patch.listing.children.iter().map(|c| c.name.as_str()).collect();
        let vanished: Vec<CompactString> = tree
            .get(&patch.path)
            .ok_or_else(|| TreeError::NotFound {
                path: patch.path.clone(),
            })?
            .children()
            .iter()
            .filter(|child| !present.contains(child.name.as_str()))
            .map(|child| child.name.clone())
            .collect();
        for name in vanished {
            tree.remove_subtree(&patch.path.join(name.as_str()))?;
        }

        for child in &patch.listing.children {
            if descends(&self.options, child) {
                continue;
            }
            tree.replace_subtree(&child.path, TreeNode::from_entry(child, now))?;
        }
        tree.update_dir_meta(&patch.path, patch.listing.dir.modified, now)
    }

    /// Persist what changed. Returns the number of records newly tombstoned.
    fn commit(
        &self,
        tree: &FileTree,
        plan: &Plan,
        walked: &[PathBuf],
        now: SystemTime,
    ) -> Result<u64, ScanError> {
        let store = &self.store;

        for path in walked {
            store.invalidate(path)?;
        }
        for revive in &plan.revives {
            store.revive_subtree(&revive.path)?;
        }

        let mut touched: Vec<PathBuf> = plan.patches.iter().map(|p| p.path.clone()).collect();
        for path in walked.iter().chain(plan.leaves.iter().map(|(p, _)| p)) {
            if let Some(node) = tree.get(path) {
                collect_dirs(path, node, &mut touched);
            }
        }

        let changed: Vec<&Path> = plan.changed_paths().collect();
        let mut confirmed = Vec::new();
        for (path, _) in &plan.fresh {
            let has_changes_below = changed
                .iter()
                .any(|c| *c != path.as_path() && c.starts_with(path));
            if has_changes_below {
                touched.push(path.clone());
            } else {
                confirmed.push(path.clone());
            }
        }
        confirmed.extend(plan.revives.iter().map(|r| r.path.clone()));

        // Deepest first: a parent record is written after its children.
        touched.sort_by_key(|path| std::cmp::Reverse(path.components().count()));
        let mut tombstoned = 0;
        for path in &touched {
            let Some(node) = tree.get(path).filter(|n| n.is_dir()) else {
                continue;
            };
            let record = CacheRecord::from_node(node, Some(node.child_fingerprint()), now);
            let mut batch = DirectoryBatch::new(path, record, now);
            for child in node.children() {
                if child.is_dir() {
                    batch.keep(child.name.clone());
                } else {
                    batch.child(child.name.clone(), CacheRecord::from_node(child, None, now));
                }
            }
            tombstoned += store.commit_directory(&batch)? as u64;
        }

        store.mark_scanned(&confirmed, now)?;
        if let Some(cutoff) = now.checked_sub(self.tombstone_ttl) {
            store.purge_tombstones(cutoff)?;
        }
        store.flush()?;
        Ok(tombstoned)
    }
}

/// Every directory at or below `node`.
fn collect_dirs(path: &Path, node: &TreeNode, out: &mut Vec<PathBuf>) {
    if !node.is_dir() {
        return;
    }
    out.push(path.to_path_buf());
    for child in node.children() {
        collect_dirs(&path.join(child.name.as_str()), child, out);
    }
}

/// A walked root must come back as a readable directory.
fn check_root(root: &Path, node: &TreeNode) -> Result<(), ScanError> {
    let reason = match &node.error {
        Some(error) => error.to_string(),
        None if !node.is_dir() => "not a directory".to_string(),
        None => return Ok(()),
    };
    Err(ScanError::RootUnavailable {
        path: root.to_path_buf(),
        reason,
    })
}

fn root_name(root: &Path) -> CompactString {
    match root.file_name() {
        Some(name) => CompactString::new(name.to_string_lossy()),
        None => CompactString::new(root.to_string_lossy()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use dirscope_scan::CancelToken;
    use tempfile::TempDir;

    use crate::handle::SessionShared;

    fn session(root: &Path, store: Arc<CacheStore>) -> Session {
        let cancel = CancelToken::new();
        let policy = ScanPolicy::default();
        let options = WalkOptions::from_policy(&policy).unwrap().with_cancel(cancel.clone());
        let pool = rayon::ThreadPoolBuilder::new().num_threads(1).build().unwrap();
        Session {
            shared: Arc::new(SessionShared::new(1, root.to_path_buf(), 1000, cancel)),
            store,
            pool: Arc::new(pool),
            options: Arc::new(options),
            policy,
            tombstone_ttl: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_root_removed_before_walk_fails() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("data");
        fs::create_dir_all(root.join("sub")).unwrap();
        fs::write(root.join("sub/file.bin"), [0u8; 16]).unwrap();
        let root = dunce::canonicalize(&root).unwrap();

        let store = Arc::new(CacheStore::temporary().unwrap());
        let session = session(&root, Arc::clone(&store));
        fs::remove_dir_all(&root).unwrap();

        let err = session.run().unwrap_err();
        assert!(matches!(err, ScanError::RootUnavailable { ref path, .. } if *path == root));
        assert!(store.is_empty());
    }

    #[test]
    fn test_check_root_accepts_directory() {
        let root = Path::new("/data");
        let dir = TreeNode::new_directory("data", UNIX_EPOCH, UNIX_EPOCH);
        assert!(check_root(root, &dir).is_ok());

        let file = TreeNode::new_file("data", 10, UNIX_EPOCH, UNIX_EPOCH);
        assert!(matches!(
            check_root(root, &file),
            Err(ScanError::RootUnavailable { .. })
        ));
    }
}

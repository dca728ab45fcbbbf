//! Scan coordinator.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, SystemTime};

use tracing::{info, warn};

use dirscope_cache::CacheStore;
use dirscope_core::{CacheRecord, FileTree, ScanError, ScanPolicy};
use dirscope_scan::{CancelToken, ScanProgress, WalkOptions, device};

use crate::config::CoordinatorConfig;
use crate::handle::{ScanOutcome, SessionHandle, SessionShared};
use crate::registry::ActiveRoots;
use crate::session::Session;

/// Runs scan sessions against one cache store.
///
/// Cloning a coordinator is cheap; clones share the store, the worker pool
/// and the set of active roots.
#[derive(Debug, Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: CoordinatorConfig,
    store: Arc<CacheStore>,
    pool: Arc<rayon::ThreadPool>,
    active: Arc<ActiveRoots>,
    next_id: AtomicU64,
}

impl Coordinator {
    /// Open the cache at `config.cache_path` and start a worker pool.
    pub fn new(config: CoordinatorConfig) -> Result<Self, ScanError> {
        config.validate()?;
        if let Some(parent) = config.cache_path.parent() {
            fs::create_dir_all(parent).map_err(|e| ScanError::Cache {
                message: format!("{}: {e}", parent.display()),
            })?;
        }
        let store = CacheStore::open(&config.cache_path)?;
        Self::with_store(config, Arc::new(store))
    }

    /// Use an already opened store.
    pub fn with_store(config: CoordinatorConfig, store: Arc<CacheStore>) -> Result<Self, ScanError> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("dirscope-walk-{i}"))
            .build()
            .map_err(|e| ScanError::Other {
                message: format!("failed to start worker pool: {e}"),
            })?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                pool: Arc::new(pool),
                active: Arc::new(ActiveRoots::default()),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Start a session for `root` and return immediately.
    ///
    /// Fails synchronously when the root cannot be read, the policy is
    /// invalid, or a session for an overlapping root is still running.
    pub fn start_scan(&self, root: impl AsRef<Path>, policy: ScanPolicy) -> Result<SessionHandle, ScanError> {
        self.start_with_cancel(root.as_ref(), policy, CancelToken::new())
    }

    pub(crate) fn start_with_cancel(
        &self,
        root: &Path,
        policy: ScanPolicy,
        cancel: CancelToken,
    ) -> Result<SessionHandle, ScanError> {
        let root = dunce::canonicalize(root).map_err(|e| ScanError::root_io(root, &e))?;
        let metadata = fs::metadata(&root).map_err(|e| ScanError::root_io(&root, &e))?;
        if !metadata.is_dir() {
            return Err(ScanError::RootUnavailable {
                path: root,
                reason: "not a directory".to_string(),
            });
        }
        fs::read_dir(&root).map_err(|e| ScanError::root_io(&root, &e))?;

        let options = WalkOptions::from_policy(&policy)?
            .with_root_device(device(&metadata))
            .with_cancel(cancel.clone());

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = self.inner.active.claim(&root, id)?;
        let shared = Arc::new(SessionShared::new(
            id,
            root.clone(),
            self.inner.config.progress_interval,
            cancel,
        ));

        let session = Session {
            shared: Arc::clone(&shared),
            store: Arc::clone(&self.inner.store),
            pool: Arc::clone(&self.inner.pool),
            options: Arc::new(options),
            policy,
            tombstone_ttl: self.inner.config.tombstone_ttl(),
        };

        info!(id, root = %root.display(), "scan started");
        let thread_shared = Arc::clone(&shared);
        thread::Builder::new()
            .name(format!("dirscope-session-{id}"))
            .spawn(move || {
                let outcome = session.run();
                if let Err(err) = &outcome {
                    info!(id, error = %err, "scan failed");
                }
                drop(guard);
                thread_shared.finish(outcome);
            })
            .map_err(|e| ScanError::Other {
                message: format!("failed to start session thread: {e}"),
            })?;

        Ok(SessionHandle { shared })
    }

    /// Start a session and block until it finishes.
    pub fn scan(&self, root: impl AsRef<Path>, policy: ScanPolicy) -> Result<ScanOutcome, ScanError> {
        self.start_scan(root, policy)?.wait()
    }

    /// Request cancellation of a session. Returns whether it took effect.
    pub fn cancel(&self, handle: &SessionHandle) -> bool {
        handle.cancel()
    }

    /// Current progress of a session.
    pub fn poll_progress(&self, handle: &SessionHandle) -> ScanProgress {
        handle.progress()
    }

    /// Finished tree of a session, once it is done.
    pub fn snapshot(&self, handle: &SessionHandle) -> Option<Arc<FileTree>> {
        handle.snapshot()
    }

    /// Cached record for `path`, without touching the filesystem beyond
    /// path normalization.
    ///
    /// Corrupt rows read as absent.
    pub fn query_cache(&self, path: impl AsRef<Path>) -> Result<Option<CacheRecord>, ScanError> {
        let path = normalize(path.as_ref());
        match self.inner.store.get(&path) {
            Ok(record) => Ok(record),
            Err(err) if err.is_corrupt() => {
                warn!(error = %err, "corrupt cache row treated as miss");
                Ok(None)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Live records not confirmed within `max_age`.
    pub fn list_stale(&self, max_age: Duration) -> Result<Vec<(PathBuf, CacheRecord)>, ScanError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(self.inner.store.list_stale_before(cutoff)?)
    }

    /// Delete tombstones older than `max_age`. Returns how many.
    pub fn purge_tombstones(&self, max_age: Duration) -> Result<usize, ScanError> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let purged = self.inner.store.purge_tombstones(cutoff)?;
        self.inner.store.flush()?;
        Ok(purged)
    }

    /// Drop every record at or below `path`. Returns how many.
    pub fn forget(&self, path: impl AsRef<Path>) -> Result<usize, ScanError> {
        let path = normalize(path.as_ref());
        let removed = self.inner.store.delete_subtree(&path)?;
        self.inner.store.flush()?;
        Ok(removed)
    }

    /// Roots with a running session.
    pub fn active_roots(&self) -> Vec<PathBuf> {
        self.inner.active.list()
    }

    /// The underlying cache store.
    pub fn store(&self) -> &Arc<CacheStore> {
        &self.inner.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }
}

/// Canonical form of `path`, or the path as given if it no longer exists.
fn normalize(path: &Path) -> PathBuf {
    dunce::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;
    use tempfile::TempDir;

    fn coordinator(temp: &TempDir) -> Coordinator {
        let config = CoordinatorConfig {
            cache_path: temp.path().join("cache"),
            workers: 2,
            ..Default::default()
        };
        Coordinator::new(config).unwrap()
    }

    fn populate(root: &Path) {
        for dir in ["a", "a/x", "b", "c"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }
        for (i, dir) in ["a", "a/x", "b", "c"].iter().enumerate() {
            let mut f = File::create(root.join(dir).join("file.bin")).unwrap();
            f.write_all(&vec![0u8; 10 * (i + 1)]).unwrap();
        }
    }

    #[test]
    fn test_cancelled_walk_commits_nothing() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        populate(&data);
        let coordinator = coordinator(&temp);

        let handle = coordinator
            .start_with_cancel(&data, ScanPolicy::default(), CancelToken::after_checks(2))
            .unwrap();
        let err = handle.wait().unwrap_err();

        assert!(err.is_cancelled());
        assert!(coordinator.store().is_empty());
        assert!(coordinator.active_roots().is_empty());

        let outcome = coordinator.scan(&data, ScanPolicy::default()).unwrap();
        assert_eq!(outcome.tree.total_size(), 100);
        assert_eq!(outcome.summary.subtrees_walked, 1);
    }

    #[test]
    fn test_overlapping_scan_rejected() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        populate(&data);
        let coordinator = coordinator(&temp);

        let root = dunce::canonicalize(&data).unwrap();
        let _guard = coordinator.inner.active.claim(&root.join("a"), 99).unwrap();

        let err = coordinator.start_scan(&data, ScanPolicy::default()).unwrap_err();
        assert!(matches!(err, ScanError::ScanAlreadyInProgress { .. }));
    }

    #[test]
    fn test_query_and_forget() {
        let temp = TempDir::new().unwrap();
        let data = temp.path().join("data");
        populate(&data);
        let coordinator = coordinator(&temp);

        coordinator.scan(&data, ScanPolicy::default()).unwrap();
        let record = coordinator.query_cache(data.join("a")).unwrap().unwrap();
        assert_eq!(record.size, 30);
        assert_eq!(record.file_count, 2);

        assert_eq!(coordinator.forget(data.join("a")).unwrap(), 4);
        assert!(coordinator.query_cache(data.join("a")).unwrap().is_none());
        assert!(coordinator.query_cache(data.join("b")).unwrap().is_some());
    }
}

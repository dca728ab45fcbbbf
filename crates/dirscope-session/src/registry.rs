//! Registry of roots with an active session.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use dirscope_core::ScanError;

/// Roots currently being scanned, keyed by normalized path.
#[derive(Debug, Default)]
pub(crate) struct ActiveRoots {
    roots: DashMap<PathBuf, u64>,
    register: Mutex<()>,
}

impl ActiveRoots {
    /// Claim `root` for session `id`.
    ///
    /// Fails when an active root equals, contains, or lies inside `root`.
    pub(crate) fn claim(self: &Arc<Self>, root: &Path, id: u64) -> Result<RootGuard, ScanError> {
        let _guard = self.register.lock();
        let overlapping = self
            .roots
            .iter()
            .any(|active| active.key().starts_with(root) || root.starts_with(active.key()));
        if overlapping {
            return Err(ScanError::ScanAlreadyInProgress {
                root: root.to_path_buf(),
            });
        }
        self.roots.insert(root.to_path_buf(), id);
        Ok(RootGuard {
            roots: Arc::clone(self),
            root: root.to_path_buf(),
        })
    }

    /// Snapshot of the active roots.
    pub(crate) fn list(&self) -> Vec<PathBuf> {
        let mut roots: Vec<PathBuf> = self.roots.iter().map(|r| r.key().clone()).collect();
        roots.sort();
        roots
    }
}

/// Releases a claimed root when dropped.
#[derive(Debug)]
pub(crate) struct RootGuard {
    roots: Arc<ActiveRoots>,
    root: PathBuf,
}

impl Drop for RootGuard {
    fn drop(&mut self) {
        self.roots.roots.remove(&self.root);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlapping_roots_rejected() {
        let roots = Arc::new(ActiveRoots::default());
        let guard = roots.claim(Path::new("/data"), 1).unwrap();

        assert!(roots.claim(Path::new("/data"), 2).is_err());
        assert!(roots.claim(Path::new("/data/sub"), 3).is_err());
        assert!(roots.claim(Path::new("/"), 4).is_err());

        let other = roots.claim(Path::new("/database"), 5).unwrap();
        assert_eq!(roots.list(), vec![PathBuf::from("/data"), PathBuf::from("/database")]);

        drop(guard);
        drop(other);
        assert!(roots.claim(Path::new("/data/sub"), 6).is_ok());
    }
}

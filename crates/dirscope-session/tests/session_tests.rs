use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dirscope_cache::CacheStore;
use dirscope_session::{
    Coordinator, CoordinatorConfig, ScanError, ScanPolicy, SessionState,
};
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    root: PathBuf,
    coordinator: Coordinator,
}

fn config(temp: &TempDir) -> CoordinatorConfig {
    CoordinatorConfig {
        cache_path: temp.path().join("cache"),
        workers: 2,
        ..Default::default()
    }
}

/// `data/` holding `a` (100 B), `b` (200 B) and `sub/c` (50 B).
fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("data");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("a"), vec![0u8; 100]).unwrap();
    fs::write(root.join("b"), vec![0u8; 200]).unwrap();
    fs::write(root.join("sub/c"), vec![0u8; 50]).unwrap();
    let root = fs::canonicalize(root).unwrap();
    let coordinator = Coordinator::new(config(&temp)).unwrap();
    Fixture {
        _temp: temp,
        root,
        coordinator,
    }
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

fn set_mtime(path: &Path, time: SystemTime) {
    File::open(path).unwrap().set_modified(time).unwrap();
}

/// Move a directory's mtime well clear of any timestamp granularity.
fn bump_mtime(path: &Path) {
    set_mtime(path, mtime(path) + Duration::from_secs(10));
}

#[test]
fn test_first_scan_aggregates() {
    let f = fixture();
    let outcome = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    let tree = &outcome.tree;

    assert_eq!(tree.total_size(), 350);
    assert_eq!(tree.total_files(), 3);
    assert_eq!(tree.get(&f.root.join("sub")).map(|n| n.size), Some(50));
    assert!(tree.verify_aggregates().is_ok());
    assert!(!tree.has_warnings());

    assert_eq!(outcome.summary.subtrees_walked, 1);
    assert_eq!(outcome.summary.dirs_listed, 0);
    assert_eq!(outcome.summary.entries_scanned, 5);

    let record = f.coordinator.query_cache(&f.root).unwrap().unwrap();
    assert_eq!(record.size, 350);
    assert_eq!(record.file_count, 3);
    assert!(record.fingerprint.is_some());
}

#[test]
fn test_unchanged_rescan_lists_only_root() {
    let f = fixture();
    let first = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    let second = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    assert_eq!(second.summary.dirs_listed, 1);
    assert_eq!(second.summary.dirs_rewalked(), 0);
    assert_eq!(second.summary.subtrees_reused, 1);
    assert_eq!(second.summary.paths_tombstoned, 0);
    assert!(second.tree.root.structurally_eq(&first.tree.root));
    assert_eq!(second.tree.total_size(), 350);
}

#[test]
fn test_deleted_file_patches_only_changed_dirs() {
    let f = fixture();
    f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    let sub = f.root.join("sub");
    fs::remove_file(sub.join("c")).unwrap();
    bump_mtime(&sub);

    let outcome = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    let tree = &outcome.tree;
    assert_eq!(tree.total_size(), 300);
    assert_eq!(tree.get(&sub).map(|n| n.size), Some(0));
    assert!(tree.verify_aggregates().is_ok());

    assert_eq!(outcome.summary.dirs_listed, 2);
    assert_eq!(outcome.summary.dirs_patched, 2);
    assert_eq!(outcome.summary.subtrees_walked, 0);
    assert_eq!(outcome.summary.paths_tombstoned, 1);

    let gone = f.coordinator.query_cache(sub.join("c")).unwrap().unwrap();
    assert!(gone.is_tombstoned());
    assert_eq!(f.coordinator.query_cache(&f.root).unwrap().unwrap().size, 300);
    assert_eq!(f.coordinator.query_cache(&sub).unwrap().unwrap().size, 0);
}

#[test]
fn test_new_subdirectory_is_walked() {
    let f = fixture();
    f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    let fresh = f.root.join("sub/fresh");
    fs::create_dir(&fresh).unwrap();
    fs::write(fresh.join("d"), vec![0u8; 25]).unwrap();
    bump_mtime(&f.root.join("sub"));

    let outcome = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    assert_eq!(outcome.tree.total_size(), 375);
    assert_eq!(outcome.summary.subtrees_walked, 1);
    assert_eq!(outcome.summary.dirs_patched, 2);
    assert_eq!(f.coordinator.query_cache(&fresh).unwrap().unwrap().size, 25);
}

#[test]
fn test_vanished_subtree_is_tombstoned_and_revived() {
    let f = fixture();
    f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    let sub = f.root.join("sub");
    let sub_mtime = mtime(&sub);
    let parked = f.root.parent().unwrap().join("parked");
    fs::rename(&sub, &parked).unwrap();

    let outcome = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    assert_eq!(outcome.tree.total_size(), 300);
    assert!(outcome.tree.get(&sub).is_none());
    assert_eq!(outcome.summary.paths_tombstoned, 2);
    assert!(f.coordinator.query_cache(&sub).unwrap().unwrap().is_tombstoned());

    fs::rename(&parked, &sub).unwrap();
    set_mtime(&sub, sub_mtime);

    let outcome = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    assert_eq!(outcome.tree.total_size(), 350);
    assert_eq!(outcome.summary.subtrees_revived, 1);
    assert_eq!(outcome.summary.subtrees_walked, 0);
    assert!(outcome.tree.verify_aggregates().is_ok());

    let record = f.coordinator.query_cache(&sub).unwrap().unwrap();
    assert!(!record.is_tombstoned());
    assert!(!f.coordinator.query_cache(sub.join("c")).unwrap().unwrap().is_tombstoned());
}

#[test]
fn test_stale_listing_and_purge() {
    let f = fixture();
    f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    assert!(f.coordinator.list_stale(Duration::from_secs(3600)).unwrap().is_empty());
    assert_eq!(f.coordinator.list_stale(Duration::ZERO).unwrap().len(), 5);

    fs::remove_file(f.root.join("b")).unwrap();
    bump_mtime(&f.root);
    f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();

    assert_eq!(f.coordinator.purge_tombstones(Duration::from_secs(3600)).unwrap(), 0);
    assert_eq!(f.coordinator.purge_tombstones(Duration::ZERO).unwrap(), 1);
    assert!(f.coordinator.query_cache(f.root.join("b")).unwrap().is_none());
}

#[test]
fn test_root_unavailable() {
    let f = fixture();

    let missing = f.coordinator.start_scan(f.root.join("missing"), ScanPolicy::default());
    assert!(matches!(missing, Err(ScanError::RootUnavailable { .. })));

    let file = f.coordinator.start_scan(f.root.join("a"), ScanPolicy::default());
    assert!(matches!(file, Err(ScanError::RootUnavailable { .. })));
    assert!(f.coordinator.active_roots().is_empty());
}

#[test]
fn test_depth_limited_scan_bypasses_cache() {
    let f = fixture();
    let policy = ScanPolicy::builder().max_depth(1u32).build().unwrap();

    let outcome = f.coordinator.scan(&f.root, policy).unwrap();
    assert_eq!(outcome.tree.total_size(), 300);
    assert_eq!(outcome.tree.get(&f.root.join("sub")).map(|n| n.size), Some(0));
    assert!(f.coordinator.store().is_empty());
}

#[test]
fn test_progress_after_completion() {
    let f = fixture();
    let handle = f.coordinator.start_scan(&f.root, ScanPolicy::default()).unwrap();
    handle.wait().unwrap();

    let progress = f.coordinator.poll_progress(&handle);
    assert_eq!(progress.state, SessionState::Done);
    assert_eq!(progress.entries_scanned, 5);
    assert_eq!(progress.bytes_scanned, 350);
    assert!(f.coordinator.snapshot(&handle).is_some());
    assert!(handle.summary().is_some());
}

#[test]
fn test_disjoint_roots_run_concurrently() {
    let f = fixture();
    let other = f.root.parent().unwrap().join("other");
    fs::create_dir(&other).unwrap();
    fs::write(other.join("x"), vec![0u8; 7]).unwrap();

    let first = f.coordinator.start_scan(&f.root, ScanPolicy::default()).unwrap();
    let second = f.coordinator.start_scan(&other, ScanPolicy::default()).unwrap();

    assert_eq!(first.wait().unwrap().tree.total_size(), 350);
    assert_eq!(second.wait().unwrap().tree.total_size(), 7);
    assert_ne!(first.id(), second.id());
}

#[cfg(unix)]
#[test]
fn test_corrupt_row_is_a_miss() {
    use std::os::unix::ffi::OsStrExt;

    let temp = TempDir::new().unwrap();
    let root = temp.path().join("data");
    fs::create_dir_all(root.join("sub")).unwrap();
    fs::write(root.join("a"), vec![0u8; 100]).unwrap();
    fs::write(root.join("sub/c"), vec![0u8; 50]).unwrap();
    let root = fs::canonicalize(root).unwrap();

    let db = sled::Config::new().temporary(true).open().unwrap();
    let store = Arc::new(CacheStore::from_db(db.clone()).unwrap());
    let coordinator = Coordinator::with_store(config(&temp), store).unwrap();
    coordinator.scan(&root, ScanPolicy::default()).unwrap();

    let sub = root.join("sub");
    db.open_tree("records")
        .unwrap()
        .insert(sub.as_os_str().as_bytes(), vec![0xff, 0x00])
        .unwrap();
    assert!(coordinator.query_cache(&sub).unwrap().is_none());

    let outcome = coordinator.scan(&root, ScanPolicy::default()).unwrap();
    assert_eq!(outcome.tree.total_size(), 150);
    assert_eq!(outcome.summary.dirs_patched, 1);
    assert_eq!(outcome.summary.subtrees_walked, 1);
    assert_eq!(coordinator.query_cache(&sub).unwrap().unwrap().size, 50);
}

#[cfg(unix)]
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    fs::metadata("/proc/self").map(|m| m.uid() == 0).unwrap_or(false)
}

#[cfg(unix)]
#[test]
fn test_unreadable_directory_is_rechecked() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        return;
    }

    let f = fixture();
    let locked = f.root.join("locked");
    fs::create_dir(&locked).unwrap();
    fs::write(locked.join("inner"), vec![0u8; 1000]).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    let first = f.coordinator.scan(&f.root, ScanPolicy::default());
    let second = f.coordinator.scan(&f.root, ScanPolicy::default());
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    let (first, second) = (first.unwrap(), second.unwrap());

    for outcome in [&first, &second] {
        assert_eq!(outcome.tree.total_size(), 350);
        assert_eq!(outcome.tree.error_count(), 1);
        assert_eq!(outcome.tree.warnings.len(), 1);
    }
    assert_eq!(second.summary.subtrees_walked, 1);

    let third = f.coordinator.scan(&f.root, ScanPolicy::default()).unwrap();
    assert_eq!(third.tree.total_size(), 1350);
    assert_eq!(third.tree.error_count(), 0);
}

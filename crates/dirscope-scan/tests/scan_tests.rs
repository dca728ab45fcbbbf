use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use dirscope_scan::{
    AncestorChain, CancelToken, EntryError, EntryKind, ProgressTracker, ScanPolicy, WalkOptions,
    Walker, build_subtree, identity, list_dir,
};
use tempfile::TempDir;

fn options(policy: &ScanPolicy) -> Arc<WalkOptions> {
    Arc::new(WalkOptions::from_policy(policy).unwrap())
}

fn sample_tree() -> TempDir {
    let temp = TempDir::new().unwrap();
    let root = temp.path();
    fs::write(root.join("a"), vec![0u8; 100]).unwrap();
    fs::write(root.join("b"), vec![0u8; 200]).unwrap();
    fs::create_dir(root.join("sub")).unwrap();
    fs::write(root.join("sub/c"), vec![0u8; 50]).unwrap();
    temp
}

#[test]
fn test_build_sample_tree() {
    let temp = sample_tree();
    let progress = ProgressTracker::default();
    let built = build_subtree(
        Walker::new(temp.path(), options(&ScanPolicy::default())),
        SystemTime::now(),
        &progress,
    )
    .unwrap();

    assert_eq!(built.root.size, 350);
    assert_eq!(built.root.child("sub").map(|n| n.size), Some(50));
    assert_eq!(built.root.file_count(), 3);
    assert!(built.root.is_consistent());
    assert!(built.warnings.is_empty());

    let snapshot = progress.snapshot();
    assert_eq!(snapshot.entries_scanned, 5);
    assert_eq!(snapshot.bytes_scanned, 350);
    assert_eq!(snapshot.dirs_walked, 2);
}

#[test]
fn test_stable_order_across_passes() {
    let temp = sample_tree();
    for name in ["zeta", "alpha", "Mid", "beta"] {
        fs::write(temp.path().join(name), "x").unwrap();
    }
    let first: Vec<_> = Walker::new(temp.path(), options(&ScanPolicy::default()))
        .walk()
        .map(|e| e.path)
        .collect();
    let second: Vec<_> = Walker::new(temp.path(), options(&ScanPolicy::default()))
        .walk()
        .map(|e| e.path)
        .collect();

    assert_eq!(first, second);
    let top: Vec<_> = first
        .iter()
        .filter(|p| p.parent() == Some(temp.path()))
        .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
        .collect();
    let mut sorted = top.clone();
    sorted.sort();
    assert_eq!(top, sorted);
}

#[test]
fn test_cancel_mid_walk() {
    let temp = sample_tree();
    for i in 0..5 {
        fs::create_dir_all(temp.path().join(format!("d{i}/inner"))).unwrap();
    }
    let cancel = CancelToken::after_checks(3);
    let opts = WalkOptions::from_policy(&ScanPolicy::default())
        .unwrap()
        .with_cancel(cancel.clone());

    let result = build_subtree(
        Walker::new(temp.path(), Arc::new(opts)),
        SystemTime::now(),
        &ProgressTracker::default(),
    );

    assert!(result.unwrap_err().is_cancelled());
    assert!(cancel.was_cancelled());
}

#[cfg(unix)]
#[test]
fn test_symlink_to_ancestor_does_not_loop() {
    let temp = sample_tree();
    std::os::unix::fs::symlink(temp.path(), temp.path().join("sub/loop")).unwrap();

    let policy = ScanPolicy::builder().follow_symlinks(true).build().unwrap();
    let entries: Vec<_> = Walker::new(temp.path(), options(&policy)).walk().collect();

    let link = entries
        .iter()
        .find(|e| e.name == "loop")
        .expect("symlink entry");
    assert_eq!(link.kind, EntryKind::Symlink);
    assert_eq!(link.size, 0);
    assert_eq!(link.link.as_ref().map(|l| l.broken), Some(false));
    assert!(entries.iter().all(|e| e.depth <= 2));
    assert_eq!(entries.len(), 6);
}

#[cfg(unix)]
#[test]
fn test_broken_symlink_resolution() {
    let temp = TempDir::new().unwrap();
    std::os::unix::fs::symlink("/definitely/not/here", temp.path().join("dangling")).unwrap();

    let plain: Vec<_> = Walker::new(temp.path(), options(&ScanPolicy::default()))
        .walk()
        .collect();
    assert!(plain[1].link.is_none());

    let policy = ScanPolicy::builder().follow_symlinks(true).build().unwrap();
    let resolved: Vec<_> = Walker::new(temp.path(), options(&policy)).walk().collect();
    let link = resolved[1].link.as_ref().unwrap();
    assert!(link.broken);
    assert_eq!(link.target, "/definitely/not/here");
}

#[cfg(unix)]
fn running_as_root() -> bool {
    use std::os::unix::fs::MetadataExt;
    fs::metadata("/proc/self").map(|m| m.uid() == 0).unwrap_or(false)
}

#[cfg(unix)]
#[test]
fn test_unreadable_child_is_counted() {
    use std::os::unix::fs::PermissionsExt;

    if running_as_root() {
        return;
    }

    let temp = sample_tree();
    let locked = temp.path().join("locked");
    fs::create_dir(&locked).unwrap();
    fs::write(locked.join("hidden-size"), vec![0u8; 1000]).unwrap();
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();

    let built = build_subtree(
        Walker::new(temp.path(), options(&ScanPolicy::default())),
        SystemTime::now(),
        &ProgressTracker::default(),
    );
    fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
    let built = built.unwrap();

    assert_eq!(built.root.size, 350);
    assert_eq!(built.root.error_count, 1);
    let node = built.root.child("locked").unwrap();
    assert_eq!(node.error, Some(EntryError::PermissionDenied));
    assert_eq!(node.size, 0);
    assert_eq!(built.warnings.len(), 1);
}

#[test]
fn test_list_dir_reports_children_only() {
    let temp = sample_tree();
    let listing = list_dir(
        temp.path(),
        &options(&ScanPolicy::default()),
        &AncestorChain::new(),
    )
    .unwrap();

    assert_eq!(listing.dir.depth, 0);
    let names: Vec<&str> = listing.children.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["a", "b", "sub"]);
    assert!(Path::new(&listing.children[2].path).ends_with("sub"));
}

#[cfg(unix)]
#[test]
fn test_directory_on_ancestor_chain_is_a_cycle() {
    let temp = sample_tree();
    fs::create_dir_all(temp.path().join("loop/inner")).unwrap();
    fs::write(temp.path().join("loop/inner/d"), vec![0u8; 10]).unwrap();

    let mut ancestors = AncestorChain::new();
    let looped = fs::metadata(temp.path().join("loop")).unwrap();
    ancestors.push(identity(&looped).unwrap());

    let entries: Vec<_> = Walker::new(temp.path(), options(&ScanPolicy::default()))
        .with_ancestors(ancestors)
        .walk()
        .collect();

    let looped = entries
        .iter()
        .find(|e| e.path == temp.path().join("loop"))
        .unwrap();
    assert_eq!(looped.kind, EntryKind::Inaccessible);
    assert_eq!(looped.error, Some(EntryError::CycleDetected));
    assert!(!entries.iter().any(|e| e.path.starts_with(temp.path().join("loop/inner"))));
    assert!(entries.iter().any(|e| e.path == temp.path().join("sub/c")));
}

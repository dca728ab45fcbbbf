//! JWalk-based directory walker.

use std::ffi::OsStr;
use std::fs::{self, Metadata};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use compact_str::CompactString;
use globset::{Glob, GlobSet, GlobSetBuilder};
use jwalk::{DirEntry, Parallelism, WalkDirGeneric};
use tracing::debug;

use dirscope_core::{Entry, EntryError, EntryKind, Fingerprint, LinkTarget, ScanError, ScanPolicy};

use crate::ancestry::{self, AncestorChain};
use crate::cancel::CancelToken;

/// Per-entry state computed while a directory is read.
#[derive(Debug, Default)]
pub struct EntryState {
    metadata: Option<Metadata>,
    link: Option<LinkTarget>,
    error: Option<EntryError>,
}

type WalkState = (AncestorChain, EntryState);
type RawEntry = Result<DirEntry<WalkState>, jwalk::Error>;

/// Traversal options shared by every walker of a session.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    follow_symlinks: bool,
    cross_filesystems: bool,
    include_hidden: bool,
    max_depth: Option<usize>,
    ignore: Option<GlobSet>,
    root_device: Option<u64>,
    cancel: CancelToken,
}

impl WalkOptions {
    /// Build options from a policy, compiling its ignore patterns.
    pub fn from_policy(policy: &ScanPolicy) -> Result<Self, ScanError> {
        let ignore = if policy.ignore_patterns.is_empty() {
            None
        } else {
            let mut builder = GlobSetBuilder::new();
            for pattern in &policy.ignore_patterns {
                let glob = Glob::new(pattern).map_err(|e| ScanError::InvalidConfig {
                    message: format!("invalid ignore pattern {pattern:?}: {e}"),
                })?;
                builder.add(glob);
            }
            Some(builder.build().map_err(|e| ScanError::InvalidConfig {
                message: e.to_string(),
            })?)
        };

        Ok(Self {
            follow_symlinks: policy.follow_symlinks,
            cross_filesystems: policy.cross_filesystems,
            include_hidden: policy.include_hidden,
            max_depth: policy.max_depth.map(|d| d as usize),
            ignore,
            root_device: None,
            cancel: CancelToken::new(),
        })
    }

    /// Pin the device that counts as "same filesystem".
    pub fn with_root_device(mut self, device: u64) -> Self {
        self.root_device = Some(device);
        self
    }

    /// Share a cancellation token.
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// The cancellation token walkers check.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Device of the session root, if pinned.
    pub fn root_device(&self) -> Option<u64> {
        self.root_device
    }

    /// Whether a directory on `device` may be descended.
    pub fn may_descend(&self, device: Option<u64>) -> bool {
        self.cross_filesystems || self.root_device.is_none() || device == self.root_device
    }

    fn is_ignored(&self, name: &OsStr) -> bool {
        if !self.include_hidden && name.as_encoded_bytes().starts_with(b".") {
            return true;
        }
        self.ignore
            .as_ref()
            .is_some_and(|set| set.is_match(Path::new(name)))
    }

    /// Stat one child and decide whether it may be descended.
    fn inspect(&self, child: &mut DirEntry<WalkState>, chain: &AncestorChain) {
        let path = child.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            Err(err) => {
                child.client_state.error = Some(EntryError::from_io(&err));
                child.read_children_path = None;
                return;
            }
        };

        let file_type = metadata.file_type();
        if file_type.is_dir() {
            let id = ancestry::identity(&metadata);
            if id.is_some_and(|id| chain.contains(&id)) {
                debug!(path = %path.display(), "directory cycle");
                child.client_state.error = Some(EntryError::CycleDetected);
                child.read_children_path = None;
            } else if !self.may_descend(Some(ancestry::device(&metadata))) {
                debug!(path = %path.display(), "not crossing filesystem boundary");
                child.read_children_path = None;
            }
        } else if file_type.is_symlink() && self.follow_symlinks {
            child.client_state.link = resolve_link(&path);
        }
        child.client_state.metadata = Some(metadata);
    }

    fn process_read_dir(
        &self,
        initial: &AncestorChain,
        depth: Option<usize>,
        dir: &Path,
        chain: &mut AncestorChain,
        children: &mut Vec<RawEntry>,
    ) {
        match depth {
            // Reading the walk root's parent: only the root itself is listed.
            None => *chain = initial.clone(),
            Some(_) => {
                if let Some(id) = fs::symlink_metadata(dir).ok().as_ref().and_then(ancestry::identity) {
                    chain.push(id);
                }
            }
        }

        if self.cancel.was_cancelled() {
            for child in children.iter_mut().flatten() {
                child.read_children_path = None;
            }
            return;
        }

        if depth.is_some() {
            children.retain(|child| match child {
                Ok(entry) => !self.is_ignored(entry.file_name()),
                Err(_) => true,
            });
            children.sort_by(|a, b| match (a, b) {
                (Ok(a), Ok(b)) => a.file_name().cmp(b.file_name()),
                (Ok(_), Err(_)) => std::cmp::Ordering::Less,
                (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
                (Err(_), Err(_)) => std::cmp::Ordering::Equal,
            });
        }

        for child in children.iter_mut().flatten() {
            self.inspect(child, chain);
        }
    }
}

/// Walks one subtree and yields its entries in pre-order.
#[derive(Debug, Clone)]
pub struct Walker {
    root: PathBuf,
    options: Arc<WalkOptions>,
    ancestors: AncestorChain,
    max_depth: Option<usize>,
}

impl Walker {
    /// Create a walker rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, options: Arc<WalkOptions>) -> Self {
        let max_depth = options.max_depth;
        Self {
            root: root.into(),
            options,
            ancestors: AncestorChain::new(),
            max_depth,
        }
    }

    /// Directories above the walk root, for cycle detection.
    pub fn with_ancestors(mut self, ancestors: AncestorChain) -> Self {
        self.ancestors = ancestors;
        self
    }

    /// Only read the root directory itself.
    pub fn shallow(mut self) -> Self {
        self.max_depth = Some(1);
        self
    }

    /// Get the walk root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Start walking.
    pub fn walk(self) -> WalkIter {
        let options = Arc::clone(&self.options);
        let cancel = options.cancel.clone();
        let initial = self.ancestors;

        let mut walk_dir = WalkDirGeneric::<WalkState>::new(&self.root)
            .parallelism(Parallelism::Serial)
            .skip_hidden(false)
            .follow_links(false)
            .sort(false)
            .process_read_dir(move |depth, dir, chain, children| {
                options.process_read_dir(&initial, depth, dir, chain, children);
            });
        if let Some(max_depth) = self.max_depth {
            walk_dir = walk_dir.max_depth(max_depth);
        }

        WalkIter {
            inner: Box::new(walk_dir.into_iter()),
            pending: None,
            cancel,
            cancelled: false,
            exhausted: false,
        }
    }

    /// Read only the root directory and its direct children.
    ///
    /// Returns `None` when the walk was cancelled.
    pub fn list(self) -> Option<Listing> {
        let mut iter = self.shallow().walk();
        let dir = iter.next()?;
        let children: Vec<Entry> = iter.by_ref().collect();
        if iter.was_cancelled() {
            return None;
        }
        Some(Listing { dir, children })
    }
}

/// Shallow listing of one directory.
pub fn list_dir(path: &Path, options: &Arc<WalkOptions>, ancestors: &AncestorChain) -> Option<Listing> {
    Walker::new(path, Arc::clone(options))
        .with_ancestors(ancestors.clone())
        .list()
}

/// A directory's own entry plus its direct children, sorted by name.
#[derive(Debug, Clone)]
pub struct Listing {
    pub dir: Entry,
    pub children: Vec<Entry>,
}

impl Listing {
    /// Whether the directory itself could be read.
    pub fn is_readable(&self) -> bool {
        self.dir.is_dir() && !self.dir.has_error()
    }

    /// Fingerprint of the listed children.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_entries(&self.children)
    }
}

/// Entry iterator returned by [`Walker::walk`].
///
/// One entry is held back so that a read failure reported right after a
/// directory can be folded into that directory's entry.
pub struct WalkIter {
    inner: Box<dyn Iterator<Item = RawEntry>>,
    pending: Option<Entry>,
    cancel: CancelToken,
    cancelled: bool,
    exhausted: bool,
}

impl WalkIter {
    /// Whether the walk stopped because of cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled
    }

    fn next_raw(&mut self) -> Option<Entry> {
        loop {
            let item = self.inner.next()?;
            match item {
                Ok(dent) => {
                    let entry = convert(dent);
                    if entry.is_dir() && self.cancel.is_cancelled() {
                        self.cancelled = true;
                        return None;
                    }
                    return Some(entry);
                }
                Err(err) => {
                    let failure = err
                        .io_error()
                        .map(EntryError::from_io)
                        .unwrap_or_else(|| EntryError::Io {
                            message: err.to_string(),
                        });
                    let Some(path) = err.path().map(Path::to_path_buf) else {
                        debug!(error = %err, "walk error without a path");
                        continue;
                    };
                    debug!(path = %path.display(), error = %failure, "unreadable entry");

                    if let Some(pending) = self.pending.as_mut() {
                        if pending.path == path {
                            pending.mark_failed(failure);
                            continue;
                        }
                    }
                    let name = entry_name(&path);
                    return Some(Entry::inaccessible(path, name, err.depth(), failure));
                }
            }
        }
    }
}

impl Iterator for WalkIter {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        while !self.exhausted {
            match self.next_raw() {
                Some(entry) => {
                    if let Some(prev) = self.pending.replace(entry) {
                        return Some(prev);
                    }
                }
                None => self.exhausted = true,
            }
        }
        self.pending.take()
    }
}

fn convert(dent: DirEntry<WalkState>) -> Entry {
    let path = dent.path();
    let name = entry_name(&path);
    let depth = dent.depth;
    let state = dent.client_state;

    let Some(metadata) = state.metadata else {
        let error = state.error.unwrap_or(EntryError::Vanished);
        return Entry::inaccessible(path, name, depth, error);
    };

    let file_type = metadata.file_type();
    let (kind, size) = if file_type.is_dir() {
        (EntryKind::Directory, 0)
    } else if file_type.is_file() {
        (EntryKind::File, metadata.len())
    } else if file_type.is_symlink() {
        (EntryKind::Symlink, 0)
    } else {
        (EntryKind::Special, 0)
    };

    let mut entry = Entry {
        path,
        name,
        kind,
        size,
        modified: metadata.modified().unwrap_or(UNIX_EPOCH),
        depth,
        inode: ancestry::identity(&metadata),
        link: state.link,
        error: None,
    };
    if let Some(error) = state.error {
        entry.mark_failed(error);
    }
    entry
}

fn entry_name(path: &Path) -> CompactString {
    match path.file_name() {
        Some(name) => CompactString::new(name.to_string_lossy()),
        None => CompactString::new(path.to_string_lossy()),
    }
}

fn resolve_link(path: &Path) -> Option<LinkTarget> {
    let target = fs::read_link(path).ok()?;
    Some(LinkTarget {
        target: CompactString::new(target.to_string_lossy()),
        broken: fs::metadata(path).is_err(),
    })
}

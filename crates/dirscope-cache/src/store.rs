//! Sled-backed cache store.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use compact_str::CompactString;
use parking_lot::Mutex;
use tracing::{debug, warn};

use dirscope_core::{CacheRecord, TreeNode};

use crate::error::CacheError;
use crate::key::{decode, descendant_prefix, encode, is_direct_child, key_path, path_key};

const RECORDS_TREE: &str = "records";

/// Records for one directory, committed as a single atomic batch.
///
/// Direct child records already in the store whose names are not in the
/// batch are tombstoned together with everything below them.
#[derive(Debug, Clone)]
pub struct DirectoryBatch {
    dir: PathBuf,
    record: CacheRecord,
    children: Vec<(CompactString, CacheRecord)>,
    present: BTreeSet<CompactString>,
    at: SystemTime,
}

impl DirectoryBatch {
    /// Start a batch for `dir` with its own record.
    pub fn new(dir: impl Into<PathBuf>, record: CacheRecord, at: SystemTime) -> Self {
        Self {
            dir: dir.into(),
            record,
            children: Vec::new(),
            present: BTreeSet::new(),
            at,
        }
    }

    /// Upsert a direct child's record.
    pub fn child(&mut self, name: impl Into<CompactString>, record: CacheRecord) -> &mut Self {
        let name = name.into();
        self.present.insert(name.clone());
        self.children.push((name, record));
        self
    }

    /// Keep a direct child whose record is committed separately.
    pub fn keep(&mut self, name: impl Into<CompactString>) -> &mut Self {
        self.present.insert(name.into());
        self
    }

    /// The directory this batch describes.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// A subtree rebuilt from stored records.
#[derive(Debug, Default)]
pub struct LoadedSubtree {
    /// Rebuilt subtree, `None` when the prefix has no usable record.
    pub root: Option<TreeNode>,
    /// Paths whose rows could not be decoded.
    pub corrupt: Vec<PathBuf>,
}

impl LoadedSubtree {
    /// Whether any corrupt row lies at or below `path`.
    pub fn has_corrupt_under(&self, path: &Path) -> bool {
        self.corrupt.iter().any(|p| p.starts_with(path))
    }
}

/// Durable mapping from normalized path to [`CacheRecord`].
///
/// Reads go straight to sled. Writes take a single writer lock for the
/// duration of one batch.
pub struct CacheStore {
    db: sled::Db,
    records: sled::Tree,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("records", &self.records.len())
            .finish()
    }
}

impl CacheStore {
    /// Open or create a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref();
        let db = sled::open(path).map_err(|source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_db(db)
    }

    /// Open a store that is deleted when dropped.
    pub fn temporary() -> Result<Self, CacheError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|source| CacheError::Open {
                path: PathBuf::new(),
                source,
            })?;
        Self::from_db(db)
    }

    /// Wrap an already opened sled database. Records live in their own tree.
    pub fn from_db(db: sled::Db) -> Result<Self, CacheError> {
        let records = db.open_tree(RECORDS_TREE)?;
        Ok(Self {
            db,
            records,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the record for a path. Tombstoned records are returned too.
    pub fn get(&self, path: &Path) -> Result<Option<CacheRecord>, CacheError> {
        let key = path_key(path);
        match self.records.get(&key)? {
            Some(bytes) => decode(&key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Insert or replace the record for a path.
    pub fn put(&self, path: &Path, record: &CacheRecord) -> Result<(), CacheError> {
        let value = encode(record)?;
        let _guard = self.write_lock.lock();
        self.records.insert(path_key(path), value)?;
        Ok(())
    }

    /// Remove the record for exactly one path.
    pub fn invalidate(&self, path: &Path) -> Result<bool, CacheError> {
        let _guard = self.write_lock.lock();
        Ok(self.records.remove(path_key(path))?.is_some())
    }

    /// Commit one directory: child upserts, tombstones for children that
    /// are gone, and the directory's own record, atomically.
    ///
    /// Records below an upserted child are tombstoned too, since upserted
    /// children are never directories. Returns how many records were newly
    /// tombstoned.
    pub fn commit_directory(&self, batch: &DirectoryBatch) -> Result<usize, CacheError> {
        let mut encoded = Vec::with_capacity(batch.children.len());
        for (name, record) in &batch.children {
            encoded.push((batch.dir.join(name.as_str()), encode(record)?));
        }
        let dir_value = encode(&batch.record)?;

        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let mut tombstoned = 0;

        for (path, value) in encoded {
            let below = self.descendant_keys(&path)?;
            tombstoned += self.stage_tombstones(&mut writes, below, batch.at)?;
            writes.insert(path_key(&path), value);
        }

        let prefix = descendant_prefix(&batch.dir);
        let mut vanished = Vec::new();
        for item in self.records.scan_prefix(&prefix).keys() {
            let key = item?;
            if !is_direct_child(&prefix, &key) {
                continue;
            }
            let name = String::from_utf8_lossy(&key[prefix.len()..]);
            if !batch.present.contains(&*name) {
                vanished.push(key_path(&key));
            }
        }
        for path in &vanished {
            debug!(path = %path.display(), "tombstoning vanished path");
            let keys = self.subtree_keys(path)?;
            tombstoned += self.stage_tombstones(&mut writes, keys, batch.at)?;
        }

        writes.insert(path_key(&batch.dir), dir_value);
        self.records.apply_batch(writes)?;
        Ok(tombstoned)
    }

    /// Remove the record at `prefix` and every record below it.
    pub fn delete_subtree(&self, prefix: &Path) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let mut count = 0;
        for key in self.subtree_keys(prefix)? {
            writes.remove(key);
            count += 1;
        }
        self.records.apply_batch(writes)?;
        Ok(count)
    }

    /// Mark the record at `prefix` and everything below it as missing.
    ///
    /// Returns how many records were newly tombstoned.
    pub fn tombstone_subtree(&self, prefix: &Path, at: SystemTime) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let keys = self.subtree_keys(prefix)?;
        let count = self.stage_tombstones(&mut writes, keys, at)?;
        self.records.apply_batch(writes)?;
        Ok(count)
    }

    fn stage_tombstones(
        &self,
        writes: &mut sled::Batch,
        keys: Vec<sled::IVec>,
        at: SystemTime,
    ) -> Result<usize, CacheError> {
        let mut count = 0;
        for key in keys {
            let Some(bytes) = self.records.get(&key)? else {
                continue;
            };
            match decode(&key, &bytes) {
                Ok(record) if record.is_tombstoned() => {}
                Ok(record) => {
                    writes.insert(key, encode(&record.tombstoned(at))?);
                    count += 1;
                }
                Err(err) => {
                    warn!(error = %err, "dropping corrupt cache row");
                    writes.remove(key);
                }
            }
        }
        Ok(count)
    }

    /// Clear tombstones at `prefix` and below. Returns how many were revived.
    ///
    /// Records that were tombstoned before `prefix` itself stay tombstoned.
    pub fn revive_subtree(&self, prefix: &Path) -> Result<usize, CacheError> {
        let since = self.tombstone_time(prefix)?;
        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let mut count = 0;
        for key in self.subtree_keys(prefix)? {
            let Some(bytes) = self.records.get(&key)? else {
                continue;
            };
            if let Ok(record) = decode(&key, &bytes) {
                if record.is_tombstoned() && !vanished_earlier(&record, since) {
                    writes.insert(key, encode(&record.revived())?);
                    count += 1;
                }
            }
        }
        self.records.apply_batch(writes)?;
        Ok(count)
    }

    /// Refresh `last_scanned` on live records confirmed unchanged.
    pub fn mark_scanned(&self, paths: &[PathBuf], at: SystemTime) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let mut count = 0;
        for path in paths {
            let key = path_key(path);
            let Some(bytes) = self.records.get(&key)? else {
                continue;
            };
            if let Ok(mut record) = decode(&key, &bytes) {
                if !record.is_tombstoned() {
                    record.last_scanned = at;
                    writes.insert(key, encode(&record)?);
                    count += 1;
                }
            }
        }
        self.records.apply_batch(writes)?;
        Ok(count)
    }

    /// Live records not confirmed since `cutoff`, in path order.
    pub fn list_stale_before(&self, cutoff: SystemTime) -> Result<Vec<(PathBuf, CacheRecord)>, CacheError> {
        let mut stale = Vec::new();
        for item in self.records.iter() {
            let (key, bytes) = item?;
            match decode(&key, &bytes) {
                Ok(record) if !record.is_tombstoned() && record.last_scanned < cutoff => {
                    stale.push((key_path(&key), record));
                }
                Ok(_) => {}
                Err(err) => warn!(error = %err, "skipping corrupt cache row"),
            }
        }
        Ok(stale)
    }

    /// Delete records tombstoned before `older_than`. Returns how many.
    pub fn purge_tombstones(&self, older_than: SystemTime) -> Result<usize, CacheError> {
        let _guard = self.write_lock.lock();
        let mut writes = sled::Batch::default();
        let mut count = 0;
        for item in self.records.iter() {
            let (key, bytes) = item?;
            if let Ok(record) = decode(&key, &bytes) {
                if record.tombstoned_at.is_some_and(|t| t < older_than) {
                    writes.remove(key);
                    count += 1;
                }
            }
        }
        self.records.apply_batch(writes)?;
        if count > 0 {
            debug!(count, "purged tombstones");
        }
        Ok(count)
    }

    fn tombstone_time(&self, path: &Path) -> Result<Option<SystemTime>, CacheError> {
        match self.get(path) {
            Ok(record) => Ok(record.and_then(|r| r.tombstoned_at)),
            Err(err) if err.is_corrupt() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Rebuild the subtree at `prefix` from stored records.
    ///
    /// With `include_tombstoned`, tombstoned records are loaded too, except
    /// those that vanished before a tombstoned `prefix` did. Corrupt rows
    /// are skipped and reported; records whose parent is missing, skipped
    /// or not a directory are ignored.
    pub fn load_subtree(&self, prefix: &Path, include_tombstoned: bool) -> Result<LoadedSubtree, CacheError> {
        let mut loaded = LoadedSubtree::default();

        let record = match self.get(prefix) {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(loaded),
            Err(err) if err.is_corrupt() => {
                warn!(error = %err, "corrupt cache row treated as miss");
                loaded.corrupt.push(prefix.to_path_buf());
                return Ok(loaded);
            }
            Err(err) => return Err(err),
        };
        if record.is_tombstoned() && !include_tombstoned {
            return Ok(loaded);
        }

        let since = record.tombstoned_at;
        let mut root = record.to_node(node_name(prefix));
        if root.is_dir() {
            for item in self.records.scan_prefix(descendant_prefix(prefix)) {
                let (key, bytes) = item?;
                let path = key_path(&key);
                let record = match decode(&key, &bytes) {
                    Ok(record) => record,
                    Err(err) => {
                        warn!(error = %err, "corrupt cache row treated as miss");
                        loaded.corrupt.push(path);
                        continue;
                    }
                };
                if record.is_tombstoned()
                    && (!include_tombstoned || vanished_earlier(&record, since))
                {
                    continue;
                }
                if !attach(&mut root, prefix, &path, &record) {
                    debug!(path = %path.display(), "orphan cache record");
                }
            }
            root.recompute_all();
        }

        loaded.root = Some(root);
        Ok(loaded)
    }

    /// Every stored path strictly below `prefix`.
    pub fn keys_under(&self, prefix: &Path) -> Result<Vec<PathBuf>, CacheError> {
        let mut paths = Vec::new();
        for key in self.records.scan_prefix(descendant_prefix(prefix)).keys() {
            paths.push(key_path(&key?));
        }
        Ok(paths)
    }

    fn subtree_keys(&self, prefix: &Path) -> Result<Vec<sled::IVec>, CacheError> {
        let mut keys = Vec::new();
        let own = path_key(prefix);
        if self.records.contains_key(&own)? {
            keys.push(sled::IVec::from(own));
        }
        keys.extend(self.descendant_keys(prefix)?);
        Ok(keys)
    }

    fn descendant_keys(&self, prefix: &Path) -> Result<Vec<sled::IVec>, CacheError> {
        self.records
            .scan_prefix(descendant_prefix(prefix))
            .keys()
            .map(|key| key.map_err(CacheError::from))
            .collect()
    }

    /// Number of stored records, tombstones included.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Bytes used by the database on disk.
    pub fn size_on_disk(&self) -> Result<u64, CacheError> {
        Ok(self.db.size_on_disk()?)
    }

    /// Remove every record.
    pub fn clear(&self) -> Result<(), CacheError> {
        let _guard = self.write_lock.lock();
        self.records.clear()?;
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), CacheError> {
        self.db.flush()?;
        Ok(())
    }
}

fn vanished_earlier(record: &CacheRecord, since: Option<SystemTime>) -> bool {
    match (record.tombstoned_at, since) {
        (Some(at), Some(since)) => at < since,
        _ => false,
    }
}

fn node_name(path: &Path) -> CompactString {
    match path.file_name() {
        Some(name) => CompactString::new(name.to_string_lossy()),
        None => CompactString::new(path.to_string_lossy()),
    }
}

fn attach(root: &mut TreeNode, prefix: &Path, path: &Path, record: &CacheRecord) -> bool {
    let Ok(rel) = path.strip_prefix(prefix) else {
        return false;
    };
    let names: Vec<CompactString> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(name) => Some(CompactString::new(name.to_string_lossy())),
            _ => None,
        })
        .collect();
    let Some((last, parents)) = names.split_last() else {
        return false;
    };

    let mut node = root;
    for name in parents {
        match node.child_mut(name) {
            Some(child) => node = child,
            None => return false,
        }
    }
    if !node.is_dir() {
        return false;
    }
    node.put_child(record.to_node(last.clone()));
    true
}

//! Core types for dirscope.
//!
//! This crate provides the data structures shared by the walker, the cache
//! store and the scan coordinator: raw entries, the aggregation tree,
//! child-set fingerprints, cache records and scan policy.

mod config;
mod entry;
mod error;
mod fingerprint;
mod node;
mod record;
mod tree;

pub use config::{ScanPolicy, ScanPolicyBuilder};
pub use entry::{Entry, EntryKind, InodeInfo, LinkTarget};
pub use error::{EntryError, ScanError, ScanWarning, TreeError};
pub use fingerprint::{Fingerprint, FingerprintItem};
pub use node::{NodeKind, SizeDelta, Totals, TreeNode};
pub use record::CacheRecord;
pub use tree::{FileTree, TreeStats};

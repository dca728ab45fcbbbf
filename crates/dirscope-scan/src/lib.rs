//! Filesystem walking and tree building for dirscope.
//!
//! This crate turns a directory on disk into an aggregation subtree.
//!
//! # Overview
//!
//! - [`Walker`] traverses one subtree with jwalk and yields [`Entry`] values
//!   in pre-order, children sorted by name. Per-entry failures are tagged on
//!   the entry and never stop the walk.
//! - [`list_dir`] reads a single directory, which is what the coordinator
//!   needs to compare a directory against its cached fingerprint.
//! - [`TreeBuilder`] folds an entry stream into a [`TreeNode`] subtree with
//!   exact cumulative sizes.
//! - [`ProgressTracker`] collects counters shared by concurrent walkers and
//!   broadcasts [`ScanProgress`] snapshots.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::SystemTime;
//! use dirscope_scan::{build_subtree, ProgressTracker, ScanPolicy, WalkOptions, Walker};
//!
//! let options = Arc::new(WalkOptions::from_policy(&ScanPolicy::default()).unwrap());
//! let progress = ProgressTracker::default();
//! let built = build_subtree(Walker::new("/path/to/scan", options), SystemTime::now(), &progress)
//!     .unwrap();
//!
//! println!("Total size: {} bytes", built.root.size);
//! println!("Total files: {}", built.root.file_count());
//! ```

mod ancestry;
mod builder;
mod cancel;
mod progress;
mod walker;

pub use ancestry::{AncestorChain, device, identity};
pub use builder::{BuiltSubtree, TreeBuilder, build_subtree};
pub use cancel::CancelToken;
pub use progress::{ProgressTracker, ScanProgress, SessionState};
pub use walker::{EntryState, Listing, WalkIter, WalkOptions, Walker, list_dir};

// Re-export core types for convenience
pub use dirscope_core::{Entry, EntryError, EntryKind, ScanError, ScanPolicy, ScanWarning, TreeNode};

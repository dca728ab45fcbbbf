//! Scan sessions for dirscope.
//!
//! A [`Coordinator`] owns the cache store and a worker pool. Each call to
//! [`Coordinator::start_scan`] runs one session on its own thread:
//!
//! 1. **Planning** loads the cached subtree of the root and compares each
//!    cached directory against a shallow listing, top down. Unchanged
//!    directories are trusted whole.
//! 2. **Walking** hands every subtree the cache cannot vouch for to the
//!    worker pool.
//! 3. **Aggregating** splices walked and patched subtrees into the cached
//!    tree, keeping every directory total exact.
//! 4. **Committing** writes one atomic batch per changed directory,
//!    tombstoning children that vanished.
//!
//! A cancelled or failed session commits nothing. Sessions on overlapping
//! roots are rejected while one is running.
//!
//! # Example
//!
//! ```rust,no_run
//! use dirscope_session::{Coordinator, CoordinatorConfig, ScanPolicy};
//!
//! let coordinator = Coordinator::new(CoordinatorConfig::load()).unwrap();
//! let outcome = coordinator.scan("/path/to/scan", ScanPolicy::default()).unwrap();
//!
//! println!("Total size: {} bytes", outcome.tree.total_size());
//! println!("Directories walked: {}", outcome.summary.subtrees_walked);
//! ```

mod config;
mod coordinator;
mod handle;
mod planner;
mod registry;
mod session;

pub use config::CoordinatorConfig;
pub use coordinator::Coordinator;
pub use handle::{ScanOutcome, ScanSummary, SessionHandle};

pub use dirscope_core::{CacheRecord, FileTree, ScanError, ScanPolicy, TreeNode};
pub use dirscope_scan::{ScanProgress, SessionState};

//! Persistent scan cache for dirscope.
//!
//! One sled tree keyed by normalized absolute path holds a [`CacheRecord`]
//! per scanned path. Values are bincode-encoded and prefixed with a format
//! version byte; rows that fail to decode are reported as
//! [`CacheError::Corrupt`] and treated as misses by readers.
//!
//! Keys are ordered bytes, so every record below a directory lives under
//! the directory's key followed by a separator and can be range-scanned
//! for subtree loads, tombstoning and deletion.

mod error;
mod key;
mod store;

pub use error::CacheError;
pub use key::FORMAT_VERSION;
pub use store::{CacheStore, DirectoryBatch, LoadedSubtree};

pub use dirscope_core::CacheRecord;

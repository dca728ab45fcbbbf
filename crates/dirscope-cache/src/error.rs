//! Cache store errors.

use std::path::PathBuf;

use dirscope_core::ScanError;
use thiserror::Error;

/// Errors from the cache store.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The database could not be opened.
    #[error("Failed to open cache at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: sled::Error,
    },

    /// The underlying store failed.
    #[error("Cache storage error: {0}")]
    Storage(#[from] sled::Error),

    /// A stored row could not be decoded.
    #[error("Corrupt cache record for {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    /// A record could not be encoded.
    #[error("Failed to encode cache record: {0}")]
    Encode(#[from] bincode::Error),
}

impl CacheError {
    /// Check if this error is a corrupt row, which readers treat as a miss.
    pub fn is_corrupt(&self) -> bool {
        matches!(self, CacheError::Corrupt { .. })
    }
}

impl From<CacheError> for ScanError {
    fn from(err: CacheError) -> Self {
        ScanError::Cache {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_scan_error() {
        let err = CacheError::Corrupt {
            path: PathBuf::from("/data"),
            reason: "bad version".into(),
        };
        assert!(err.is_corrupt());

        let scan: ScanError = err.into();
        assert!(matches!(scan, ScanError::Cache { ref message } if message.contains("/data")));
    }
}

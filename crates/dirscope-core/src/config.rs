//! Scan policy types.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

/// Traversal policy for one scan session.
#[derive(Debug, Clone, PartialEq, Eq, Builder, Serialize, Deserialize)]
#[builder(setter(into), build_fn(validate = "Self::validate"))]
pub struct ScanPolicy {
    /// Resolve symlink targets (targets are never descended).
    #[builder(default = "false")]
    #[serde(default)]
    pub follow_symlinks: bool,

    /// Descend into directories on other filesystems.
    #[builder(default = "false")]
    #[serde(default)]
    pub cross_filesystems: bool,

    /// Maximum depth to traverse (None = unlimited).
    ///
    /// Depth-limited scans neither read nor write the cache.
    #[builder(default)]
    #[serde(default)]
    pub max_depth: Option<u32>,

    /// Glob patterns matched against entry names.
    #[builder(default)]
    #[serde(default)]
    pub ignore_patterns: Vec<String>,

    /// Include hidden files (starting with .).
    #[builder(default = "true")]
    #[serde(default = "default_true")]
    pub include_hidden: bool,

    /// Keep checking child directories of fresh directories.
    #[builder(default = "false")]
    #[serde(default)]
    pub deep_verify: bool,
}

fn default_true() -> bool {
    true
}

impl ScanPolicyBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(Some(0)) = self.max_depth {
            return Err("max_depth must be at least 1".to_string());
        }
        if let Some(ref patterns) = self.ignore_patterns {
            if patterns.iter().any(|p| p.is_empty()) {
                return Err("Ignore patterns cannot be empty".to_string());
            }
        }
        Ok(())
    }
}

impl ScanPolicy {
    /// Create a new scan policy builder.
    pub fn builder() -> ScanPolicyBuilder {
        ScanPolicyBuilder::default()
    }

    /// Whether this policy may use and update the cache.
    pub fn uses_cache(&self) -> bool {
        self.max_depth.is_none()
    }

    /// Check if hidden files should be skipped.
    pub fn should_skip_hidden(&self, name: &str) -> bool {
        !self.include_hidden && name.starts_with('.')
    }
}

impl Default for ScanPolicy {
    fn default() -> Self {
        Self {
            follow_symlinks: false,
            cross_filesystems: false,
            max_depth: None,
            ignore_patterns: Vec::new(),
            include_hidden: true,
            deep_verify: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_builder() {
        let policy = ScanPolicy::builder()
            .follow_symlinks(true)
            .max_depth(Some(4u32))
            .build()
            .unwrap();

        assert!(policy.follow_symlinks);
        assert_eq!(policy.max_depth, Some(4));
        assert!(policy.include_hidden);
        assert!(!policy.uses_cache());
    }

    #[test]
    fn test_policy_builder_rejects_zero_depth() {
        assert!(ScanPolicy::builder().max_depth(Some(0u32)).build().is_err());
        assert!(
            ScanPolicy::builder()
                .ignore_patterns(vec![String::new()])
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_should_skip_hidden() {
        let mut policy = ScanPolicy::default();
        assert!(!policy.should_skip_hidden(".git"));

        policy.include_hidden = false;
        assert!(policy.should_skip_hidden(".git"));
        assert!(!policy.should_skip_hidden("src"));
    }

    #[test]
    fn test_policy_serde_defaults() {
        let policy: ScanPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, ScanPolicy::default());
    }
}

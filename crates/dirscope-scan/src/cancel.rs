//! Cooperative cancellation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Cancellation flag shared by a session, its planner and its walkers.
///
/// Checked at directory boundaries only, so a cancelled walk may still
/// finish the listing it is in.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    budget: Option<Arc<AtomicUsize>>,
}

impl CancelToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a token that cancels itself after `checks` boundary checks.
    pub fn after_checks(checks: usize) -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            budget: Some(Arc::new(AtomicUsize::new(checks))),
        }
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Check for cancellation at a directory boundary.
    pub fn is_cancelled(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }
        if let Some(budget) = &self.budget {
            let left = budget.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            if left.is_err() {
                self.cancel();
                return true;
            }
        }
        false
    }

    /// Read the flag without consuming a check.
    pub fn was_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();

        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn test_after_checks() {
        let token = CancelToken::after_checks(2);

        assert!(!token.is_cancelled());
        assert!(!token.is_cancelled());
        assert!(!token.was_cancelled());
        assert!(token.is_cancelled());
        assert!(token.was_cancelled());
    }
}

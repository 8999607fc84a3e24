//! Per-stage call budgets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Caps the external calls one stage may make.
///
/// All batches of a stage share one budget. Spending is all-or-nothing: a
/// request larger than what remains is refused and nothing is deducted.
#[derive(Debug, Default)]
pub struct CallBudget {
    limit: Option<u64>,
    used: AtomicU64,
    refused: AtomicBool,
}

impl CallBudget {
    /// A budget that never runs out.
    #[must_use]
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// A budget of `limit` calls.
    #[must_use]
    pub fn limited(limit: u64) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }

    /// Builds a budget from an optional limit.
    #[must_use]
    pub fn from_limit(limit: Option<u64>) -> Self {
        limit.map_or_else(Self::unlimited, Self::limited)
    }

    /// Tries to reserve `calls` calls.
    ///
    /// Returns false, and remembers the refusal, if the budget cannot cover
    /// them.
    pub fn try_spend(&self, calls: u64) -> bool {
        let Some(limit) = self.limit else {
            self.used.fetch_add(calls, Ordering::SeqCst);
            return true;
        };
        let spent = self
            .used
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                used.checked_add(calls).filter(|total| *total <= limit)
            })
            .is_ok();
        if !spent {
            self.refused.store(true, Ordering::SeqCst);
        }
        spent
    }

    /// Calls spent so far.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    /// The configured limit.
    #[must_use]
    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Calls left, or `None` when unlimited.
    #[must_use]
    pub fn remaining(&self) -> Option<u64> {
        self.limit.map(|limit| limit.saturating_sub(self.used()))
    }

    /// Returns whether nothing is left to spend.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == Some(0)
    }

    /// Returns whether a spend request was ever refused.
    #[must_use]
    pub fn was_refused(&self) -> bool {
        self.refused.load(Ordering::SeqCst)
    }
}

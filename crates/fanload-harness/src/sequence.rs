//! Run-scoped source of globally unique keys.

use std::sync::atomic::{AtomicI64, Ordering};

/// Hands out the keys `1, 2, 3, ...`, each to exactly one caller.
///
/// Lock-free; safe to share by reference across any number of threads.
/// Keys drawn by a task that later fails stay consumed. Overflowing `i64`
/// is a caller precondition violation.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicI64,
}

impl SequenceGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Draw the next key. Strictly greater than every key returned before.
    pub fn next(&self) -> i64 {
        let previous = self.last.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous < i64::MAX, "sequence generator overflowed");
        previous + 1
    }

    /// Number of keys handed out so far, which is also the largest key.
    #[must_use]
    pub fn issued(&self) -> i64 {
        self.last.load(Ordering::Relaxed)
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Memory Statistics
//!
//! System-wide counters for fault handling and page commitment. All counters
//! are relaxed atomics; a [`snapshot`] is not a consistent cut across them.

use core::sync::atomic::{AtomicU64, Ordering};

/// ============================================================================
/// Memory Statistics
/// ============================================================================

/// Memory statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Page faults resolved by a mapping
    pub page_faults: u64,

    /// Faults that broke a copy-on-write share
    pub cow_faults: u64,

    /// Read faults satisfied with the shared zero page
    pub zero_page_faults: u64,

    /// Pages allocated into VM objects
    pub pages_committed: u64,

    /// Pages returned from VM objects
    pub pages_decommitted: u64,
}

static PAGE_FAULTS: AtomicU64 = AtomicU64::new(0);
static COW_FAULTS: AtomicU64 = AtomicU64::new(0);
static ZERO_PAGE_FAULTS: AtomicU64 = AtomicU64::new(0);
static PAGES_COMMITTED: AtomicU64 = AtomicU64::new(0);
static PAGES_DECOMMITTED: AtomicU64 = AtomicU64::new(0);

/// Record a page fault
pub fn record_page_fault() {
    PAGE_FAULTS.fetch_add(1, Ordering::Relaxed);
}

/// Record a copy-on-write break
pub fn record_cow_fault() {
    COW_FAULTS.fetch_add(1, Ordering::Relaxed);
}

/// Record a zero-page read fault
pub fn record_zero_page_fault() {
    ZERO_PAGE_FAULTS.fetch_add(1, Ordering::Relaxed);
}

/// Record `count` pages entering VM objects
pub fn record_pages_committed(count: usize) {
    PAGES_COMMITTED.fetch_add(count as u64, Ordering::Relaxed);
}

/// Record `count` pages leaving VM objects
pub fn record_pages_decommitted(count: usize) {
    PAGES_DECOMMITTED.fetch_add(count as u64, Ordering::Relaxed);
}

/// Get current memory statistics
pub fn snapshot() -> MemoryStats {
    MemoryStats {
        page_faults: PAGE_FAULTS.load(Ordering::Relaxed),
        cow_faults: COW_FAULTS.load(Ordering::Relaxed),
        zero_page_faults: ZERO_PAGE_FAULTS.load(Ordering::Relaxed),
        pages_committed: PAGES_COMMITTED.load(Ordering::Relaxed),
        pages_decommitted: PAGES_DECOMMITTED.load(Ordering::Relaxed),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_are_monotonic() {
        let before = snapshot();
        record_page_fault();
        record_cow_fault();
        record_pages_committed(3);
        let after = snapshot();
        // Other tests bump the same counters concurrently.
        assert!(after.page_faults >= before.page_faults + 1);
        assert!(after.cow_faults >= before.cow_faults + 1);
        assert!(after.pages_committed >= before.pages_committed + 3);
    }
}

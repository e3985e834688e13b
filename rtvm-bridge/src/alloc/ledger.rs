// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Allocation ledger

use std::sync::atomic::{AtomicU64, Ordering};

/// Allocator statistics
///
/// Updated under the heap lock, read from anywhere.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Cumulative bytes handed out
    pub total_allocated: AtomicU64,
    /// Requests that returned null
    pub failures: AtomicU64,
    /// Highest fallback-heap address handed out, as `ptr + size`
    pub high_water: AtomicU64,
    /// Fast-region bytes orphaned by resizes
    pub leaked_bytes: AtomicU64,
    /// Requests served from the fast region
    pub fast_allocs: AtomicU64,
    /// Requests served from the fallback heap
    pub heap_allocs: AtomicU64,
    /// Heap blocks released
    pub frees: AtomicU64,
    /// Heap lock takes that failed
    pub lock_failures: AtomicU64,
}

impl Ledger {
    /// Record `size` bytes bumped out of the fast region
    pub(crate) fn record_fast(&self, size: usize) {
        self.total_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
    }

    /// Record a heap block of `size` bytes at `addr`
    pub(crate) fn record_heap(&self, addr: usize, size: usize) {
        self.total_allocated
            .fetch_add(size as u64, Ordering::Relaxed);
        self.high_water
            .fetch_max(addr.saturating_add(size) as u64, Ordering::Relaxed);
    }

    /// Record a failed request, returning the new failure count
    pub(crate) fn record_failure(&self) -> u64 {
        self.failures.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Copy the counters out
    pub fn snapshot(&self) -> LedgerSnapshot {
        LedgerSnapshot {
            total_allocated: self.total_allocated.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            high_water: self.high_water.load(Ordering::Relaxed),
            leaked_bytes: self.leaked_bytes.load(Ordering::Relaxed),
            fast_allocs: self.fast_allocs.load(Ordering::Relaxed),
            heap_allocs: self.heap_allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
            lock_failures: self.lock_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`Ledger`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub total_allocated: u64,
    pub failures: u64,
    pub high_water: u64,
    pub leaked_bytes: u64,
    pub fast_allocs: u64,
    pub heap_allocs: u64,
    pub frees: u64,
    pub lock_failures: u64,
}

impl std::fmt::Display for LedgerSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "allocated={}B fast={} heap={} frees={} leaked={}B failures={} lock_failures={} high_water={:#x}",
            self.total_allocated,
            self.fast_allocs,
            self.heap_allocs,
            self.frees,
            self.leaked_bytes,
            self.failures,
            self.lock_failures,
            self.high_water,
        )
    }
}

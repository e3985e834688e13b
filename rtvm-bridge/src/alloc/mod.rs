// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Allocator Bridge
//!
//! The VM's single memory entry point, `allocate_or_resize`.
//!
//! Requests are bump-allocated from a small fast region until it runs out,
//! then served by a general heap. Fast-region slices are never reclaimed:
//! resizing one copies it into a fresh block and leaks the original. Both
//! the leak and the moment the region runs out are reported as
//! [`AllocEvent`]s.
//!
//! The whole entry point runs under a recursive native mutex, separate from
//! the interpreter lock, because the heap is not safe under preemption.

pub mod heap;
pub mod ledger;
pub mod region;

pub use heap::{FallbackHeap, SystemHeap};
pub use ledger::{Ledger, LedgerSnapshot};
pub use region::FastRegion;

use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::host::{RawRecursiveMutex, Scheduler, TaskHandle, Take};
use parking_lot::Mutex;
use rtvm_common::TraceMark;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

/// Structured allocator event sent to the diagnostics channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AllocEvent {
    /// A request did not fit; the fast region is closed from now on
    FastRegionExhausted { offset: usize, requested: usize },
    /// A fast-region slice was resized and the original left behind
    ResizeLeaked { old_offset: usize, new_size: usize },
    /// A request returned null
    Failed {
        requested: usize,
        total: u64,
        failures: u64,
    },
}

/// Dual-region allocator behind the VM
pub struct AllocatorBridge {
    region: Option<FastRegion>,
    heap: Mutex<Box<dyn FallbackHeap>>,
    heap_lock: Arc<dyn RawRecursiveMutex>,
    scheduler: Arc<dyn Scheduler>,
    lock_timeout: Duration,
    ledger: Arc<Ledger>,
    diag: Diagnostics,
}

impl AllocatorBridge {
    /// Create an allocator over `region` (or heap-only when `None`)
    ///
    /// Fails if the host cannot provide the recursive heap mutex.
    pub fn new(
        region: Option<FastRegion>,
        heap: Box<dyn FallbackHeap>,
        scheduler: Arc<dyn Scheduler>,
        lock_timeout: Duration,
        diag: Diagnostics,
    ) -> Result<Self> {
        let heap_lock = scheduler
            .create_recursive_mutex()
            .ok_or(Error::ResourceExhausted("heap mutex"))?;
        Ok(Self {
            region,
            heap: Mutex::new(heap),
            heap_lock,
            scheduler,
            lock_timeout,
            ledger: Arc::new(Ledger::default()),
            diag,
        })
    }

    /// The fast region, unless running heap-only
    pub fn region(&self) -> Option<&FastRegion> {
        self.region.as_ref()
    }

    /// Whether there is no fast region at all
    pub fn is_heap_only(&self) -> bool {
        self.region.is_none()
    }

    /// Allocation statistics
    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Bytes held by live heap blocks
    pub fn heap_in_use(&self) -> usize {
        self.heap.lock().in_use()
    }

    /// Allocate, resize or free, as the VM's allocator hook expects
    ///
    /// - `new_size == 0` frees `existing` unless it lies in the fast region
    ///   and returns `None`.
    /// - Otherwise returns a block of at least `new_size` bytes holding the
    ///   old contents, or `None` when memory (or the heap lock) ran out.
    ///   On `None` the old block is untouched.
    pub fn allocate_or_resize(
        &self,
        existing: Option<NonNull<u8>>,
        new_size: usize,
    ) -> Option<NonNull<u8>> {
        self.diag.mark(TraceMark::AllocEnter);
        let _guard = self.lock_heap()?;

        if new_size == 0 {
            self.release(existing);
            return None;
        }

        if let Some(ptr) = self.fast_path(existing, new_size) {
            return Some(ptr);
        }
        self.heap_path(existing, new_size)
    }

    /// Allocate a fresh block
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_or_resize(None, size)
    }

    /// Release a block; fast-region and foreign pointers are ignored
    pub fn free(&self, ptr: NonNull<u8>) {
        self.allocate_or_resize(Some(ptr), 0);
    }

    fn lock_heap(&self) -> Option<HeapLockGuard<'_>> {
        let owner = self.scheduler.current();
        match self.heap_lock.take(owner, Some(self.lock_timeout)) {
            Take::Acquired => Some(HeapLockGuard {
                lock: self.heap_lock.as_ref(),
                owner,
                diag: &self.diag,
            }),
            Take::TimedOut | Take::Dead => {
                self.ledger.lock_failures.fetch_add(1, Ordering::Relaxed);
                self.diag.report("failed to lock heap");
                error!("failed to lock heap within {:?}", self.lock_timeout);
                None
            }
        }
    }

    fn release(&self, existing: Option<NonNull<u8>>) {
        let Some(ptr) = existing else {
            return;
        };
        if self.in_region(ptr) {
            trace!("free of fast-region slice {:p} ignored", ptr);
            return;
        }
        if self.heap.lock().free(ptr) {
            self.diag.mark(TraceMark::HeapFree);
            self.ledger.frees.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!("free of foreign pointer {:p} ignored", ptr);
        }
    }

    fn in_region(&self, ptr: NonNull<u8>) -> bool {
        self.region.as_ref().is_some_and(|region| region.contains(ptr))
    }

    fn fast_path(&self, existing: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let region = self.region.as_ref()?;
        if region.is_exhausted() {
            return None;
        }
        // Heap blocks stay on the heap
        if existing.is_some_and(|ptr| !region.contains(ptr)) {
            return None;
        }

        let extent = existing.map(|old| region.extent_from(old));
        let Some(ptr) = region.bump(new_size) else {
            let offset = region.offset();
            warn!(
                "fast region exhausted at offset {} by a {} byte request",
                offset, new_size
            );
            self.diag.alloc_event(AllocEvent::FastRegionExhausted {
                offset,
                requested: new_size,
            });
            return None;
        };

        self.diag.mark(TraceMark::FastAlloc);
        if let (Some(old), Some(extent)) = (existing, extent) {
            self.carry_over(region, old, ptr, extent, new_size);
        }
        self.ledger.fast_allocs.fetch_add(1, Ordering::Relaxed);
        self.ledger.record_fast(new_size);
        Some(ptr)
    }

    fn heap_path(&self, existing: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        self.diag.mark(TraceMark::HeapAlloc);

        let result = match (existing, self.region.as_ref()) {
            (Some(old), Some(region)) if region.contains(old) => {
                let extent = region.extent_from(old);
                let fresh = self.heap.lock().resize(None, new_size);
                if let Some(fresh) = fresh {
                    self.carry_over(region, old, fresh, extent, new_size);
                }
                fresh
            }
            (other, _) => self.heap.lock().resize(other, new_size),
        };

        match result {
            Some(ptr) => {
                self.ledger.heap_allocs.fetch_add(1, Ordering::Relaxed);
                self.ledger.record_heap(ptr.as_ptr() as usize, new_size);
                Some(ptr)
            }
            None => self.fail(new_size),
        }
    }

    /// Copy a fast-region slice into `fresh` and account for the leak
    fn carry_over(
        &self,
        region: &FastRegion,
        old: NonNull<u8>,
        fresh: NonNull<u8>,
        extent: usize,
        new_size: usize,
    ) {
        let len = extent.min(new_size);
        // SAFETY: `old..old + len` lies below the cursor as it was before
        // `fresh` was handed out, so the ranges do not overlap
        unsafe { std::ptr::copy_nonoverlapping(old.as_ptr(), fresh.as_ptr(), len) };

        let old_offset = region.offset_of(old).unwrap_or(0);
        self.ledger
            .leaked_bytes
            .fetch_add(len as u64, Ordering::Relaxed);
        warn!(
            "resized fast-region slice at offset {} to {} bytes; original leaked",
            old_offset, new_size
        );
        self.diag.alloc_event(AllocEvent::ResizeLeaked {
            old_offset,
            new_size,
        });
    }

    fn fail(&self, requested: usize) -> Option<NonNull<u8>> {
        let failures = self.ledger.record_failure();
        let total = self.ledger.total_allocated.load(Ordering::Relaxed);
        self.diag.report(format!(
            "failed to allocate {} bytes ({} bytes allocated so far)",
            requested, total
        ));
        self.diag.alloc_event(AllocEvent::Failed {
            requested,
            total,
            failures,
        });
        error!(
            "allocation of {} bytes failed (total {}, failures {})",
            requested, total, failures
        );
        None
    }
}

impl std::fmt::Debug for AllocatorBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AllocatorBridge")
            .field("region", &self.region)
            .field("lock_timeout", &self.lock_timeout)
            .field("ledger", &self.ledger.snapshot())
            .finish()
    }
}

/// Gives the heap lock back on every exit path
struct HeapLockGuard<'a> {
    lock: &'a dyn RawRecursiveMutex,
    owner: TaskHandle,
    diag: &'a Diagnostics,
}

impl Drop for HeapLockGuard<'_> {
    fn drop(&mut self) {
        if !self.lock.give(self.owner) {
            self.diag.report("failed to unlock the heap");
            error!("failed to unlock the heap");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagReceiver;
    use crate::host::SimScheduler;
    use rtvm_common::config::HEAP_LOCK_TIMEOUT_MS;

    const KB: usize = 1024;

    fn bridge_with(region_size: Option<usize>, heap: SystemHeap) -> (AllocatorBridge, DiagReceiver) {
        let sched = SimScheduler::new();
        let (diag, rx) = Diagnostics::channel(256, true);
        let region = region_size.map(|size| FastRegion::anonymous(size, 4).unwrap());
        let bridge = AllocatorBridge::new(
            region,
            Box::new(heap),
            sched,
            Duration::from_millis(HEAP_LOCK_TIMEOUT_MS as u64),
            diag,
        )
        .unwrap();
        (bridge, rx)
    }

    #[test]
    fn test_free_null_is_noop() {
        let (bridge, _rx) = bridge_with(Some(64), SystemHeap::new());
        assert!(bridge.allocate_or_resize(None, 0).is_none());
        assert_eq!(bridge.ledger().snapshot(), LedgerSnapshot::default());
    }

    #[test]
    fn test_free_fast_slice_keeps_offset() {
        let (bridge, _rx) = bridge_with(Some(64), SystemHeap::new());
        let p = bridge.allocate(10).unwrap();
        let offset = bridge.region().unwrap().offset();
        assert!(bridge.allocate_or_resize(Some(p), 0).is_none());
        assert_eq!(bridge.region().unwrap().offset(), offset);
        assert_eq!(bridge.ledger().snapshot().frees, 0);
    }

    #[test]
    fn test_free_foreign_pointer_is_noop() {
        let (bridge, _rx) = bridge_with(Some(64), SystemHeap::new());
        let mut local = 0u64;
        let foreign = NonNull::new(&mut local as *mut u64 as *mut u8).unwrap();
        assert!(bridge.allocate_or_resize(Some(foreign), 0).is_none());
        assert_eq!(bridge.ledger().snapshot().frees, 0);
        assert_eq!(local, 0);
    }

    #[test]
    fn test_fast_path_marks_and_alignment() {
        let (bridge, rx) = bridge_with(Some(64), SystemHeap::new());
        let a = bridge.allocate(3).unwrap();
        let b = bridge.allocate(3).unwrap();
        assert_eq!(b.as_ptr() as usize - a.as_ptr() as usize, 4);
        assert_eq!(rx.marks(), ".C.C");
        let snap = bridge.ledger().snapshot();
        assert_eq!(snap.fast_allocs, 2);
        assert_eq!(snap.total_allocated, 6);
        assert_eq!(snap.high_water, 0);
    }

    #[test]
    fn test_high_water_tracks_heap_only() {
        let (bridge, _rx) = bridge_with(Some(16), SystemHeap::new());
        bridge.allocate(16).unwrap();
        assert_eq!(bridge.ledger().snapshot().high_water, 0);

        let heap = bridge.allocate(32).unwrap();
        assert!(!bridge.region().unwrap().contains(heap));
        let snap = bridge.ledger().snapshot();
        assert_eq!(snap.high_water, heap.as_ptr() as u64 + 32);
        assert_eq!(snap.total_allocated, 48);
    }

    #[test]
    fn test_offset_never_decreases() {
        let (bridge, _rx) = bridge_with(Some(256), SystemHeap::new());
        let mut last = 0;
        let mut held = None;
        for size in [8, 0, 20, 0, 4, 100] {
            held = bridge.allocate_or_resize(held, size).or(held);
            let offset = bridge.region().unwrap().offset();
            assert!(offset >= last);
            last = offset;
        }
    }

    #[test]
    fn test_resize_fast_slice_copies_and_leaks() {
        let (bridge, rx) = bridge_with(Some(64), SystemHeap::new());
        let p = bridge.allocate(4).unwrap();
        unsafe { p.as_ptr().copy_from_nonoverlapping([9u8, 8, 7, 6].as_ptr(), 4) };
        rx.drain();

        let q = bridge.allocate_or_resize(Some(p), 16).unwrap();
        assert_ne!(p, q);
        let head = unsafe { std::slice::from_raw_parts(q.as_ptr(), 4) };
        assert_eq!(head, &[9, 8, 7, 6]);
        assert_eq!(
            rx.alloc_events(),
            vec![AllocEvent::ResizeLeaked {
                old_offset: 0,
                new_size: 16
            }]
        );
        assert_eq!(bridge.ledger().snapshot().leaked_bytes, 4);
    }

    #[test]
    fn test_exhaustion_switches_to_heap_for_good() {
        let (bridge, rx) = bridge_with(Some(16), SystemHeap::new());
        bridge.allocate(12).unwrap();
        rx.drain();

        let big = bridge.allocate(8).unwrap();
        assert!(!bridge.region().unwrap().contains(big));
        assert_eq!(rx.marks(), ".o");

        // Would fit the 4 byte tail, still goes to the heap
        let small = bridge.allocate(4).unwrap();
        assert!(!bridge.region().unwrap().contains(small));
        assert!(bridge.region().unwrap().is_exhausted());
        assert_eq!(bridge.ledger().snapshot().heap_allocs, 2);
    }

    #[test]
    fn test_exhaustion_event_reported_once() {
        let (bridge, rx) = bridge_with(Some(16), SystemHeap::new());
        bridge.allocate(12).unwrap();
        bridge.allocate(8).unwrap();
        bridge.allocate(8).unwrap();
        assert_eq!(
            rx.alloc_events(),
            vec![AllocEvent::FastRegionExhausted {
                offset: 12,
                requested: 8
            }]
        );
    }

    #[test]
    fn test_resize_fast_slice_after_exhaustion_moves_to_heap() {
        let (bridge, _rx) = bridge_with(Some(16), SystemHeap::new());
        let p = bridge.allocate(8).unwrap();
        unsafe { p.as_ptr().write_bytes(0xAB, 8) };
        bridge.allocate(8).unwrap();

        let q = bridge.allocate_or_resize(Some(p), 32).unwrap();
        assert!(!bridge.region().unwrap().contains(q));
        let head = unsafe { std::slice::from_raw_parts(q.as_ptr(), 8) };
        assert!(head.iter().all(|&b| b == 0xAB));
        assert_eq!(bridge.heap_in_use(), 32);
    }

    #[test]
    fn test_heap_block_free_and_resize() {
        let (bridge, rx) = bridge_with(None, SystemHeap::new());
        assert!(bridge.is_heap_only());
        let p = bridge.allocate(16).unwrap();
        let q = bridge.allocate_or_resize(Some(p), 64).unwrap();
        assert_eq!(bridge.heap_in_use(), 64);
        bridge.free(q);
        assert_eq!(bridge.heap_in_use(), 0);
        assert_eq!(rx.marks(), ".o.o.-");
        assert_eq!(bridge.ledger().snapshot().frees, 1);
    }

    #[test]
    fn test_ten_chunks_then_fallback() {
        let (bridge, _rx) = bridge_with(Some(50 * KB), SystemHeap::new());
        // Bootstrap allocations made by the VM before the script runs
        bridge.allocate(8 * KB).unwrap();

        for _ in 0..10 {
            let p = bridge.allocate(4 * KB).unwrap();
            assert!(bridge.region().unwrap().contains(p));
        }
        let eleventh = bridge.allocate(4 * KB).unwrap();
        assert!(!bridge.region().unwrap().contains(eleventh));
        assert_eq!(bridge.ledger().snapshot().failures, 0);
    }

    #[test]
    fn test_fallback_failure_counts_once() {
        let (bridge, rx) = bridge_with(Some(40 * KB), SystemHeap::with_limit(0));
        for _ in 0..10 {
            assert!(bridge.allocate(4 * KB).is_some());
        }
        rx.drain();

        assert!(bridge.allocate(4 * KB).is_none());
        let snap = bridge.ledger().snapshot();
        assert_eq!(snap.failures, 1);
        let records = rx.drain();
        assert!(records.contains(&crate::diag::DiagRecord::Report(
            "failed to allocate 4096 bytes (40960 bytes allocated so far)".into()
        )));
        assert!(records.contains(&crate::diag::DiagRecord::Alloc(AllocEvent::Failed {
            requested: 4096,
            total: 40960,
            failures: 1,
        })));
    }

    #[test]
    fn test_failed_resize_keeps_old_block() {
        let (bridge, _rx) = bridge_with(None, SystemHeap::with_limit(64));
        let p = bridge.allocate(32).unwrap();
        assert!(bridge.allocate_or_resize(Some(p), 128).is_none());
        assert_eq!(bridge.heap_in_use(), 32);
        bridge.free(p);
        assert_eq!(bridge.heap_in_use(), 0);
    }

    #[test]
    fn test_contended_heap_lock_fails_request() {
        let sched = SimScheduler::new();
        let (diag, rx) = Diagnostics::channel(16, false);
        let bridge = AllocatorBridge::new(
            Some(FastRegion::anonymous(64, 4).unwrap()),
            Box::new(SystemHeap::new()),
            sched.clone(),
            Duration::from_millis(HEAP_LOCK_TIMEOUT_MS as u64),
            diag,
        )
        .unwrap();

        let holder = sched.add_task("holder");
        assert_eq!(bridge.heap_lock.take(holder, None), Take::Acquired);

        let before = sched.now();
        assert!(bridge.allocate(8).is_none());
        assert_eq!(sched.now() - before, Duration::from_secs(10));
        assert_eq!(bridge.ledger().snapshot().lock_failures, 1);
        assert_eq!(bridge.region().unwrap().offset(), 0);
        assert_eq!(rx.drain(), vec![crate::diag::DiagRecord::Report("failed to lock heap".into())]);
    }

    #[test]
    fn test_heap_lock_is_reentrant_and_balanced() {
        let (bridge, _rx) = bridge_with(Some(64), SystemHeap::new());
        let me = bridge.scheduler.current();
        assert_eq!(bridge.heap_lock.take(me, None), Take::Acquired);
        assert!(bridge.allocate(4).is_some());
        assert_eq!(bridge.heap_lock.depth(), 1);
        assert!(bridge.heap_lock.give(me));
        assert_eq!(bridge.heap_lock.holder(), None);
    }

    #[test]
    fn test_missing_heap_mutex_is_an_error() {
        let sched = SimScheduler::new();
        sched.fail_next_mutex_creates(1);
        let result = AllocatorBridge::new(
            None,
            Box::new(SystemHeap::new()),
            sched,
            Duration::from_secs(1),
            Diagnostics::disabled(),
        );
        assert!(matches!(result, Err(Error::ResourceExhausted(_))));
    }
}

// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Fallback general-purpose heap

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::ptr::NonNull;
use tracing::warn;

/// Alignment of every heap block
pub const HEAP_ALIGN: usize = 8;

/// General heap behind the fast region
///
/// Not safe under preemption on its own; the allocator bridge serializes
/// every call with its recursive lock.
pub trait FallbackHeap: Send {
    /// Resize `existing` (or allocate when `None`) to `size > 0` bytes
    ///
    /// On failure `existing` is left untouched.
    fn resize(&mut self, existing: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>>;

    /// Free a block; `false` if this heap never handed it out
    fn free(&mut self, ptr: NonNull<u8>) -> bool;

    /// Whether `ptr` is a live block of this heap
    fn owns(&self, ptr: NonNull<u8>) -> bool;

    /// Bytes currently held by live blocks
    fn in_use(&self) -> usize;
}

/// Heap over the global allocator with an optional capacity limit
///
/// Live blocks are tracked, so foreign pointers are recognized and
/// ignored instead of corrupting the allocator.
#[derive(Debug, Default)]
pub struct SystemHeap {
    blocks: HashMap<usize, Layout>,
    in_use: usize,
    limit: Option<usize>,
}

impl SystemHeap {
    /// Unbounded heap
    pub fn new() -> Self {
        Self::default()
    }

    /// Heap that refuses to hold more than `limit` bytes at once
    pub fn with_limit(limit: usize) -> Self {
        Self {
            blocks: HashMap::new(),
            in_use: 0,
            limit: Some(limit),
        }
    }

    fn fits(&self, in_use_after: usize) -> bool {
        self.limit.map_or(true, |limit| in_use_after <= limit)
    }

    fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.fits(self.in_use.checked_add(size)?) {
            return None;
        }
        let layout = Layout::from_size_align(size, HEAP_ALIGN).ok()?;
        // SAFETY: size > 0 is guaranteed by the caller
        let ptr = NonNull::new(unsafe { alloc::alloc(layout) })?;
        self.blocks.insert(ptr.as_ptr() as usize, layout);
        self.in_use += size;
        Some(ptr)
    }
}

impl FallbackHeap for SystemHeap {
    fn resize(&mut self, existing: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        if size == 0 {
            return None;
        }
        let Some(ptr) = existing else {
            return self.allocate(size);
        };
        let Some(&old) = self.blocks.get(&(ptr.as_ptr() as usize)) else {
            warn!("resize of a block this heap does not own: {:p}", ptr);
            return self.allocate(size);
        };

        let in_use_after = (self.in_use - old.size()).checked_add(size)?;
        if !self.fits(in_use_after) {
            return None;
        }
        let layout = Layout::from_size_align(size, HEAP_ALIGN).ok()?;
        // SAFETY: ptr was allocated with `old`, size > 0 and forms a valid layout
        let grown = NonNull::new(unsafe { alloc::realloc(ptr.as_ptr(), old, size) })?;
        self.blocks.remove(&(ptr.as_ptr() as usize));
        self.blocks.insert(grown.as_ptr() as usize, layout);
        self.in_use = in_use_after;
        Some(grown)
    }

    fn free(&mut self, ptr: NonNull<u8>) -> bool {
        match self.blocks.remove(&(ptr.as_ptr() as usize)) {
            Some(layout) => {
                // SAFETY: the block is live and was allocated with `layout`
                unsafe { alloc::dealloc(ptr.as_ptr(), layout) };
                self.in_use -= layout.size();
                true
            }
            None => false,
        }
    }

    fn owns(&self, ptr: NonNull<u8>) -> bool {
        self.blocks.contains_key(&(ptr.as_ptr() as usize))
    }

    fn in_use(&self) -> usize {
        self.in_use
    }
}

impl Drop for SystemHeap {
    fn drop(&mut self) {
        for (addr, layout) in self.blocks.drain() {
            // SAFETY: every tracked block is live and owned by this heap
            unsafe { alloc::dealloc(addr as *mut u8, layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_and_free() {
        let mut heap = SystemHeap::new();
        let p = heap.resize(None, 32).unwrap();
        assert!(heap.owns(p));
        assert_eq!(heap.in_use(), 32);
        assert_eq!(p.as_ptr() as usize % HEAP_ALIGN, 0);
        assert!(heap.free(p));
        assert_eq!(heap.in_use(), 0);
        assert!(!heap.free(p), "double free is refused");
    }

    #[test]
    fn test_resize_preserves_contents() {
        let mut heap = SystemHeap::new();
        let p = heap.resize(None, 4).unwrap();
        unsafe { p.as_ptr().copy_from_nonoverlapping([1u8, 2, 3, 4].as_ptr(), 4) };
        let q = heap.resize(Some(p), 64).unwrap();
        let head = unsafe { std::slice::from_raw_parts(q.as_ptr(), 4) };
        assert_eq!(head, &[1, 2, 3, 4]);
        assert_eq!(heap.in_use(), 64);
    }

    #[test]
    fn test_limit_refuses_growth() {
        let mut heap = SystemHeap::with_limit(100);
        let p = heap.resize(None, 60).unwrap();
        assert!(heap.resize(None, 60).is_none());
        assert!(heap.resize(Some(p), 120).is_none());
        // Failed resize leaves the block alone
        assert!(heap.owns(p));
        assert!(heap.resize(Some(p), 100).is_some());
    }

    #[test]
    fn test_foreign_pointer_free_is_ignored() {
        let mut heap = SystemHeap::new();
        let mut local = 0u64;
        let foreign = NonNull::new(&mut local as *mut u64 as *mut u8).unwrap();
        assert!(!heap.free(foreign));
        assert!(!heap.owns(foreign));
    }
}

// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Fast memory region with a non-reclaiming bump cursor
//!
//! Memory layout:
//! ```text
//! base (low address)
//!   │ allocated slices, each rounded up to the alignment
//!   ▼  ← offset moves up with each allocation, never down
//!   │
//! base + size
//! ```
//!
//! Individual slices are never freed. Once a request does not fit, the
//! region is marked exhausted and stays that way, even if a later request
//! would still fit in the tail.

use crate::error::Result;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Round `value` up to a power-of-two `align`
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Fixed-size fast region consumed by a bump cursor
pub struct FastRegion {
    base: NonNull<u8>,
    size: usize,
    align: usize,
    offset: AtomicUsize,
    exhausted: AtomicBool,
    // Keep an anonymous mapping alive
    _backing: Option<memmap2::MmapMut>,
}

// Cursor updates are atomic; the slices themselves belong to the VM
unsafe impl Send for FastRegion {}
unsafe impl Sync for FastRegion {}

impl FastRegion {
    /// Back the region with an anonymous mapping of `size` bytes
    pub fn anonymous(size: usize, align: usize) -> Result<Self> {
        let mmap = memmap2::MmapOptions::new().len(size.max(1)).map_anon()?;
        let base = NonNull::new(mmap.as_ptr() as *mut u8)
            .ok_or_else(|| std::io::Error::other("mmap returned null"))?;
        Ok(Self {
            base,
            size,
            align: align.max(1).next_power_of_two(),
            offset: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            _backing: Some(mmap),
        })
    }

    /// Use fixed memory at `base`, e.g. core-coupled RAM on the board
    ///
    /// # Safety
    /// `base..base + size` must be valid for reads and writes, unused by
    /// anything else, and live as long as every pointer handed out.
    pub unsafe fn from_raw(base: NonNull<u8>, size: usize, align: usize) -> Self {
        Self {
            base,
            size,
            align: align.max(1).next_power_of_two(),
            offset: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
            _backing: None,
        }
    }

    /// Lowest address of the region
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// Region size in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Bump alignment in bytes
    pub fn align(&self) -> usize {
        self.align
    }

    /// Current cursor offset from `base`
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Acquire)
    }

    /// Bytes left before the end of the region
    pub fn remaining(&self) -> usize {
        self.size.saturating_sub(self.offset())
    }

    /// Whether a request has already failed to fit
    pub fn is_exhausted(&self) -> bool {
        self.exhausted.load(Ordering::Acquire)
    }

    /// Whether `ptr` lies within `base..base + size`
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.base.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        addr >= start && addr - start < self.size
    }

    /// Offset of `ptr` from `base`, if it lies in the region
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        self.contains(ptr)
            .then(|| ptr.as_ptr() as usize - self.base.as_ptr() as usize)
    }

    /// Bytes from `ptr` up to the cursor
    ///
    /// Bounds the size of the slice that starts at `ptr`.
    pub fn extent_from(&self, ptr: NonNull<u8>) -> usize {
        self.offset_of(ptr)
            .map(|start| self.offset().saturating_sub(start))
            .unwrap_or(0)
    }

    /// Bump the cursor by `size` rounded up to the alignment
    ///
    /// Returns `None` and marks the region exhausted if the slice would
    /// pass the end. Callers serialize bumps.
    pub(crate) fn bump(&self, size: usize) -> Option<NonNull<u8>> {
        if self.is_exhausted() {
            return None;
        }
        let offset = self.offset.load(Ordering::Acquire);
        let next = size
            .checked_add(self.align - 1)
            .and_then(|_| offset.checked_add(align_up(size, self.align)));

        match next {
            Some(next) if next <= self.size => {
                self.offset.store(next, Ordering::Release);
                // SAFETY: offset < next <= size, so the pointer is in bounds
                Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(offset)) })
            }
            _ => {
                self.exhausted.store(true, Ordering::Release);
                None
            }
        }
    }
}

impl std::fmt::Debug for FastRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastRegion")
            .field("base", &self.base)
            .field("size", &self.size)
            .field("offset", &self.offset())
            .field("exhausted", &self.is_exhausted())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(1, 4), 4);
        assert_eq!(align_up(4, 4), 4);
        assert_eq!(align_up(5, 4), 8);
    }

    #[test]
    fn test_bump_rounds_to_alignment() {
        let region = FastRegion::anonymous(64, 4).unwrap();
        let a = region.bump(5).unwrap();
        let b = region.bump(1).unwrap();
        assert_eq!(region.offset_of(a), Some(0));
        assert_eq!(region.offset_of(b), Some(8));
        assert_eq!(region.offset(), 12);
        assert_eq!(b.as_ptr() as usize % 4, 0);
    }

    #[test]
    fn test_exhaustion_is_permanent() {
        let region = FastRegion::anonymous(16, 4).unwrap();
        assert!(region.bump(12).is_some());
        assert!(region.bump(8).is_none());
        assert!(region.is_exhausted());
        // 4 bytes are left but the region stays closed
        assert_eq!(region.remaining(), 4);
        assert!(region.bump(4).is_none());
        assert_eq!(region.offset(), 12);
    }

    #[test]
    fn test_exact_fit_is_allowed() {
        let region = FastRegion::anonymous(16, 4).unwrap();
        assert!(region.bump(16).is_some());
        assert_eq!(region.remaining(), 0);
        assert!(!region.is_exhausted());
    }

    #[test]
    fn test_contains_is_half_open() {
        let region = FastRegion::anonymous(32, 4).unwrap();
        let base = region.base();
        assert!(region.contains(base));
        let last = NonNull::new(unsafe { base.as_ptr().add(31) }).unwrap();
        let end = NonNull::new(unsafe { base.as_ptr().add(32) }).unwrap();
        assert!(region.contains(last));
        assert!(!region.contains(end));
        assert_eq!(region.offset_of(end), None);
    }

    #[test]
    fn test_extent_from_tracks_cursor() {
        let region = FastRegion::anonymous(64, 4).unwrap();
        let a = region.bump(8).unwrap();
        region.bump(4).unwrap();
        assert_eq!(region.extent_from(a), 12);
    }

    #[test]
    fn test_from_raw_uses_given_memory() {
        let mut backing = vec![0u32; 8];
        let base = NonNull::new(backing.as_mut_ptr() as *mut u8).unwrap();
        let region = unsafe { FastRegion::from_raw(base, 32, 4) };
        assert_eq!(region.bump(4), Some(base));
        assert_eq!(region.size(), 32);
    }
}

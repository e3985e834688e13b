// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # rtvm-common
//!
//! Shared vocabulary between the scripting VM and the Rtvm bridge.
//!
//! The VM talks to the bridge through numeric status codes and a small set of
//! plain types. They live here, free of `std`, so the same definitions can be
//! used by the hosted bridge and by firmware builds.
//!
//! ## Design Principles
//!
//! - **One exclusivity notion**: the whole VM is serialized by one lock
//! - **Status codes, not panics**: every lock operation reports a `LockStatus`
//! - **Tick-based time**: timeouts are converted to scheduler ticks the same
//!   way the host RTOS converts them
//!
//! ## Non-Goals
//!
//! 1. **Concurrent readers** - `read_lock` is an exclusive lock in disguise
//! 2. **Per-object locking** - the interpreter lock covers all VM state

#![no_std]

use core::time::Duration;

// ============================================================================
// Lock status codes
// ============================================================================

/// Status returned by every lock adapter operation
///
/// The numeric values are what the VM's lock table expects.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockStatus {
    /// Operation succeeded
    #[default]
    Ok = 0,

    /// Null, uninitialized or destroyed lock handle
    InvalidArguments = -1,

    /// Bounded wait expired without acquiring the lock
    Timeout = -2,

    /// The native primitive reported an unexpected failure
    /// (typically unlock without a matching lock)
    Unknown = -3,
}

impl LockStatus {
    /// Whether the status signals success
    #[inline]
    pub fn is_ok(self) -> bool {
        matches!(self, LockStatus::Ok)
    }
}

impl TryFrom<i32> for LockStatus {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(LockStatus::Ok),
            -1 => Ok(LockStatus::InvalidArguments),
            -2 => Ok(LockStatus::Timeout),
            -3 => Ok(LockStatus::Unknown),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Timeouts
// ============================================================================

/// How long a lock operation may block the calling task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitTimeout {
    /// Fail immediately if the lock is held
    NoWait,

    /// Wait up to this many milliseconds
    Millis(u32),

    /// Block until the lock is acquired
    Forever,
}

impl WaitTimeout {
    /// Build a timeout from the VM's millisecond encoding.
    ///
    /// `0` means no wait and `u32::MAX` means wait forever.
    pub const fn from_millis(ms: u32) -> Self {
        match ms {
            0 => WaitTimeout::NoWait,
            config::WAIT_FOREVER_MS => WaitTimeout::Forever,
            ms => WaitTimeout::Millis(ms),
        }
    }

    /// The VM's millisecond encoding of this timeout
    pub const fn as_millis(self) -> u32 {
        match self {
            WaitTimeout::NoWait => 0,
            WaitTimeout::Millis(ms) => ms,
            WaitTimeout::Forever => config::WAIT_FOREVER_MS,
        }
    }

    /// Convert to scheduler ticks.
    ///
    /// Uses integer division like the host's `ms / tick_ms` conversion, so a
    /// timeout shorter than one tick does not wait at all. Returns `None`
    /// for `Forever`.
    pub const fn to_ticks(self, tick_ms: u32) -> Option<u32> {
        let tick_ms = if tick_ms == 0 { 1 } else { tick_ms };
        match self {
            WaitTimeout::NoWait => Some(0),
            WaitTimeout::Millis(ms) => Some(ms / tick_ms),
            WaitTimeout::Forever => None,
        }
    }

    /// Wait budget as a duration after tick rounding, `None` for `Forever`
    pub const fn to_duration(self, tick_ms: u32) -> Option<Duration> {
        let tick_ms = if tick_ms == 0 { 1 } else { tick_ms };
        match self.to_ticks(tick_ms) {
            Some(ticks) => Some(Duration::from_millis(ticks as u64 * tick_ms as u64)),
            None => None,
        }
    }
}

impl Default for WaitTimeout {
    fn default() -> Self {
        WaitTimeout::Millis(config::DEFAULT_CALL_TIMEOUT_MS)
    }
}

// ============================================================================
// Lock capabilities
// ============================================================================

/// What a lock adapter can actually provide
///
/// The VM only sees the read/write vocabulary. This flag tells a caller
/// whether `read_lock` really admits concurrent readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockCapabilities {
    /// Whether several readers may hold the lock at once
    pub concurrent_reads: bool,
}

impl LockCapabilities {
    /// Read locks are exclusive locks
    pub const EXCLUSIVE_ONLY: Self = Self {
        concurrent_reads: false,
    };
}

impl Default for LockCapabilities {
    fn default() -> Self {
        Self::EXCLUSIVE_ONLY
    }
}

// ============================================================================
// Task lifecycle
// ============================================================================

/// Lifecycle of a scheduling unit
///
/// ```text
/// READY → RUNNING ⇄ BLOCKED
///   │        │         │
///   └────────┴─────────┴──→ TERMINATED
/// ```
///
/// Tasks are never joined. They run to completion or are deleted.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskState {
    /// Created but not yet scheduled
    #[default]
    Ready = 0,

    /// Executing or runnable
    Running = 1,

    /// Waiting on a delay or a mutex
    Blocked = 2,

    /// Deleted or returned; never executes again
    Terminated = 3,
}

impl TaskState {
    /// Whether the task can still execute
    #[inline]
    pub fn is_alive(self) -> bool {
        !matches!(self, TaskState::Terminated)
    }
}

impl TryFrom<u32> for TaskState {
    type Error = ();

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(TaskState::Ready),
            1 => Ok(TaskState::Running),
            2 => Ok(TaskState::Blocked),
            3 => Ok(TaskState::Terminated),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Diagnostic trace marks
// ============================================================================

/// Single-character trace emitted on lock and allocator transitions
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMark {
    /// Lock primitive created
    LockInit = b'i',
    /// Lock requested
    Lock = b'l',
    /// Lock request timed out
    LockTimeout = b'x',
    /// Unlock requested
    Unlock = b'u',
    /// Native unlock failed
    UnlockFailed = b'X',
    /// Deadlock handler entered
    Deadlock = b'D',
    /// Allocator entry
    AllocEnter = b'.',
    /// Served from the fast region
    FastAlloc = b'C',
    /// Served from the fallback heap
    HeapAlloc = b'o',
    /// Heap block released
    HeapFree = b'-',
}

impl TraceMark {
    /// The character written to the diagnostics sink
    #[inline]
    pub fn as_char(self) -> char {
        self as u8 as char
    }
}

impl TryFrom<u8> for TraceMark {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            b'i' => Ok(TraceMark::LockInit),
            b'l' => Ok(TraceMark::Lock),
            b'x' => Ok(TraceMark::LockTimeout),
            b'u' => Ok(TraceMark::Unlock),
            b'X' => Ok(TraceMark::UnlockFailed),
            b'D' => Ok(TraceMark::Deadlock),
            b'.' => Ok(TraceMark::AllocEnter),
            b'C' => Ok(TraceMark::FastAlloc),
            b'o' => Ok(TraceMark::HeapAlloc),
            b'-' => Ok(TraceMark::HeapFree),
            _ => Err(()),
        }
    }
}

// ============================================================================
// Configuration constants
// ============================================================================

/// Configuration constants
pub mod config {
    /// Millisecond value the VM uses for "wait forever"
    pub const WAIT_FOREVER_MS: u32 = u32::MAX;

    /// Scheduler tick length in milliseconds
    pub const DEFAULT_TICK_MS: u32 = 1;

    /// Fast region size in bytes (50KB of core-coupled RAM)
    pub const FAST_REGION_SIZE: usize = 50 * 1024;

    /// Fast region bump alignment in bytes
    pub const FAST_REGION_ALIGN: usize = 4;

    /// Base address of the fast region on the reference board
    pub const FAST_REGION_BASE: usize = 0x1000_0000;

    /// Stall applied by the deadlock handler (1s)
    pub const DEADLOCK_COOLDOWN_MS: u32 = 1000;

    /// Allocator lock timeout (10s)
    pub const HEAP_LOCK_TIMEOUT_MS: u32 = 10 * 1000;

    /// Default timeout for one VM call
    pub const DEFAULT_CALL_TIMEOUT_MS: u32 = 5000;

    /// Idle task priority
    pub const PRIORITY_IDLE: u8 = 0;

    /// Priority of regular demo tasks
    pub const PRIORITY_NORMAL: u8 = PRIORITY_IDLE + 2;

    /// Priority reserved for emergency work
    pub const PRIORITY_EMERGENT: u8 = PRIORITY_IDLE + 4;

    /// Default task stack size in bytes
    pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

    /// Capacity of the diagnostics channel
    pub const DIAG_CAPACITY: usize = 4096;
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_status_conversion() {
        assert_eq!(LockStatus::try_from(0), Ok(LockStatus::Ok));
        assert_eq!(LockStatus::try_from(-1), Ok(LockStatus::InvalidArguments));
        assert_eq!(LockStatus::try_from(-2), Ok(LockStatus::Timeout));
        assert_eq!(LockStatus::try_from(-3), Ok(LockStatus::Unknown));
        assert_eq!(LockStatus::try_from(1), Err(()));
        assert_eq!(LockStatus::try_from(-4), Err(()));
        assert!(LockStatus::Ok.is_ok());
        assert!(!LockStatus::Timeout.is_ok());
    }

    #[test]
    fn test_wait_timeout_encoding() {
        assert_eq!(WaitTimeout::from_millis(0), WaitTimeout::NoWait);
        assert_eq!(WaitTimeout::from_millis(u32::MAX), WaitTimeout::Forever);
        assert_eq!(WaitTimeout::from_millis(250), WaitTimeout::Millis(250));

        assert_eq!(WaitTimeout::NoWait.as_millis(), 0);
        assert_eq!(WaitTimeout::Forever.as_millis(), u32::MAX);
        assert_eq!(WaitTimeout::Millis(42).as_millis(), 42);
    }

    #[test]
    fn test_wait_timeout_ticks() {
        assert_eq!(WaitTimeout::NoWait.to_ticks(1), Some(0));
        assert_eq!(WaitTimeout::Millis(5000).to_ticks(1), Some(5000));
        assert_eq!(WaitTimeout::Millis(5000).to_ticks(10), Some(500));
        // Shorter than one tick rounds down to no wait
        assert_eq!(WaitTimeout::Millis(5).to_ticks(10), Some(0));
        assert_eq!(WaitTimeout::Forever.to_ticks(1), None);
        // Zero tick length is treated as one millisecond
        assert_eq!(WaitTimeout::Millis(7).to_ticks(0), Some(7));

        assert_eq!(
            WaitTimeout::Millis(25).to_duration(10),
            Some(Duration::from_millis(20))
        );
        assert_eq!(WaitTimeout::Forever.to_duration(1), None);
    }

    #[test]
    fn test_capabilities_default_exclusive() {
        assert!(!LockCapabilities::default().concurrent_reads);
        assert_eq!(LockCapabilities::default(), LockCapabilities::EXCLUSIVE_ONLY);
    }

    #[test]
    fn test_task_state() {
        assert_eq!(TaskState::default(), TaskState::Ready);
        assert!(TaskState::Running.is_alive());
        assert!(TaskState::Blocked.is_alive());
        assert!(!TaskState::Terminated.is_alive());
        assert_eq!(TaskState::try_from(3), Ok(TaskState::Terminated));
        assert_eq!(TaskState::try_from(4), Err(()));
    }

    #[test]
    fn test_trace_marks() {
        assert_eq!(TraceMark::Lock.as_char(), 'l');
        assert_eq!(TraceMark::UnlockFailed.as_char(), 'X');
        assert_eq!(TraceMark::FastAlloc.as_char(), 'C');
        assert_eq!(TraceMark::try_from(b'D'), Ok(TraceMark::Deadlock));
        assert_eq!(TraceMark::try_from(b'?'), Err(()));
    }

    #[test]
    fn test_priorities() {
        assert!(config::PRIORITY_NORMAL > config::PRIORITY_IDLE);
        assert!(config::PRIORITY_EMERGENT > config::PRIORITY_NORMAL);
    }
}

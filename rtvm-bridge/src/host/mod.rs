// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Scheduler Adapter
//!
//! The minimal surface the bridge consumes from the host RTOS: task
//! lifecycle, timed delays, and one exclusive plus one recursive native
//! mutex. The scheduler itself is a black box.
//!
//! ## Implementations
//!
//! - [`ThreadScheduler`]: OS threads stand in for RTOS tasks
//! - [`SimScheduler`]: deterministic double with a virtual clock, used to
//!   simulate timeouts and contention in tests

use crate::error::Result;
use rtvm_common::{config, TaskState};
use std::fmt;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod sim;
pub mod thread;

pub use sim::SimScheduler;
pub use thread::ThreadScheduler;

/// Body of a spawned task
pub type TaskBody = Box<dyn FnOnce() + Send + 'static>;

/// Handle of a scheduling unit
///
/// Handles are unique for the life of the process, across schedulers.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskHandle(NonZeroU32);

static NEXT_TASK_ID: AtomicU32 = AtomicU32::new(1);

impl TaskHandle {
    /// Allocate a fresh handle
    pub(crate) fn next() -> Self {
        let id = NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed);
        // Wrapping past zero would take four billion tasks
        Self(NonZeroU32::new(id).unwrap_or(NonZeroU32::MIN))
    }

    /// Raw numeric id
    #[inline]
    pub fn id(self) -> u32 {
        self.0.get()
    }
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{:#x}", self.0.get())
    }
}

/// Parameters for creating a task
#[derive(Debug, Clone)]
pub struct TaskSpec {
    /// Task name
    pub name: String,
    /// Fixed priority (higher runs first on the real RTOS)
    pub priority: u8,
    /// Stack size in bytes
    pub stack_size: usize,
}

impl TaskSpec {
    /// Task with normal priority and the default stack
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            priority: config::PRIORITY_NORMAL,
            stack_size: config::DEFAULT_STACK_SIZE,
        }
    }

    /// Set the priority
    pub fn priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Set the stack size
    pub fn stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }
}

/// Outcome of a timed take on a native mutex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Take {
    /// Ownership acquired
    Acquired,
    /// Wait budget elapsed
    TimedOut,
    /// The primitive was destroyed
    Dead,
}

/// Exclusive native mutex
///
/// Taking it again from the holder blocks like any other contender.
pub trait RawMutex: Send + Sync {
    /// Take within `wait` (`None` waits forever)
    fn take(&self, owner: TaskHandle, wait: Option<Duration>) -> Take;

    /// Give back; `false` if `owner` does not hold the mutex
    fn give(&self, owner: TaskHandle) -> bool;

    /// Release if held and refuse every later take
    fn kill(&self);

    /// Current holder
    fn holder(&self) -> Option<TaskHandle>;

    /// Whether `kill` was called
    fn is_dead(&self) -> bool;
}

/// Recursive native mutex
///
/// The holder may take it again; each take must be given back.
pub trait RawRecursiveMutex: Send + Sync {
    /// Take within `wait` (`None` waits forever)
    fn take(&self, owner: TaskHandle, wait: Option<Duration>) -> Take;

    /// Give back one level; `false` if `owner` does not hold the mutex
    fn give(&self, owner: TaskHandle) -> bool;

    /// Current holder
    fn holder(&self) -> Option<TaskHandle>;

    /// Nesting depth of the current holder
    fn depth(&self) -> u32;
}

/// Host scheduler primitives consumed by the bridge
pub trait Scheduler: Send + Sync {
    /// Handle of the calling task. Never fails while the scheduler runs.
    fn current(&self) -> TaskHandle;

    /// Create and start a task
    fn spawn(&self, spec: TaskSpec, body: TaskBody) -> Result<TaskHandle>;

    /// Block the calling task
    fn delay(&self, duration: Duration);

    /// Delete a task. Deleting the calling task does not return.
    fn delete(&self, task: TaskHandle) -> Result<()>;

    /// Delete the calling task
    fn exit(&self) -> !;

    /// Lifecycle state of a task, `None` if unknown to this scheduler
    ///
    /// A scheduler may forget tasks whose body has returned.
    fn task_state(&self, task: TaskHandle) -> Option<TaskState>;

    /// Create an exclusive mutex, `None` on resource exhaustion
    fn create_mutex(&self) -> Option<Arc<dyn RawMutex>>;

    /// Create a recursive mutex, `None` on resource exhaustion
    fn create_recursive_mutex(&self) -> Option<Arc<dyn RawRecursiveMutex>>;

    /// Length of one scheduler tick
    fn tick_period(&self) -> Duration {
        Duration::from_millis(config::DEFAULT_TICK_MS as u64)
    }

    /// Monotonic time since the scheduler started
    fn now(&self) -> Duration;
}

/// Tick length in whole milliseconds
pub(crate) fn tick_ms(scheduler: &dyn Scheduler) -> u32 {
    scheduler.tick_period().as_millis().clamp(1, u32::MAX as u128) as u32
}

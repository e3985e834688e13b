// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Shared VM
//!
//! Host-side glue that lets several tasks drive one VM instance.
//!
//! ```rust,no_run
//! use rtvm_bridge::{Bridge, SharedVm, ThreadScheduler};
//!
//! let bridge = Bridge::builder().build(ThreadScheduler::new()).unwrap();
//! let vm = SharedVm::open(&bridge, 0u64).unwrap();
//! vm.call(|ctx| *ctx.state_mut() += 1).unwrap();
//! ```
//!
//! Every [`SharedVm::call`] runs under the interpreter lock with a bounded
//! wait. A task that calls back into the VM from inside a call is caught
//! before it blocks on itself and routed to the deadlock handler.

use crate::alloc::AllocatorBridge;
use crate::bridge::Bridge;
use crate::error::{Error, Result};
use crate::identity::{ThreadApi, ThreadIdentity};
use crate::lock::{Lock, LockApi};
use parking_lot::Mutex;
use rtvm_common::WaitTimeout;
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// One VM instance shared between tasks
pub struct SharedVm<T> {
    state: UnsafeCell<T>,
    lock: Lock,
    lock_api: Arc<dyn LockApi>,
    thread_api: Arc<dyn ThreadApi>,
    allocator: Arc<AllocatorBridge>,
    /// Task currently inside `call`
    owner: Mutex<ThreadIdentity>,
    timeout: WaitTimeout,
}

// State is only reached through `call`, under the interpreter lock
unsafe impl<T: Send> Sync for SharedVm<T> {}

impl<T> SharedVm<T> {
    /// Create the interpreter lock and wrap `state`
    ///
    /// The VM cannot run without its lock; callers treat failure as fatal.
    pub fn open(bridge: &Bridge, state: T) -> Result<Self> {
        let lock_api = bridge.lock_api();
        let lock = lock_api.init().map_err(|e| {
            error!("failed to create interpreter lock: {}", e);
            e
        })?;
        debug!("VM opened");
        Ok(Self {
            state: UnsafeCell::new(state),
            lock,
            lock_api,
            thread_api: bridge.thread_api(),
            allocator: bridge.allocator().clone(),
            owner: Mutex::new(ThreadIdentity::NULL),
            timeout: WaitTimeout::default(),
        })
    }

    /// Set how long `call` waits for the interpreter lock
    pub fn with_timeout(mut self, timeout: WaitTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    /// The interpreter lock
    pub fn lock(&self) -> &Lock {
        &self.lock
    }

    /// Run `f` with exclusive access to the VM
    ///
    /// Fails with `Timeout` if the lock is not acquired in time and with
    /// `DeadlockDetected` if the caller is already inside a call.
    pub fn call<R>(&self, f: impl FnOnce(&mut VmContext<'_, T>) -> R) -> Result<R> {
        let me = self.thread_api.current();
        if self.thread_api.equals(*self.owner.lock(), me) {
            self.lock_api.deadlock_handler(&self.lock);
            return Err(Error::DeadlockDetected);
        }

        let _guard = self.lock.write_guard(self.lock_api.as_ref(), self.timeout)?;
        *self.owner.lock() = me;
        let _owner = OwnerReset(&self.owner);

        // SAFETY: the interpreter lock is held, nobody else can reach the state
        let state = unsafe { &mut *self.state.get() };
        let mut ctx = VmContext {
            state,
            allocator: &self.allocator,
        };
        Ok(f(&mut ctx))
    }

    /// Destroy the interpreter lock and hand back the state
    pub fn close(mut self) -> Result<T> {
        self.lock_api.destroy(&mut self.lock)?;
        debug!("VM closed");
        Ok(self.state.into_inner())
    }
}

/// Clears the owner before the lock guard gives the lock back
struct OwnerReset<'a>(&'a Mutex<ThreadIdentity>);

impl Drop for OwnerReset<'_> {
    fn drop(&mut self) {
        *self.0.lock() = ThreadIdentity::NULL;
    }
}

/// What a VM call sees: its state and the allocator
pub struct VmContext<'a, T> {
    state: &'a mut T,
    allocator: &'a AllocatorBridge,
}

impl<T> VmContext<'_, T> {
    /// VM state
    pub fn state(&self) -> &T {
        &*self.state
    }

    /// VM state, mutably
    pub fn state_mut(&mut self) -> &mut T {
        &mut *self.state
    }

    /// Allocate `size > 0` bytes
    ///
    /// Exhaustion is an ordinary error the script can catch.
    pub fn alloc(&mut self, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArguments("zero-sized allocation"));
        }
        self.allocator
            .allocate(size)
            .ok_or_else(|| self.out_of_memory(size))
    }

    /// Resize `ptr` to `size > 0` bytes; `ptr` stays valid on failure
    pub fn resize(&mut self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>> {
        if size == 0 {
            return Err(Error::InvalidArguments("zero-sized allocation"));
        }
        self.allocator
            .allocate_or_resize(Some(ptr), size)
            .ok_or_else(|| self.out_of_memory(size))
    }

    /// Release a block
    pub fn free(&mut self, ptr: NonNull<u8>) {
        self.allocator.free(ptr);
    }

    fn out_of_memory(&self, requested: usize) -> Error {
        let total = self
            .allocator
            .ledger()
            .total_allocated
            .load(Ordering::Relaxed) as usize;
        warn!("raising out-of-memory for a {} byte request", requested);
        Error::OutOfMemory { requested, total }
    }
}

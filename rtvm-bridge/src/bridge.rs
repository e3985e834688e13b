// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Bridge builder and context object
//!
//! A [`Bridge`] bundles the lock adapter, the thread adapter and the
//! allocator for one host scheduler. Every VM entry point is reached
//! through it; several bridges can coexist in one process.

use crate::alloc::{AllocatorBridge, FallbackHeap, FastRegion, SystemHeap};
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::host::Scheduler;
use crate::identity::{RtosThreadApi, ThreadApi};
use crate::lock::{LockApi, RtosLockApi};
use rtvm_common::config;
use std::ptr::NonNull;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Where the allocator gets its fast memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionSource {
    /// No fast region; every request goes to the heap
    None,
    /// Anonymous mapping of the given size
    Anonymous(usize),
    /// Fixed memory at an address, e.g. core-coupled RAM
    Fixed { base: usize, size: usize },
}

/// Bridge configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Fast region backing
    pub region: RegionSource,

    /// Bump alignment of the fast region
    pub alignment: usize,

    /// Stall applied by the deadlock handler
    pub deadlock_cooldown: Duration,

    /// Wait budget for the allocator's recursive lock
    pub heap_lock_timeout: Duration,

    /// Fallback heap capacity, unbounded when `None`
    pub heap_limit: Option<usize>,

    /// Send single-character trace marks to the diagnostics sink
    pub trace_marks: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            region: RegionSource::Anonymous(config::FAST_REGION_SIZE),
            alignment: config::FAST_REGION_ALIGN,
            deadlock_cooldown: Duration::from_millis(config::DEADLOCK_COOLDOWN_MS as u64),
            heap_lock_timeout: Duration::from_millis(config::HEAP_LOCK_TIMEOUT_MS as u64),
            heap_limit: None,
            trace_marks: false,
        }
    }
}

/// Bridge builder
pub struct Builder {
    config: BridgeConfig,
    diag: Diagnostics,
}

impl Builder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: BridgeConfig::default(),
            diag: Diagnostics::disabled(),
        }
    }

    /// Use an anonymous fast region of `bytes`
    pub fn fast_region_size(mut self, bytes: usize) -> Self {
        self.config.region = RegionSource::Anonymous(bytes);
        self
    }

    /// Use fixed memory as the fast region
    ///
    /// # Safety
    /// See [`FastRegion::from_raw`]. The memory must outlive the bridge.
    pub unsafe fn fast_region_raw(mut self, base: NonNull<u8>, size: usize) -> Self {
        self.config.region = RegionSource::Fixed {
            base: base.as_ptr() as usize,
            size,
        };
        self
    }

    /// Skip the fast region entirely
    pub fn heap_only(mut self) -> Self {
        self.config.region = RegionSource::None;
        self
    }

    /// Set the fast region's bump alignment
    pub fn alignment(mut self, bytes: usize) -> Self {
        self.config.alignment = bytes;
        self
    }

    /// Set how long the deadlock handler stalls the offending task
    pub fn deadlock_cooldown(mut self, cooldown: Duration) -> Self {
        self.config.deadlock_cooldown = cooldown;
        self
    }

    /// Set the wait budget for the allocator's lock
    pub fn heap_lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.heap_lock_timeout = timeout;
        self
    }

    /// Cap the fallback heap at `bytes`
    pub fn heap_limit(mut self, bytes: usize) -> Self {
        self.config.heap_limit = Some(bytes);
        self
    }

    /// Send trace marks to the diagnostics sink
    pub fn trace_marks(mut self, enabled: bool) -> Self {
        self.config.trace_marks = enabled;
        self
    }

    /// Route diagnostics to `diag`
    ///
    /// Whether trace marks reach it is governed by [`Builder::trace_marks`].
    pub fn diagnostics(mut self, diag: Diagnostics) -> Self {
        self.diag = diag;
        self
    }

    /// Build the bridge over `scheduler`
    pub fn build(self, scheduler: Arc<dyn Scheduler>) -> Result<Bridge> {
        Bridge::new(self.config, self.diag, scheduler)
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

/// Concurrency bridge between one VM and the host scheduler
pub struct Bridge {
    config: BridgeConfig,
    scheduler: Arc<dyn Scheduler>,
    lock_api: Arc<RtosLockApi>,
    thread_api: Arc<RtosThreadApi>,
    allocator: Arc<AllocatorBridge>,
    diag: Diagnostics,
}

impl Bridge {
    fn new(config: BridgeConfig, diag: Diagnostics, scheduler: Arc<dyn Scheduler>) -> Result<Self> {
        let region = match config.region {
            RegionSource::None => None,
            RegionSource::Anonymous(size) => Some(FastRegion::anonymous(size, config.alignment)?),
            RegionSource::Fixed { base, size } => {
                let base = NonNull::new(base as *mut u8)
                    .ok_or(Error::InvalidArguments("null fast region base"))?;
                // SAFETY: the caller of `Builder::fast_region_raw` vouched for the memory
                Some(unsafe { FastRegion::from_raw(base, size, config.alignment) })
            }
        };
        let diag = diag.with_marks(config.trace_marks);
        let heap: Box<dyn FallbackHeap> = match config.heap_limit {
            Some(limit) => Box::new(SystemHeap::with_limit(limit)),
            None => Box::new(SystemHeap::new()),
        };

        let allocator = AllocatorBridge::new(
            region,
            heap,
            scheduler.clone(),
            config.heap_lock_timeout,
            diag.clone(),
        )?;
        let lock_api = RtosLockApi::new(scheduler.clone(), diag.clone(), config.deadlock_cooldown);
        let thread_api = RtosThreadApi::new(scheduler.clone());

        info!(
            "bridge ready: region={:?} cooldown={:?} heap_lock_timeout={:?}",
            config.region, config.deadlock_cooldown, config.heap_lock_timeout
        );

        Ok(Self {
            config,
            scheduler,
            lock_api: Arc::new(lock_api),
            thread_api: Arc::new(thread_api),
            allocator: Arc::new(allocator),
            diag,
        })
    }

    /// Start building a bridge
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Get the bridge configuration
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Lock table for the VM
    pub fn lock_api(&self) -> Arc<dyn LockApi> {
        self.lock_api.clone()
    }

    /// Thread table for the VM
    pub fn thread_api(&self) -> Arc<dyn ThreadApi> {
        self.thread_api.clone()
    }

    /// The VM's allocator
    pub fn allocator(&self) -> &Arc<AllocatorBridge> {
        &self.allocator
    }

    /// The host scheduler
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// The diagnostics sink
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Delay the calling task, as the VM's `sleep` native
    pub fn sleep(&self, ms: u32) {
        self.scheduler.delay(Duration::from_millis(ms as u64));
    }

    /// Report an unrecoverable host error and park the calling task
    pub fn fatal(&self, msg: &str) -> ! {
        self.diag.report(msg);
        error!("fatal: {}", msg);
        loop {
            self.scheduler.delay(Duration::from_secs(1));
        }
    }
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("allocator", &self.allocator)
            .field("diag", &self.diag)
            .finish()
    }
}

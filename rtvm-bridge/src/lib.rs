// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Rtvm Bridge
//!
//! Lets one embedded scripting VM be driven by several preemptive,
//! fixed-priority RTOS tasks.
//!
//! The VM expects three tables from its host; the bridge supplies them over
//! a [`Scheduler`]:
//!
//! - **Lock adapter** ([`LockApi`]): the interpreter lock, mapped onto one
//!   native exclusive mutex with bounded waits
//! - **Thread adapter** ([`ThreadApi`]): identity, comparison and forced
//!   termination of tasks
//! - **Allocator bridge** ([`AllocatorBridge`]): bump allocation from a
//!   fast region, then a general heap, under a recursive lock
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rtvm_bridge::{Bridge, SharedVm, ThreadScheduler};
//! use rtvm_common::WaitTimeout;
//!
//! let bridge = Bridge::builder()
//!     .fast_region_size(50 * 1024)
//!     .build(ThreadScheduler::new())
//!     .unwrap();
//!
//! let vm = SharedVm::open(&bridge, Vec::<u8>::new())
//!     .unwrap()
//!     .with_timeout(WaitTimeout::Millis(5000));
//!
//! vm.call(|ctx| ctx.state_mut().push(1)).unwrap();
//! ```
//!
//! ## Schedulers
//!
//! [`ThreadScheduler`] runs each task on an OS thread. [`SimScheduler`] is
//! a deterministic single-threaded double with a virtual clock, used to
//! pin down timeouts and failure paths in tests.

pub mod alloc;
pub mod bridge;
pub mod diag;
pub mod error;
pub mod host;
pub mod identity;
pub mod lock;
pub mod vm;

pub use alloc::{AllocEvent, AllocatorBridge, FastRegion, LedgerSnapshot};
pub use bridge::{Bridge, BridgeConfig, Builder, RegionSource};
pub use diag::{DiagReceiver, DiagRecord, Diagnostics};
pub use error::{Error, Result};
pub use host::{Scheduler, SimScheduler, TaskHandle, TaskSpec, ThreadScheduler};
pub use identity::{JoinOutcome, RtosThreadApi, ThreadApi, ThreadIdentity};
pub use lock::{Lock, LockApi, LockApiExt, LockGuard, RtosLockApi};
pub use vm::{SharedVm, VmContext};

/// Re-export common types
pub use rtvm_common::{LockCapabilities, LockStatus, TaskState, TraceMark, WaitTimeout};

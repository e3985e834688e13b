// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Lock Adapter
//!
//! The interpreter lock the VM takes before touching shared state.
//!
//! The VM expects a reader/writer lock table. The adapter only provides
//! mutual exclusion: `read_lock` is `write_lock`, and
//! [`LockApi::capabilities`] says so. Do not hand out concurrent read
//! access without first auditing what the VM assumes about readers.
//!
//! Every operation reports a [`LockStatus`] through [`Error::status`].
//! Misuse is returned to the caller, never treated as fatal here.

use crate::diag::Diagnostics;
use crate::error::{status_of, Error, Result};
use crate::host::{self, RawMutex, Scheduler, Take};
use rtvm_common::{LockCapabilities, LockStatus, TraceMark, WaitTimeout};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Handle to one native mutual-exclusion primitive
///
/// `Lock::default()` is the null lock. Clones share the primitive, so every
/// task calling into the VM can hold its own copy.
#[derive(Clone, Default)]
pub struct Lock {
    raw: Option<Arc<dyn RawMutex>>,
}

impl Lock {
    /// Whether this is the null handle
    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Whether the primitive was destroyed through another clone
    pub fn is_dead(&self) -> bool {
        self.raw.as_ref().is_some_and(|raw| raw.is_dead())
    }

    fn live(&self) -> Result<&Arc<dyn RawMutex>> {
        match &self.raw {
            None => Err(Error::InvalidArguments("null lock")),
            Some(raw) if raw.is_dead() => Err(Error::InvalidArguments("destroyed lock")),
            Some(raw) => Ok(raw),
        }
    }

    /// Acquire exclusively and release when the guard drops
    ///
    /// The guard gives the lock back on normal return and on unwind. A
    /// task deleted while holding it never drops the guard, which leaves
    /// the lock held for good.
    pub fn write_guard<'a>(
        &'a self,
        api: &'a dyn LockApi,
        timeout: WaitTimeout,
    ) -> Result<LockGuard<'a>> {
        api.write_lock(self, timeout)?;
        Ok(LockGuard {
            api,
            lock: self,
            _marker: PhantomData,
        })
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.raw {
            None => f.write_str("Lock(null)"),
            Some(raw) => f
                .debug_struct("Lock")
                .field("holder", &raw.holder())
                .field("dead", &raw.is_dead())
                .finish(),
        }
    }
}

/// RAII guard for the interpreter lock
///
/// `!Send`: the lock must be given back by the task that took it.
pub struct LockGuard<'a> {
    api: &'a dyn LockApi,
    lock: &'a Lock,
    _marker: PhantomData<*const ()>,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.api.unlock(self.lock) {
            warn!("guarded unlock failed: {}", e);
        }
    }
}

/// Lock table installed into the VM
pub trait LockApi: Send + Sync {
    /// Create one native primitive
    fn init(&self) -> Result<Lock>;

    /// Release if held and mark the primitive dead
    fn destroy(&self, lock: &mut Lock) -> Result<()>;

    /// Shared acquisition (exclusive unless `capabilities` says otherwise)
    fn read_lock(&self, lock: &Lock, timeout: WaitTimeout) -> Result<()>;

    /// Exclusive acquisition within `timeout`
    fn write_lock(&self, lock: &Lock, timeout: WaitTimeout) -> Result<()>;

    /// Release ownership
    fn unlock(&self, lock: &Lock) -> Result<()>;

    /// Contain a detected, unresolvable locking violation
    fn deadlock_handler(&self, lock: &Lock);

    /// What this adapter really provides
    fn capabilities(&self) -> LockCapabilities;
}

/// Status-code view of the lock table, as the VM sees it
pub trait LockApiExt: LockApi {
    /// `init` collapsed to a status and a possibly-null lock
    fn init_status(&self) -> (LockStatus, Lock) {
        match self.init() {
            Ok(lock) => (LockStatus::Ok, lock),
            Err(e) => (e.status(), Lock::default()),
        }
    }

    /// `write_lock` collapsed to a status
    fn write_lock_status(&self, lock: &Lock, timeout: WaitTimeout) -> LockStatus {
        status_of(&self.write_lock(lock, timeout))
    }

    /// `read_lock` collapsed to a status
    fn read_lock_status(&self, lock: &Lock, timeout: WaitTimeout) -> LockStatus {
        status_of(&self.read_lock(lock, timeout))
    }

    /// `unlock` collapsed to a status
    fn unlock_status(&self, lock: &Lock) -> LockStatus {
        status_of(&self.unlock(lock))
    }
}

impl<T: LockApi + ?Sized> LockApiExt for T {}

/// Lock adapter over the host scheduler's exclusive mutex
pub struct RtosLockApi {
    scheduler: Arc<dyn Scheduler>,
    diag: Diagnostics,
    cooldown: Duration,
}

impl RtosLockApi {
    /// Create an adapter stalling `cooldown` in the deadlock handler
    pub fn new(scheduler: Arc<dyn Scheduler>, diag: Diagnostics, cooldown: Duration) -> Self {
        Self {
            scheduler,
            diag,
            cooldown,
        }
    }

    /// Configured deadlock cooldown
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }
}

impl LockApi for RtosLockApi {
    fn init(&self) -> Result<Lock> {
        self.diag.mark(TraceMark::LockInit);
        let raw = self
            .scheduler
            .create_mutex()
            .ok_or(Error::ResourceExhausted("interpreter mutex"))?;
        debug!("interpreter lock created");
        Ok(Lock { raw: Some(raw) })
    }

    fn destroy(&self, lock: &mut Lock) -> Result<()> {
        let raw = lock
            .raw
            .take()
            .ok_or(Error::InvalidArguments("null lock"))?;
        // The primitive's storage may outlive this call; it is only marked dead
        raw.kill();
        debug!("interpreter lock destroyed");
        Ok(())
    }

    fn read_lock(&self, lock: &Lock, timeout: WaitTimeout) -> Result<()> {
        self.write_lock(lock, timeout)
    }

    fn write_lock(&self, lock: &Lock, timeout: WaitTimeout) -> Result<()> {
        self.diag.mark(TraceMark::Lock);
        let raw = lock.live()?;
        let owner = self.scheduler.current();
        let wait = timeout.to_duration(host::tick_ms(self.scheduler.as_ref()));

        match raw.take(owner, wait) {
            Take::Acquired => {
                trace!("{:?} acquired interpreter lock", owner);
                Ok(())
            }
            Take::TimedOut => {
                self.diag.mark(TraceMark::LockTimeout);
                debug!("{:?} timed out on interpreter lock ({:?})", owner, timeout);
                Err(Error::Timeout(timeout))
            }
            Take::Dead => Err(Error::InvalidArguments("destroyed lock")),
        }
    }

    fn unlock(&self, lock: &Lock) -> Result<()> {
        self.diag.mark(TraceMark::Unlock);
        let raw = lock.live()?;
        let owner = self.scheduler.current();

        if raw.give(owner) {
            trace!("{:?} released interpreter lock", owner);
            Ok(())
        } else {
            // Most likely an unlock without a matching lock
            self.diag.mark(TraceMark::UnlockFailed);
            warn!(
                "{:?} failed to release interpreter lock (holder {:?})",
                owner,
                raw.holder()
            );
            Err(Error::Unknown("give without take"))
        }
    }

    fn deadlock_handler(&self, _lock: &Lock) {
        self.diag.mark(TraceMark::Deadlock);
        warn!(
            "{:?} hit a locking violation; stalling for {:?}",
            self.scheduler.current(),
            self.cooldown
        );
        self.scheduler.delay(self.cooldown);
    }

    fn capabilities(&self) -> LockCapabilities {
        LockCapabilities::EXCLUSIVE_ONLY
    }
}

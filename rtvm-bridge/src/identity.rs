// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! # Thread-Identity Adapter
//!
//! Tells the VM which task is running it. Identities are weak: they name a
//! task for comparison and never keep it alive.
//!
//! Tasks run to completion or are deleted; nothing ever waits for one.
//! `join` is therefore answered with [`JoinOutcome::NotMeaningful`] instead
//! of blocking on a completion nobody will signal.

use crate::error::{Error, Result};
use crate::host::{Scheduler, TaskHandle};
use std::sync::Arc;
use tracing::debug;

/// Weak reference to a scheduling unit
///
/// Deliberately not `PartialEq`: two null identities are *not* the same
/// task. Compare with [`ThreadApi::equals`] or [`ThreadIdentity::same_as`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadIdentity(Option<TaskHandle>);

impl ThreadIdentity {
    /// Identity that names no task
    pub const NULL: Self = Self(None);

    /// Whether this names no task
    pub fn is_null(self) -> bool {
        self.0.is_none()
    }

    /// Underlying task handle
    pub fn task(self) -> Option<TaskHandle> {
        self.0
    }

    /// True iff both are non-null and name the same task
    pub fn same_as(self, other: ThreadIdentity) -> bool {
        matches!((self.0, other.0), (Some(a), Some(b)) if a == b)
    }
}

impl From<TaskHandle> for ThreadIdentity {
    fn from(task: TaskHandle) -> Self {
        Self(Some(task))
    }
}

/// Result of `join` under a run-to-completion task model
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Joining has no meaning here; the VM sees `nil`
    NotMeaningful,
}

/// Thread table installed into the VM
pub trait ThreadApi: Send + Sync {
    /// Identity of the calling task
    fn current(&self) -> ThreadIdentity;

    /// False if either is null; true iff both name the same task
    fn equals(&self, a: ThreadIdentity, b: ThreadIdentity) -> bool {
        a.same_as(b)
    }

    /// Never blocks; see [`JoinOutcome`]
    fn join(&self, thread: ThreadIdentity) -> JoinOutcome;

    /// Delete the task. Terminating the caller does not return.
    fn terminate(&self, thread: ThreadIdentity) -> Result<()>;
}

/// Thread adapter over the host scheduler
pub struct RtosThreadApi {
    scheduler: Arc<dyn Scheduler>,
}

impl RtosThreadApi {
    /// Create an adapter over `scheduler`
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }
}

impl ThreadApi for RtosThreadApi {
    fn current(&self) -> ThreadIdentity {
        self.scheduler.current().into()
    }

    fn join(&self, thread: ThreadIdentity) -> JoinOutcome {
        debug!("join on {:?} ignored: tasks are never awaited", thread);
        JoinOutcome::NotMeaningful
    }

    fn terminate(&self, thread: ThreadIdentity) -> Result<()> {
        let task = thread
            .task()
            .ok_or(Error::InvalidArguments("null thread identity"))?;
        // No cleanup runs; locks the task holds stay held
        self.scheduler.delete(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{SimScheduler, TaskSpec};
    use rtvm_common::TaskState;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_current_equals_itself() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        assert!(api.equals(api.current(), api.current()));
    }

    #[test]
    fn test_null_never_equal() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        assert!(!api.equals(ThreadIdentity::NULL, ThreadIdentity::NULL));
        assert!(!api.equals(api.current(), ThreadIdentity::NULL));
        assert!(!api.equals(ThreadIdentity::NULL, api.current()));
    }

    #[test]
    fn test_distinct_tasks_differ() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        let root = api.current();
        let other = sched.add_task("other");
        sched.switch_to(other);
        assert!(!api.equals(root, api.current()));
        assert!(api.equals(other.into(), api.current()));
    }

    #[test]
    fn test_join_is_not_meaningful() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        let other = sched.add_task("other");
        assert_eq!(api.join(other.into()), JoinOutcome::NotMeaningful);
        assert_eq!(api.join(ThreadIdentity::NULL), JoinOutcome::NotMeaningful);
        // Join does not touch the task
        assert_eq!(sched.task_state(other), Some(TaskState::Ready));
    }

    #[test]
    fn test_terminate_other_task() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        let victim = sched.add_task("victim");
        api.terminate(victim.into()).unwrap();
        assert_eq!(sched.task_state(victim), Some(TaskState::Terminated));
    }

    #[test]
    fn test_terminate_null_is_invalid() {
        let sched = SimScheduler::new();
        let api = RtosThreadApi::new(sched.clone());
        assert!(matches!(
            api.terminate(ThreadIdentity::NULL),
            Err(Error::InvalidArguments(_))
        ));
    }

    #[test]
    fn test_self_terminate_is_point_of_no_return() {
        let sched = SimScheduler::new();
        let api = Arc::new(RtosThreadApi::new(sched.clone()));
        let reached = Arc::new(AtomicBool::new(false));

        let inner_api = api.clone();
        let inner_reached = reached.clone();
        let task = sched
            .spawn(
                TaskSpec::new("self-terminating"),
                Box::new(move || {
                    let me = inner_api.current();
                    let _ = inner_api.terminate(me);
                    inner_reached.store(true, Ordering::Relaxed);
                }),
            )
            .unwrap();

        sched.run(task);
        assert!(!reached.load(Ordering::Relaxed));
        assert_eq!(sched.task_state(task), Some(TaskState::Terminated));
    }
}

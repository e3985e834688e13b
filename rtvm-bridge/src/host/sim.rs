// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Deterministic scheduler double
//!
//! Nothing here blocks a real thread. Time is a virtual millisecond clock,
//! tasks run inline when the test asks for them, and the current task is
//! switched explicitly. This makes timeouts and contention reproducible:
//!
//! - A contended timed take advances the clock by the wait budget and
//!   times out.
//! - A contended infinite take can never complete (no other task runs
//!   while it waits), so it is reported as a timeout and logged.
//! - Mutex creation failures can be injected to exercise resource
//!   exhaustion paths.
//!
//! Self-deletion unwinds out of the task body with a private payload that
//! [`SimScheduler::run`] catches. Unlike the real adapter this drops guards
//! on the way out.

use super::{RawMutex, RawRecursiveMutex, Scheduler, TaskBody, TaskHandle, TaskSpec, Take};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use rtvm_common::TaskState;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Unwind payload for a task that deleted itself
struct SimTaskExit;

/// Virtual clock shared with the simulated mutexes
#[derive(Debug, Default)]
struct SimClock {
    now_ms: AtomicU64,
}

impl SimClock {
    fn advance(&self, by: Duration) {
        let ms = u64::try_from(by.as_millis()).unwrap_or(u64::MAX);
        self.now_ms.fetch_add(ms, Ordering::Relaxed);
    }

    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::Relaxed))
    }
}

struct SimTask {
    name: String,
    state: TaskState,
    body: Option<TaskBody>,
}

/// Scheduler double with a virtual clock and explicit task switching
pub struct SimScheduler {
    clock: Arc<SimClock>,
    tick: Duration,
    tasks: Mutex<HashMap<TaskHandle, SimTask>>,
    current: Mutex<TaskHandle>,
    root: TaskHandle,
    failing_creates: AtomicU32,
    infinite_waits: Arc<AtomicU64>,
}

impl SimScheduler {
    /// Create a scheduler whose root task is current
    pub fn new() -> Arc<Self> {
        let root = TaskHandle::next();
        let mut tasks = HashMap::new();
        tasks.insert(
            root,
            SimTask {
                name: "main".to_string(),
                state: TaskState::Running,
                body: None,
            },
        );
        Arc::new(Self {
            clock: Arc::new(SimClock::default()),
            tick: Duration::from_millis(rtvm_common::config::DEFAULT_TICK_MS as u64),
            tasks: Mutex::new(tasks),
            current: Mutex::new(root),
            root,
            failing_creates: AtomicU32::new(0),
            infinite_waits: Arc::new(AtomicU64::new(0)),
        })
    }

    /// The task that was current at creation
    pub fn root(&self) -> TaskHandle {
        self.root
    }

    /// Create a task without a body, usable with [`switch_to`](Self::switch_to)
    pub fn add_task(&self, name: &str) -> TaskHandle {
        let task = TaskHandle::next();
        self.tasks.lock().insert(
            task,
            SimTask {
                name: name.to_string(),
                state: TaskState::Ready,
                body: None,
            },
        );
        task
    }

    /// Make `task` the current task
    pub fn switch_to(&self, task: TaskHandle) {
        *self.current.lock() = task;
    }

    /// Run a spawned task's body to completion as the current task
    ///
    /// Returns `false` if the task has no pending body.
    pub fn run(&self, task: TaskHandle) -> bool {
        let body = {
            let mut tasks = self.tasks.lock();
            match tasks.get_mut(&task) {
                Some(t) if t.state.is_alive() => {
                    t.state = TaskState::Running;
                    t.body.take()
                }
                _ => None,
            }
        };
        let Some(body) = body else {
            return false;
        };

        let previous = std::mem::replace(&mut *self.current.lock(), task);
        let outcome = panic::catch_unwind(AssertUnwindSafe(body));
        *self.current.lock() = previous;

        if let Some(t) = self.tasks.lock().get_mut(&task) {
            t.state = TaskState::Terminated;
        }
        if let Err(payload) = outcome {
            if !payload.is::<SimTaskExit>() {
                panic::resume_unwind(payload);
            }
            debug!("{:?} exited", task);
        }
        true
    }

    /// Advance the virtual clock
    pub fn advance(&self, by: Duration) {
        self.clock.advance(by);
    }

    /// Make the next `n` mutex creations fail
    pub fn fail_next_mutex_creates(&self, n: u32) {
        self.failing_creates.store(n, Ordering::Relaxed);
    }

    /// Number of infinite waits that could never complete
    pub fn infinite_waits(&self) -> u64 {
        self.infinite_waits.load(Ordering::Relaxed)
    }

    fn creation_fails(&self) -> bool {
        self.failing_creates
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok()
    }

    fn sim_mutex(&self, recursive: bool) -> Option<SimMutex> {
        if self.creation_fails() {
            warn!("simulated mutex creation failure");
            return None;
        }
        Some(SimMutex {
            state: Mutex::new(SimMutexState::default()),
            clock: self.clock.clone(),
            infinite_waits: self.infinite_waits.clone(),
            recursive,
        })
    }
}

impl Scheduler for SimScheduler {
    fn current(&self) -> TaskHandle {
        *self.current.lock()
    }

    fn spawn(&self, spec: TaskSpec, body: TaskBody) -> Result<TaskHandle> {
        let task = TaskHandle::next();
        self.tasks.lock().insert(
            task,
            SimTask {
                name: spec.name,
                state: TaskState::Ready,
                body: Some(body),
            },
        );
        Ok(task)
    }

    fn delay(&self, duration: Duration) {
        self.clock.advance(duration);
    }

    fn delete(&self, task: TaskHandle) -> Result<()> {
        if task == self.current() {
            self.exit();
        }
        let mut tasks = self.tasks.lock();
        let t = tasks
            .get_mut(&task)
            .ok_or(Error::InvalidArguments("unknown task"))?;
        t.state = TaskState::Terminated;
        t.body = None;
        debug!("deleted {:?} ({})", task, t.name);
        Ok(())
    }

    fn exit(&self) -> ! {
        let task = self.current();
        if let Some(t) = self.tasks.lock().get_mut(&task) {
            t.state = TaskState::Terminated;
        }
        panic::resume_unwind(Box::new(SimTaskExit))
    }

    fn task_state(&self, task: TaskHandle) -> Option<TaskState> {
        self.tasks.lock().get(&task).map(|t| t.state)
    }

    fn create_mutex(&self) -> Option<Arc<dyn RawMutex>> {
        self.sim_mutex(false)
            .map(|m| Arc::new(m) as Arc<dyn RawMutex>)
    }

    fn create_recursive_mutex(&self) -> Option<Arc<dyn RawRecursiveMutex>> {
        self.sim_mutex(true)
            .map(|m| Arc::new(m) as Arc<dyn RawRecursiveMutex>)
    }

    fn tick_period(&self) -> Duration {
        self.tick
    }

    fn now(&self) -> Duration {
        self.clock.now()
    }
}

#[derive(Debug, Default)]
struct SimMutexState {
    holder: Option<TaskHandle>,
    depth: u32,
    dead: bool,
}

/// Simulated native mutex; never blocks a real thread
struct SimMutex {
    state: Mutex<SimMutexState>,
    clock: Arc<SimClock>,
    infinite_waits: Arc<AtomicU64>,
    recursive: bool,
}

impl SimMutex {
    fn take_inner(&self, owner: TaskHandle, wait: Option<Duration>) -> Take {
        let mut state = self.state.lock();
        if state.dead {
            return Take::Dead;
        }
        match state.holder {
            None => {
                state.holder = Some(owner);
                state.depth = 1;
                return Take::Acquired;
            }
            Some(holder) if self.recursive && holder == owner => {
                state.depth += 1;
                return Take::Acquired;
            }
            Some(_) => {}
        }

        match wait {
            Some(wait) => self.clock.advance(wait),
            None => {
                self.infinite_waits.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "{:?} waits forever on a mutex held by {:?}; no other task can release it",
                    owner, state.holder
                );
            }
        }
        Take::TimedOut
    }

    fn give_inner(&self, owner: TaskHandle) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(owner) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
        }
        true
    }
}

impl RawMutex for SimMutex {
    fn take(&self, owner: TaskHandle, wait: Option<Duration>) -> Take {
        self.take_inner(owner, wait)
    }

    fn give(&self, owner: TaskHandle) -> bool {
        self.give_inner(owner)
    }

    fn kill(&self) {
        let mut state = self.state.lock();
        state.holder = None;
        state.depth = 0;
        state.dead = true;
    }

    fn holder(&self) -> Option<TaskHandle> {
        self.state.lock().holder
    }

    fn is_dead(&self) -> bool {
        self.state.lock().dead
    }
}

impl RawRecursiveMutex for SimMutex {
    fn take(&self, owner: TaskHandle, wait: Option<Duration>) -> Take {
        self.take_inner(owner, wait)
    }

    fn give(&self, owner: TaskHandle) -> bool {
        self.give_inner(owner)
    }

    fn holder(&self) -> Option<TaskHandle> {
        self.state.lock().holder
    }

    fn depth(&self) -> u32 {
        self.state.lock().depth
    }
}

// SPDX-License-Identifier: GPL-2.0-only
// Copyright (C) 2024 Ankit Kumar Pandey <ankitkpandey1@gmail.com>

//! Thread-backed scheduler adapter
//!
//! Each task is one OS thread. Native mutexes are `parking_lot` mutex and
//! condvar pairs that track their holder, so a give by a non-holder fails
//! the way the RTOS primitive does.
//!
//! # Deletion
//!
//! OS threads cannot be killed from outside. `delete` marks the task
//! terminated and wakes it; the task parks forever at its next scheduling
//! point (a delay or a mutex wait) and never runs bridge code again. No
//! unwinding happens, so any mutex the task holds stays held.

use super::{RawMutex, RawRecursiveMutex, Scheduler, TaskBody, TaskHandle, TaskSpec, Take};
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use rtvm_common::TaskState;
use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

static NEXT_SCHEDULER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// Task handle of this thread, per scheduler instance
    static CURRENT_TASK: RefCell<HashMap<u64, TaskHandle>> = RefCell::new(HashMap::new());
}

/// Per-task bookkeeping
struct TaskSlot {
    name: String,
    priority: u8,
    /// OS thread ID, recorded once the thread runs
    native_tid: AtomicU32,
    state: Mutex<TaskState>,
    wake: Condvar,
}

impl TaskSlot {
    fn new(name: String, priority: u8) -> Self {
        Self {
            name,
            priority,
            native_tid: AtomicU32::new(0),
            state: Mutex::new(TaskState::Ready),
            wake: Condvar::new(),
        }
    }

    fn is_terminated(&self) -> bool {
        *self.state.lock() == TaskState::Terminated
    }

    fn set_state(&self, next: TaskState) {
        let mut state = self.state.lock();
        if *state != TaskState::Terminated {
            *state = next;
        }
    }
}

/// Task registry shared with the native mutexes
#[derive(Default)]
struct TaskTable {
    slots: Mutex<HashMap<TaskHandle, Arc<TaskSlot>>>,
}

impl TaskTable {
    fn get(&self, task: TaskHandle) -> Option<Arc<TaskSlot>> {
        self.slots.lock().get(&task).cloned()
    }

    fn insert(&self, task: TaskHandle, slot: Arc<TaskSlot>) {
        self.slots.lock().insert(task, slot);
    }

    fn is_terminated(&self, task: TaskHandle) -> bool {
        self.get(task).is_some_and(|slot| slot.is_terminated())
    }
}

/// Park the calling thread for good
fn park_forever() -> ! {
    loop {
        std::thread::park();
    }
}

/// Scheduler adapter backed by OS threads
pub struct ThreadScheduler {
    id: u64,
    tasks: Arc<TaskTable>,
    tick: Duration,
    epoch: Instant,
}

impl ThreadScheduler {
    /// Create a scheduler with a 1ms tick
    pub fn new() -> Arc<Self> {
        Self::with_tick(Duration::from_millis(rtvm_common::config::DEFAULT_TICK_MS as u64))
    }

    /// Create a scheduler with a custom tick length
    pub fn with_tick(tick: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            tasks: Arc::new(TaskTable::default()),
            tick: tick.max(Duration::from_millis(1)),
            epoch: Instant::now(),
        })
    }

    /// Name of a task
    pub fn task_name(&self, task: TaskHandle) -> Option<String> {
        self.tasks.get(task).map(|slot| slot.name.clone())
    }

    /// Priority a task was created with
    ///
    /// OS threads are not prioritized; the value is kept for diagnostics.
    pub fn task_priority(&self, task: TaskHandle) -> Option<u8> {
        self.tasks.get(task).map(|slot| slot.priority)
    }

    /// OS thread ID of a task, once it has started
    pub fn native_tid(&self, task: TaskHandle) -> Option<u32> {
        self.tasks
            .get(task)
            .map(|slot| slot.native_tid.load(Ordering::Relaxed))
            .filter(|tid| *tid != 0)
    }

    fn bind_current(&self, task: TaskHandle) {
        CURRENT_TASK.with(|map| {
            map.borrow_mut().insert(self.id, task);
        });
    }

    /// Register the calling thread as a task on first use
    fn adopt_current(&self) -> TaskHandle {
        let task = TaskHandle::next();
        let name = std::thread::current()
            .name()
            .map(str::to_owned)
            .unwrap_or_else(|| format!("adopted-{}", task.id()));
        let slot = Arc::new(TaskSlot::new(name, rtvm_common::config::PRIORITY_NORMAL));
        slot.native_tid.store(get_tid(), Ordering::Relaxed);
        *slot.state.lock() = TaskState::Running;
        self.tasks.insert(task, slot);
        self.bind_current(task);
        debug!("adopted thread as {:?}", task);
        task
    }
}

impl Scheduler for ThreadScheduler {
    fn current(&self) -> TaskHandle {
        let bound = CURRENT_TASK.with(|map| map.borrow().get(&self.id).copied());
        match bound {
            Some(task) => task,
            None => self.adopt_current(),
        }
    }

    fn spawn(&self, spec: TaskSpec, body: TaskBody) -> Result<TaskHandle> {
        let task = TaskHandle::next();
        let slot = Arc::new(TaskSlot::new(spec.name.clone(), spec.priority));
        self.tasks.insert(task, slot.clone());

        let scheduler_id = self.id;
        let thread_slot = slot.clone();
        let table = self.tasks.clone();
        let spawned = std::thread::Builder::new()
            .name(spec.name.clone())
            .stack_size(spec.stack_size)
            .spawn(move || {
                CURRENT_TASK.with(|map| {
                    map.borrow_mut().insert(scheduler_id, task);
                });
                thread_slot.native_tid.store(get_tid(), Ordering::Relaxed);
                if thread_slot.is_terminated() {
                    // Deleted before it ever ran
                    return;
                }
                thread_slot.set_state(TaskState::Running);
                body();
                *thread_slot.state.lock() = TaskState::Terminated;
                // Finished tasks leave the table; deleted ones stay parked in it
                table.slots.lock().remove(&task);
            });

        match spawned {
            Ok(_) => {
                info!("new task started: {} handle = {:?}", spec.name, task);
                Ok(task)
            }
            Err(e) => {
                self.tasks.slots.lock().remove(&task);
                Err(Error::TaskCreate(format!("{}: {}", spec.name, e)))
            }
        }
    }

    fn delay(&self, duration: Duration) {
        let task = self.current();
        let Some(slot) = self.tasks.get(task) else {
            std::thread::sleep(duration);
            return;
        };

        let deadline = Instant::now().checked_add(duration);
        let mut state = slot.state.lock();
        if *state != TaskState::Terminated {
            *state = TaskState::Blocked;
        }
        loop {
            if *state == TaskState::Terminated {
                drop(state);
                park_forever();
            }
            match deadline {
                Some(deadline) => {
                    if slot.wake.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => slot.wake.wait(&mut state),
            }
        }
        if *state == TaskState::Terminated {
            drop(state);
            park_forever();
        }
        *state = TaskState::Running;
    }

    fn delete(&self, task: TaskHandle) -> Result<()> {
        let slot = self
            .tasks
            .get(task)
            .ok_or(Error::InvalidArguments("unknown task"))?;

        if task == self.current() {
            self.exit();
        }

        *slot.state.lock() = TaskState::Terminated;
        slot.wake.notify_all();
        debug!("deleted {:?} ({})", task, slot.name);
        Ok(())
    }

    fn exit(&self) -> ! {
        let task = self.current();
        if let Some(slot) = self.tasks.get(task) {
            *slot.state.lock() = TaskState::Terminated;
            debug!("{:?} ({}) deleted itself", task, slot.name);
        }
        park_forever()
    }

    fn task_state(&self, task: TaskHandle) -> Option<TaskState> {
        self.tasks.get(task).map(|slot| *slot.state.lock())
    }

    fn create_mutex(&self) -> Option<Arc<dyn RawMutex>> {
        Some(Arc::new(ThreadMutex::new(self.tasks.clone(), false)))
    }

    fn create_recursive_mutex(&self) -> Option<Arc<dyn RawRecursiveMutex>> {
        Some(Arc::new(ThreadMutex::new(self.tasks.clone(), true)))
    }

    fn tick_period(&self) -> Duration {
        self.tick
    }

    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

#[derive(Debug, Default)]
struct MutexState {
    holder: Option<TaskHandle>,
    depth: u32,
    dead: bool,
}

/// Holder-tracking native mutex
///
/// Serves as both the exclusive and the recursive primitive; `recursive`
/// decides whether the holder may take it again.
struct ThreadMutex {
    state: Mutex<MutexState>,
    released: Condvar,
    tasks: Arc<TaskTable>,
    recursive: bool,
}

impl ThreadMutex {
    fn new(tasks: Arc<TaskTable>, recursive: bool) -> Self {
        Self {
            state: Mutex::new(MutexState::default()),
            released: Condvar::new(),
            tasks,
            recursive,
        }
    }

    fn take_inner(&self, owner: TaskHandle, wait: Option<Duration>) -> Take {
        // Overflowing deadlines wait forever
        let deadline = wait.and_then(|wait| Instant::now().checked_add(wait));
        let mut expired = false;
        let mut state = self.state.lock();

        loop {
            if state.dead {
                return Take::Dead;
            }
            if self.tasks.is_terminated(owner) {
                // Deleted while waiting: never acquire, and hand any
                // release wakeup on to a live waiter
                self.released.notify_one();
                drop(state);
                park_forever();
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

            if expired {
                return Take::TimedOut;
            }
            match deadline {
                Some(deadline) => {
                    expired = self.released.wait_until(&mut state, deadline).timed_out();
                }
                None => self.released.wait(&mut state),
            }
        }
    }

    fn give_inner(&self, owner: TaskHandle) -> bool {
        let mut state = self.state.lock();
        if state.holder != Some(owner) {
            return false;
        }
        state.depth -= 1;
        if state.depth == 0 {
            state.holder = None;
            self.released.notify_one();
        }
        true
    }
}

impl RawMutex for ThreadMutex {
    fn take(&self, owner: TaskHandle, wait: Option<Duration>) -> Take {
        self.take_inner(owner, wait)
    }

    fn give(&self, owner: TaskHandle) -> bool {
        self.give_inner(owner)
    }

    fn kill(&self) {
        let mut state = self.state.lock();
        if let Some(holder) = state.holder.take() {
            warn!("destroying mutex still held by {:?}", holder);
        }
        state.depth = 0;
        state.dead = true;
        self.released.notify_all();
    }

    fn holder(&self) -> Option<TaskHandle> {
        self.state.lock().holder
    }

    fn is_dead(&self) -> bool {
        self.state.lock().dead
    }
}

impl RawRecursiveMutex for ThreadMutex {
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

/// Get the current OS thread ID (TID)
#[cfg(target_os = "linux")]
pub fn get_tid() -> u32 {
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

#[cfg(not(target_os = "linux"))]
pub fn get_tid() -> u32 {
    std::process::id()
}

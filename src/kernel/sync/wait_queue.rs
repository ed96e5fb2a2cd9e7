// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Wait Queue
//!
//! This module provides wait queues for the Rustux kernel.
//! Wait queues are used by synchronization primitives, sockets and pipes to
//! manage threads that are blocked waiting for a condition.
//!
//! # Design
//!
//! - **FIFO ordering**: `wake_one` wakes the longest-waiting thread
//! - **No lost wakeups**: the waiter is queued before the caller's lock is
//!   released, and releasing happens inside [`WaitQueue::wait_until`]
//! - **Deadlines**: a per-wait timer removes the waiter and reports
//!   `TimedOut`; removal happens exactly once, by the waker or the timer
//! - **Hooks**: poll registrations are notified on every wake
//!
//! # Usage
//!
//! ```text
//! let mut inner = sock.inner.lock();
//! inner = sock.rx_wait.wait_until(inner, deadline, |s| !s.rxq.is_empty())?;
//! // ... consume data, lock still held ...
//!
//! // producer, under the same lock:
//! inner.rxq.push_back(pkt);
//! sock.rx_wait.wake_one();
//! ```

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU8, Ordering};

use crate::kernel::debug::log_fatal;
use crate::kernel::sched::{self, ThreadId};
use crate::kernel::sync::spin::SpinLock;
use crate::kernel::sync::Relock;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::{Nanoseconds, INFINITE_TIME};

// Import logging macros
use crate::log_trace;

/// ============================================================================
/// Wait Queue
/// ============================================================================

/// Magic number for wait queue validation
const WAIT_QUEUE_MAGIC: u32 = 0x57414954; // "WAIT" in hex

/// Waiter states
const WAITER_BLOCKED: u8 = 0;
const WAITER_WOKEN: u8 = 1;
const WAITER_TIMED_OUT: u8 = 2;
const WAITER_INTERRUPTED: u8 = 3;

/// A thread parked on a wait queue
///
/// The state leaves `WAITER_BLOCKED` exactly once, always while the queue's
/// spinlock is held and in the same critical section that unlinks the
/// waiter.
struct Waiter {
    tid: ThreadId,
    state: AtomicU8,
}

impl Waiter {
    fn new(tid: ThreadId) -> Self {
        Self {
            tid,
            state: AtomicU8::new(WAITER_BLOCKED),
        }
    }
}

/// Notification target that rides on a wait queue without blocking
///
/// Poll registrations implement this; `wake` is called after every wakeup of
/// the queue, outside the queue's lock, and must not block.
pub trait WakeHook: Send + Sync {
    /// The queue was woken
    fn wake(&self);
}

/// Identifier of a registered [`WakeHook`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HookId(u64);

struct WaitList {
    waiters: VecDeque<Arc<Waiter>>,
    hooks: Vec<(HookId, Arc<dyn WakeHook>)>,
    next_hook: u64,
}

impl WaitList {
    /// Unlink `waiter` and move it to `state`; false if someone else did
    fn remove(&mut self, waiter: &Arc<Waiter>, state: u8) -> bool {
        match self.waiters.iter().position(|w| Arc::ptr_eq(w, waiter)) {
            Some(pos) => {
                self.waiters.remove(pos);
                waiter.state.store(state, Ordering::Release);
                true
            }
            None => false,
        }
    }
}

/// Wait queue
///
/// Manages threads waiting for a condition to become true. The queue is
/// shared with the timers armed by timed waits, so it lives behind an `Arc`.
pub struct WaitQueue {
    list: Arc<SpinLock<WaitList>>,

    /// Magic number for validation
    magic: u32,
}

impl WaitQueue {
    /// Create a new wait queue
    pub fn new() -> Self {
        Self {
            list: Arc::new(SpinLock::new(WaitList {
                waiters: VecDeque::new(),
                hooks: Vec::new(),
                next_hook: 1,
            })),
            magic: WAIT_QUEUE_MAGIC,
        }
    }

    /// Destroy a wait queue
    ///
    /// Panics if there are threads still waiting.
    pub fn destroy(&self) {
        self.validate();

        if !self.is_empty() {
            log_fatal(format_args!("wait_queue_destroy: threads still waiting"));
        }
    }

    /// Block until `ready` holds, the deadline passes, or the wait is
    /// interrupted
    ///
    /// `guard` protects the state `ready` inspects. It is held whenever
    /// `ready` runs and is handed back on success. While sleeping the lock is
    /// released; a waker that takes the same lock, changes the state and
    /// calls [`wake_one`](Self::wake_one) or [`wake_all`](Self::wake_all)
    /// cannot be missed.
    ///
    /// # Returns
    ///
    /// - `Ok(guard)` once `ready` returned true
    /// - `Err(Error::TimedOut)` if `deadline` passed first (also when it has
    ///   already passed on entry and `ready` is false)
    /// - `Err(Error::Interrupted)` if [`interrupt`](Self::interrupt) removed us
    ///
    /// On error the lock has been released.
    pub fn wait_until<'a, G, F>(&self, mut guard: G, deadline: Nanoseconds, mut ready: F) -> Result<G>
    where
        G: Relock<'a>,
        F: FnMut(&mut G) -> bool,
    {
        self.validate();

        loop {
            if ready(&mut guard) {
                return Ok(guard);
            }
            if deadline != INFINITE_TIME && sched::scheduler().now() >= deadline {
                return Err(Error::TimedOut);
            }

            let (relocked, state) = self.block(guard, deadline);
            guard = relocked;
            match state {
                WAITER_WOKEN => continue,
                WAITER_TIMED_OUT => return Err(Error::TimedOut),
                WAITER_INTERRUPTED => return Err(Error::Interrupted),
                other => log_fatal(format_args!("wait_queue: bad waiter state {}", other)),
            }
        }
    }

    /// Block once, without a predicate
    ///
    /// Returns after a single wakeup; used by callers that re-evaluate their
    /// condition themselves, such as poll.
    pub fn wait<'a, G: Relock<'a>>(&self, guard: G, deadline: Nanoseconds) -> Result<G> {
        self.validate();

        if deadline != INFINITE_TIME && sched::scheduler().now() >= deadline {
            return Err(Error::TimedOut);
        }
        match self.block(guard, deadline) {
            (guard, WAITER_WOKEN) => Ok(guard),
            (_, WAITER_TIMED_OUT) => Err(Error::TimedOut),
            (_, _) => Err(Error::Interrupted),
        }
    }

    /// Queue the current thread, release `guard`, sleep, and re-acquire
    fn block<'a, G: Relock<'a>>(&self, guard: G, deadline: Nanoseconds) -> (G, u8) {
        let sched = sched::scheduler();
        let waiter = Arc::new(Waiter::new(sched.current()));

        self.list.lock().waiters.push_back(Arc::clone(&waiter));

        let timer = if deadline != INFINITE_TIME {
            let list = Arc::clone(&self.list);
            let timed = Arc::clone(&waiter);
            Some(sched.timers().add(deadline, move || {
                if list.lock().remove(&timed, WAITER_TIMED_OUT) {
                    sched::scheduler().unblock(timed.tid);
                }
            }))
        } else {
            None
        };

        let lock = guard.unlock();

        let held = sched.preempt_count();
        if held != 0 {
            log_fatal(format_args!(
                "wait_queue: thread {} blocking with {} spinlock(s) held",
                waiter.tid, held
            ));
        }

        log_trace!("thread {} blocking on wait queue", waiter.tid);
        while waiter.state.load(Ordering::Acquire) == WAITER_BLOCKED {
            sched.block();
        }

        if let Some(timer) = timer {
            sched.timers().remove(&timer);
        }

        let state = waiter.state.load(Ordering::Acquire);
        (G::relock(lock), state)
    }

    /// Wake one thread from the wait queue
    ///
    /// # Returns
    ///
    /// Number of threads woken (0 or 1)
    pub fn wake_one(&self) -> usize {
        self.validate();
        self.wake(1)
    }

    /// Wake all threads from the wait queue
    ///
    /// # Returns
    ///
    /// Number of threads woken
    pub fn wake_all(&self) -> usize {
        self.validate();
        self.wake(usize::MAX)
    }

    /// Remove a specific thread, failing its wait with `Interrupted`
    ///
    /// # Returns
    ///
    /// true if thread was found and removed, false otherwise
    pub fn interrupt(&self, tid: ThreadId) -> bool {
        self.validate();

        let removed = {
            let mut list = self.list.lock();
            let target = list.waiters.iter().find(|w| w.tid == tid).cloned();
            match target {
                Some(waiter) => list.remove(&waiter, WAITER_INTERRUPTED),
                None => false,
            }
        };

        if removed {
            sched::scheduler().unblock(tid);
        }
        removed
    }

    /// Check if the wait queue is empty
    pub fn is_empty(&self) -> bool {
        self.list.lock().waiters.is_empty()
    }

    /// Get the number of waiting threads
    pub fn len(&self) -> usize {
        self.list.lock().waiters.len()
    }

    /// Register a hook notified on every wakeup
    pub fn add_hook(&self, hook: Arc<dyn WakeHook>) -> HookId {
        let mut list = self.list.lock();
        let id = HookId(list.next_hook);
        list.next_hook += 1;
        list.hooks.push((id, hook));
        id
    }

    /// Remove a hook registered with [`add_hook`](Self::add_hook)
    pub fn remove_hook(&self, id: HookId) -> bool {
        let mut list = self.list.lock();
        let before = list.hooks.len();
        list.hooks.retain(|(hook_id, _)| *hook_id != id);
        before != list.hooks.len()
    }

    /// Internal wake implementation
    fn wake(&self, max: usize) -> usize {
        let (woken, hooks) = {
            let mut list = self.list.lock();
            let mut woken = Vec::new();
            while woken.len() < max {
                match list.waiters.pop_front() {
                    Some(waiter) => {
                        waiter.state.store(WAITER_WOKEN, Ordering::Release);
                        woken.push(waiter.tid);
                    }
                    None => break,
                }
            }
            let hooks: Vec<Arc<dyn WakeHook>> =
                list.hooks.iter().map(|(_, hook)| Arc::clone(hook)).collect();
            (woken, hooks)
        };

        if !woken.is_empty() {
            let sched = sched::scheduler();
            for tid in &woken {
                log_trace!("waking thread {} from wait queue", tid);
                sched.unblock(*tid);
            }
        }
        for hook in hooks {
            hook.wake();
        }

        woken.len()
    }

    /// Validate that this is a valid wait queue
    fn validate(&self) {
        debug_assert_eq!(self.magic, WAIT_QUEUE_MAGIC, "invalid wait queue magic");
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WaitQueue").field("waiters", &self.len()).finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

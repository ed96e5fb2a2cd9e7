// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Timer Management
//!
//! Deadline-ordered one-shot callbacks. Wait queues use them for timed
//! waits and the TCP layer uses them for retransmission.
//!
//! # Design
//!
//! - **Deadline ordering**: pending timers live in a `BTreeMap` keyed by
//!   `(deadline, id)`, so equal deadlines fire in insertion order
//! - **Exactly once**: [`TimerQueue::check_timeout`] pops an entry and marks
//!   it firing in the same critical section; a concurrent
//!   [`TimerQueue::remove`] either wins (callback never runs) or waits for
//!   the callback to finish
//! - **Non-blocking callbacks**: callbacks run from the tick with no queue
//!   lock held; they may take spinlocks, wake wait queues and add timers,
//!   but must never sleep
//!
//! # Usage
//!
//! ```text
//! let timer = timers.add(now + ms_to_ns(200), move || flag.store(true, SeqCst));
//! ...
//! if !timers.remove(&timer) {
//!     // already fired
//! }
//! ```

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use crate::kernel::sync::SpinLock;
use crate::rustux::types::{Nanoseconds, INFINITE_TIME};

// Import logging macros
use crate::log_trace;

/// Timer callback
pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Timer states
const TIMER_PENDING: u8 = 0;
const TIMER_FIRING: u8 = 1;
const TIMER_DONE: u8 = 2;

/// ============================================================================
/// Timer
/// ============================================================================

struct TimerEntry {
    deadline: Nanoseconds,
    id: u64,
    state: AtomicU8,
    callback: SpinLock<Option<TimerCallback>>,
}

impl TimerEntry {
    fn key(&self) -> (Nanoseconds, u64) {
        (self.deadline, self.id)
    }
}

/// Handle to an armed timer
///
/// Dropping the handle does not cancel the timer; pass it to
/// [`TimerQueue::remove`] for that.
pub struct Timer {
    entry: Arc<TimerEntry>,
}

impl Timer {
    /// Absolute deadline the timer was armed for
    pub fn deadline(&self) -> Nanoseconds {
        self.entry.deadline
    }

    /// Whether the timer is still waiting to fire
    pub fn is_pending(&self) -> bool {
        self.entry.state.load(Ordering::Acquire) == TIMER_PENDING
    }
}

impl core::fmt::Debug for Timer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.entry.deadline)
            .field("id", &self.entry.id)
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// ============================================================================
/// Timer Queue
/// ============================================================================

/// Deadline-ordered set of pending timers
pub struct TimerQueue {
    pending: SpinLock<BTreeMap<(Nanoseconds, u64), Arc<TimerEntry>>>,

    /// Tie-breaker for equal deadlines
    next_id: AtomicU64,

    /// Set while a `check_timeout` pass is running
    busy: AtomicBool,
}

impl TimerQueue {
    /// Create an empty timer queue
    pub const fn new() -> Self {
        Self {
            pending: SpinLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
            busy: AtomicBool::new(false),
        }
    }

    /// Arm a timer that runs `callback` once `deadline` has passed
    pub fn add<F>(&self, deadline: Nanoseconds, callback: F) -> Timer
    where
        F: FnOnce() + Send + 'static,
    {
        let entry = Arc::new(TimerEntry {
            deadline,
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            state: AtomicU8::new(TIMER_PENDING),
            callback: SpinLock::new(Some(Box::new(callback))),
        });

        self.pending.lock().insert(entry.key(), Arc::clone(&entry));
        log_trace!("timer {} armed for {}", entry.id, deadline);

        Timer { entry }
    }

    /// Cancel a timer
    ///
    /// # Returns
    ///
    /// - `true` if the timer was still pending; its callback will never run
    /// - `false` if it already fired. If the callback is running right now on
    ///   another CPU, this waits for it to finish.
    pub fn remove(&self, timer: &Timer) -> bool {
        let removed = {
            let mut pending = self.pending.lock();
            pending.remove(&timer.entry.key()).is_some()
        };

        if removed {
            timer.entry.state.store(TIMER_DONE, Ordering::Release);
            timer.entry.callback.lock().take();
            log_trace!("timer {} cancelled", timer.entry.id);
            return true;
        }

        while timer.entry.state.load(Ordering::Acquire) == TIMER_FIRING {
            core::hint::spin_loop();
        }
        false
    }

    /// Fire every timer whose deadline is at or before `now`
    ///
    /// Called from the scheduler tick. A pass that finds another pass in
    /// progress returns immediately; the running pass picks up anything that
    /// expired meanwhile.
    ///
    /// # Returns
    ///
    /// Number of callbacks run
    pub fn check_timeout(&self, now: Nanoseconds) -> usize {
        if self.busy.swap(true, Ordering::Acquire) {
            return 0;
        }

        let mut fired = 0;
        loop {
            let entry = {
                let mut pending = self.pending.lock();
                match pending.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= now => {
                        pending.pop_first().map(|(_, entry)| {
                            entry.state.store(TIMER_FIRING, Ordering::Release);
                            entry
                        })
                    }
                    _ => None,
                }
            };

            let Some(entry) = entry else { break };

            let callback = entry.callback.lock().take();
            if let Some(callback) = callback {
                log_trace!("timer {} fired at {}", entry.id, now);
                callback();
                fired += 1;
            }
            entry.state.store(TIMER_DONE, Ordering::Release);
        }

        self.busy.store(false, Ordering::Release);
        fired
    }

    /// Earliest pending deadline, or [`INFINITE_TIME`] if none
    pub fn next_deadline(&self) -> Nanoseconds {
        self.pending
            .lock()
            .first_key_value()
            .map_or(INFINITE_TIME, |(&(deadline, _), _)| deadline)
    }

    /// Number of pending timers
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether no timer is pending
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tests
// ============================================================================

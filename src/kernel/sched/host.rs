// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Hosted Scheduler Backend
//!
//! Maps the scheduler contract onto `std::thread`: every OS thread that
//! touches a blocking primitive gets a [`ThreadId`], `block` parks, and
//! `unblock` unparks. A tick thread fires the timer queue once per
//! millisecond, standing in for the kernel's timer interrupt.
//!
//! Park/unpark already has the token semantics the contract requires: an
//! unpark that arrives before the park makes the park return immediately.

use std::cell::Cell;
use std::collections::BTreeMap;
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use core::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::sched::{Scheduler, ThreadId};
use crate::kernel::sync::SpinLock;
use crate::kernel::timer::TimerQueue;
use crate::rustux::types::Nanoseconds;

// Import logging macros
use crate::log_debug;

/// Period of the emulated timer interrupt
const TICK: Duration = Duration::from_millis(1);

/// Hosted scheduler
pub struct HostScheduler {
    epoch: Instant,
    threads: SpinLock<BTreeMap<ThreadId, Thread>>,
    next_tid: AtomicU64,
    timers: TimerQueue,
}

static INSTANCE: spin::Once<HostScheduler> = spin::Once::new();

/// Per-thread identity; unregisters the thread when it exits
struct ThreadSlot {
    tid: Cell<Option<ThreadId>>,
}

impl Drop for ThreadSlot {
    fn drop(&mut self) {
        if let (Some(tid), Some(sched)) = (self.tid.get(), INSTANCE.get()) {
            sched.threads.lock().remove(&tid);
        }
    }
}

thread_local! {
    static SLOT: ThreadSlot = const { ThreadSlot { tid: Cell::new(None) } };
    static PREEMPT: Cell<u32> = const { Cell::new(0) };
}

impl HostScheduler {
    /// The process-wide hosted scheduler, created (with its tick thread) on
    /// first use
    pub fn get() -> &'static HostScheduler {
        let mut fresh = false;
        let sched = INSTANCE.call_once(|| {
            fresh = true;
            HostScheduler {
                epoch: Instant::now(),
                threads: SpinLock::new(BTreeMap::new()),
                next_tid: AtomicU64::new(1),
                timers: TimerQueue::new(),
            }
        });
        if fresh {
            sched.start_tick();
        }
        sched
    }

    fn start_tick(&'static self) {
        let spawned = thread::Builder::new()
            .name("rxsock-tick".into())
            .spawn(move || loop {
                thread::sleep(TICK);
                self.timers.check_timeout(self.now());
            });
        if let Err(err) = spawned {
            panic!("sched: cannot start tick thread: {}", err);
        }
        log_debug!("sched: hosted backend started");
    }

    fn register_current(&self) -> ThreadId {
        let raw = self.next_tid.fetch_add(1, Ordering::Relaxed);
        let tid = match ThreadId::from_raw(raw) {
            Some(tid) => tid,
            None => panic!("sched: thread id space exhausted"),
        };
        self.threads.lock().insert(tid, thread::current());
        tid
    }
}

impl Scheduler for HostScheduler {
    fn current(&self) -> ThreadId {
        SLOT.with(|slot| match slot.tid.get() {
            Some(tid) => tid,
            None => {
                let tid = self.register_current();
                slot.tid.set(Some(tid));
                tid
            }
        })
    }

    fn block(&self) {
        thread::park();
    }

    fn unblock(&self, tid: ThreadId) {
        let target = self.threads.lock().get(&tid).cloned();
        if let Some(thread) = target {
            thread.unpark();
        }
    }

    fn yield_now(&self) {
        thread::yield_now();
    }

    fn now(&self) -> Nanoseconds {
        self.epoch.elapsed().as_nanos() as Nanoseconds
    }

    fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    fn preempt_disable(&self) {
        let _ = PREEMPT.try_with(|count| count.set(count.get() + 1));
    }

    fn preempt_enable(&self) {
        let _ = PREEMPT.try_with(|count| count.set(count.get().saturating_sub(1)));
    }

    fn preempt_count(&self) -> u32 {
        PREEMPT.try_with(Cell::get).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rustux::types::ms_to_ns;
    use std::sync::Arc;
    use core::sync::atomic::AtomicBool;

    #[test]
    fn test_unblock_before_block_is_not_lost() {
        let sched = HostScheduler::get();
        let me = sched.current();
        sched.unblock(me);
        // Returns immediately thanks to the pending token
        sched.block();
    }

    #[test]
    fn test_tick_fires_timers() {
        let sched = HostScheduler::get();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        sched
            .timers()
            .add(sched.now() + ms_to_ns(2), move || flag.store(true, Ordering::SeqCst));
        let start = Instant::now();
        while !fired.load(Ordering::SeqCst) {
            assert!(start.elapsed() < Duration::from_secs(5), "tick never fired the timer");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_clock_is_monotonic() {
        let sched = HostScheduler::get();
        let a = sched.now();
        thread::sleep(Duration::from_millis(2));
        assert!(sched.now() > a);
    }
}

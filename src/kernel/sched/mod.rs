// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scheduler Interface
//!
//! The socket core does not schedule threads itself. It consumes a small
//! contract from the kernel's scheduler: who is running, park the current
//! thread, make a thread runnable again, and the clock/timer queue that
//! drives deadlines.
//!
//! # Design
//!
//! - **Single installation**: the kernel installs its scheduler once during
//!   boot with [`install`]; hosted builds fall back to [`host`]
//! - **Opaque thread identity**: [`ThreadId`] is a value, never a pointer to
//!   a thread control block, so owner tags cannot dangle
//! - **Spurious wakeups allowed**: [`Scheduler::block`] may return early;
//!   wait queues re-check their waiter state in a loop
//!
//! # Thread States (as seen by the wait queue)
//!
//! ```text
//! Running -> (enqueue on WaitQueue) -> Blocked -> (unblock) -> Ready -> Running
//! ```

use core::fmt;
use core::num::NonZeroU64;

use crate::kernel::timer::TimerQueue;
use crate::rustux::types::{CpuId, Nanoseconds};

#[cfg(any(test, feature = "std"))]
pub mod host;

/// ============================================================================
/// Thread Identity
/// ============================================================================

/// Opaque thread identity used as mutex/rwlock owner tag
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(NonZeroU64);

impl ThreadId {
    /// Build an identity from a raw scheduler id; zero is not a valid id
    pub const fn from_raw(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// Raw scheduler id
    pub const fn as_u64(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Debug for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ThreadId({})", self.0)
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// ============================================================================
/// Scheduler Contract
/// ============================================================================

/// Services the blocking primitives need from the kernel scheduler
pub trait Scheduler: Sync {
    /// Identity of the running thread
    fn current(&self) -> ThreadId;

    /// CPU the caller is running on
    fn current_cpu(&self) -> CpuId {
        0
    }

    /// Suspend the current thread until [`unblock`](Self::unblock) is called
    /// for it. May return spuriously.
    fn block(&self);

    /// Make `tid` runnable. Waking a thread that is not blocked must leave a
    /// token so that its next `block` returns immediately.
    fn unblock(&self, tid: ThreadId);

    /// Give up the CPU voluntarily
    fn yield_now(&self);

    /// Monotonic time
    fn now(&self) -> Nanoseconds;

    /// Timer queue fired from the scheduler tick
    fn timers(&self) -> &TimerQueue;

    /// Disable preemption on the current CPU (nesting)
    fn preempt_disable(&self) {}

    /// Re-enable preemption on the current CPU
    fn preempt_enable(&self) {}

    /// Nesting depth of preempt_disable on the current CPU
    fn preempt_count(&self) -> u32 {
        0
    }
}

static SCHEDULER: spin::Once<&'static dyn Scheduler> = spin::Once::new();

/// Install the kernel scheduler
///
/// Returns false if a scheduler was already installed.
pub fn install(sched: &'static dyn Scheduler) -> bool {
    let mut installed = false;
    SCHEDULER.call_once(|| {
        installed = true;
        sched
    });
    installed
}

/// The installed scheduler
///
/// Hosted builds install the [`host`] backend on first use.
#[cfg(any(test, feature = "std"))]
pub fn scheduler() -> &'static dyn Scheduler {
    *SCHEDULER.call_once(|| host::HostScheduler::get() as &'static dyn Scheduler)
}

/// The installed scheduler
#[cfg(not(any(test, feature = "std")))]
pub fn scheduler() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(sched) => *sched,
        None => crate::kernel::debug::log_fatal(format_args!("sched: no scheduler installed")),
    }
}

/// Scheduler if one is available yet; spinlocks work before installation
#[inline]
fn installed() -> Option<&'static dyn Scheduler> {
    #[cfg(any(test, feature = "std"))]
    {
        Some(scheduler())
    }
    #[cfg(not(any(test, feature = "std")))]
    {
        SCHEDULER.get().copied()
    }
}

/// Identity of the running thread
pub fn current_thread() -> ThreadId {
    scheduler().current()
}

/// CPU the caller is running on (0 before a scheduler is installed)
pub fn current_cpu() -> CpuId {
    installed().map_or(0, |sched| sched.current_cpu())
}

/// Disable preemption on the current CPU
#[inline]
pub fn preempt_disable() {
    if let Some(sched) = installed() {
        sched.preempt_disable();
    }
}

/// Re-enable preemption on the current CPU
#[inline]
pub fn preempt_enable() {
    if let Some(sched) = installed() {
        sched.preempt_enable();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_id_raw() {
        assert!(ThreadId::from_raw(0).is_none());
        let tid = ThreadId::from_raw(42).unwrap();
        assert_eq!(tid.as_u64(), 42);
        assert_eq!(alloc::format!("{}", tid), "42");
    }

    #[test]
    fn test_current_thread_is_stable() {
        let a = current_thread();
        let b = current_thread();
        assert_eq!(a, b);

        let other = std::thread::spawn(current_thread).join().unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_second_install_rejected() {
        // The hosted backend is already (or now) installed
        let _ = scheduler();
        assert!(!install(host::HostScheduler::get()));
    }
}

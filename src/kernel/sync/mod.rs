// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Synchronization Primitives
//!
//! This module provides the primitives every other subsystem blocks and
//! serializes on.
//!
//! # Primitives
//!
//! - **SpinLock**: Busy-wait lock, usable from interrupt context
//! - **WaitQueue**: FIFO queue of threads blocked on a condition
//! - **RefCount**: Atomic counter with a single destroying decrement
//! - **Mutex**: Sleeping lock with owner tracking, optionally recursive
//! - **RwLock**: Sleeping reader/writer lock with writer preference
//!
//! # Lock ordering
//!
//! No global order is enforced. Socket and pipe code holds at most one
//! object mutex at a time and never takes a mutex under a spinlock.

pub mod spin;
pub mod wait_queue;
pub mod refcount;
pub mod mutex;
pub mod rwlock;

// Re-exports
pub use self::spin::{SpinLock, SpinLockGuard, SpinLockIrqGuard};
pub use mutex::{Mutex, MutexFlags, MutexGuard, RawMutex, RecursiveMutex, RecursiveMutexGuard};
pub use refcount::RefCount;
pub use rwlock::{RawRwLock, RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use wait_queue::{HookId, WaitQueue, WakeHook};

/// A lock guard that a wait queue can release and later re-acquire
///
/// [`WaitQueue::wait_until`] takes the caller's guard by value so that
/// "enqueue, release, sleep" is a single operation: the lock is released
/// exactly once, after the waiter is visible to wakers.
pub trait Relock<'a>: Sized {
    /// The lock the guard was taken from
    type Lock: ?Sized + 'a;

    /// Release the lock, returning it for a later [`Relock::relock`]
    fn unlock(self) -> &'a Self::Lock;

    /// Acquire `lock` again
    fn relock(lock: &'a Self::Lock) -> Self;
}

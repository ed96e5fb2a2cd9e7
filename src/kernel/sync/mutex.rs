// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Mutex
//!
//! This module provides sleeping mutual exclusion locks for the Rustux
//! kernel. These mutexes track ownership and park contended callers on a
//! wait queue instead of spinning.
//!
//! # Design
//!
//! - **Ownership tracking**: each mutex knows which thread owns it; the
//!   owner is an opaque [`ThreadId`] compared by value
//! - **Spin first**: an uncontended or briefly-held mutex is taken without
//!   touching the wait queue
//! - **Fair wakeup**: blocked threads are woken in FIFO order, one per
//!   release
//! - **Recursion**: opt-in through [`MutexFlags::RECURSIVE`]; a non-recursive
//!   mutex locked twice by its owner is a fatal self-deadlock
//!
//! # Usage
//!
//! ```text
//! let sock = Mutex::new(SockInner::new());
//!
//! let mut inner = sock.lock();
//! inner.state = State::Connected;
//! // released when `inner` drops
//! ```

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use bitflags::bitflags;

use crate::kernel::debug::log_fatal;
use crate::kernel::sched::{self, ThreadId};
use crate::kernel::sync::{Relock, SpinLock, WaitQueue};
use crate::rustux::errors::Result;
use crate::rustux::types::{Nanoseconds, INFINITE_TIME};

// Import logging macros
use crate::log_trace;

/// Magic number for mutex validation
const MUTEX_MAGIC: u32 = 0x4D555478; // "MUTx" in hex

/// Acquisition attempts before a contended lock goes to sleep
const MUTEX_SPIN_TRIES: usize = 64;

bitflags! {
    /// Mutex behaviour flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MutexFlags: u32 {
        /// The owner may lock again; each lock needs a matching unlock
        const RECURSIVE = 1 << 0;
    }
}

/// ============================================================================
/// Raw Mutex
/// ============================================================================

#[derive(Debug)]
struct MutexState {
    owner: Option<ThreadId>,
    depth: usize,
}

enum Grab {
    Acquired,
    Busy,
    SelfDeadlock,
}

/// Mutex without protected data
///
/// Locking and unlocking are explicit calls, so the raw mutex can guard
/// state that is not stored inside it.
pub struct RawMutex {
    state: SpinLock<MutexState>,
    waiters: WaitQueue,
    flags: MutexFlags,

    /// Magic number for validation
    magic: u32,
}

impl RawMutex {
    /// Create a new, unlocked mutex
    pub fn new(flags: MutexFlags) -> Self {
        Self {
            state: SpinLock::new(MutexState {
                owner: None,
                depth: 0,
            }),
            waiters: WaitQueue::new(),
            flags,
            magic: MUTEX_MAGIC,
        }
    }

    /// Destroy a mutex
    ///
    /// Panics if the mutex is locked or has waiters.
    pub fn destroy(&self) {
        self.validate();

        if let Some(owner) = self.state.lock().owner {
            log_fatal(format_args!(
                "mutex_destroy: tried to destroy mutex held by thread {}",
                owner
            ));
        }
        self.waiters.destroy();
    }

    /// Acquire the mutex, blocking until it is available
    pub fn lock(&self) {
        // Only an interrupt can end an unbounded wait early; mutex
        // acquisition is not interruptible, so go back to sleep.
        while self.lock_until(INFINITE_TIME).is_err() {}
    }

    /// Acquire the mutex, giving up at `deadline`
    ///
    /// # Returns
    ///
    /// - `Err(Error::TimedOut)` if the deadline passed first
    /// - `Err(Error::Interrupted)` if the wait was interrupted
    pub fn lock_until(&self, deadline: Nanoseconds) -> Result {
        self.validate();
        let me = sched::current_thread();

        for _ in 0..MUTEX_SPIN_TRIES {
            match self.grab(&mut self.state.lock(), me) {
                Grab::Acquired => return Ok(()),
                Grab::SelfDeadlock => self.self_deadlock(me),
                Grab::Busy => core::hint::spin_loop(),
            }
        }

        log_trace!("thread {} blocking on mutex", me);
        let state = self.state.lock();
        let state = self.waiters.wait_until(state, deadline, |st| {
            match self.grab(st, me) {
                Grab::Acquired => true,
                Grab::Busy => false,
                Grab::SelfDeadlock => self.self_deadlock(me),
            }
        })?;
        drop(state);
        Ok(())
    }

    /// Try to acquire the mutex without blocking
    ///
    /// A non-recursive mutex already held by the caller reports failure
    /// rather than deadlocking.
    pub fn try_lock(&self) -> bool {
        self.validate();
        let me = sched::current_thread();
        matches!(self.grab(&mut self.state.lock(), me), Grab::Acquired)
    }

    /// Release the mutex
    ///
    /// Panics if the current thread doesn't own the mutex. For a recursive
    /// mutex only the last unlock releases it and wakes a waiter.
    pub fn unlock(&self) {
        self.validate();
        let me = sched::current_thread();

        let released = {
            let mut st = self.state.lock();
            if st.owner != Some(me) {
                log_fatal(format_args!(
                    "mutex_release: thread {} tried to release mutex owned by {:?}",
                    me, st.owner
                ));
            }
            st.depth -= 1;
            if st.depth == 0 {
                st.owner = None;
                true
            } else {
                false
            }
        };

        if released {
            self.waiters.wake_one();
        }
    }

    /// Check if the mutex is currently locked
    pub fn is_locked(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    /// Get the owner thread ID
    ///
    /// Returns None if unlocked.
    pub fn owner(&self) -> Option<ThreadId> {
        self.state.lock().owner
    }

    /// Whether the calling thread owns the mutex
    pub fn held_by_current(&self) -> bool {
        self.owner() == Some(sched::current_thread())
    }

    /// Recursion depth of the current owner (0 when unlocked)
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// Behaviour flags the mutex was created with
    pub fn flags(&self) -> MutexFlags {
        self.flags
    }

    fn grab(&self, st: &mut MutexState, me: ThreadId) -> Grab {
        match st.owner {
            None => {
                st.owner = Some(me);
                st.depth = 1;
                Grab::Acquired
            }
            Some(owner) if owner == me => {
                if self.flags.contains(MutexFlags::RECURSIVE) {
                    st.depth += 1;
                    Grab::Acquired
                } else {
                    Grab::SelfDeadlock
                }
            }
            Some(_) => Grab::Busy,
        }
    }

    fn self_deadlock(&self, me: ThreadId) -> ! {
        log_fatal(format_args!(
            "mutex_acquire: thread {} tried to acquire non-recursive mutex it already owns",
            me
        ))
    }

    /// Validate that this is a valid mutex
    fn validate(&self) {
        debug_assert_eq!(self.magic, MUTEX_MAGIC, "invalid mutex magic");
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new(MutexFlags::empty())
    }
}

impl core::fmt::Debug for RawMutex {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("RawMutex")
            .field("owner", &st.owner)
            .field("depth", &st.depth)
            .field("flags", &self.flags)
            .finish()
    }
}

/// ============================================================================
/// Mutex
/// ============================================================================

/// Sleeping lock protecting a value
pub struct Mutex<T: ?Sized> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new, unlocked mutex
    pub fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(MutexFlags::empty()),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the mutex, returning the protected data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the mutex
    ///
    /// Blocks the current thread until the mutex is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard { mutex: self, _not_send: PhantomData }
    }

    /// Acquire the mutex, giving up at `deadline`
    pub fn lock_until(&self, deadline: Nanoseconds) -> Result<MutexGuard<'_, T>> {
        self.raw.lock_until(deadline)?;
        Ok(MutexGuard { mutex: self, _not_send: PhantomData })
    }

    /// Try to acquire the mutex without blocking
    ///
    /// Returns Some(guard) if acquired, None if already locked.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(MutexGuard { mutex: self, _not_send: PhantomData })
        } else {
            None
        }
    }

    /// Check if the mutex is currently locked
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    /// Mutable access without locking; `&mut self` proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Panics if the mutex is locked or has waiters
    pub fn destroy(&self) {
        self.raw.destroy();
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: ?Sized + core::fmt::Debug> core::fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.write_str("Mutex { <locked> }"),
        }
    }
}

/// RAII guard for a mutex
///
/// Automatically releases the mutex when dropped.
pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
    /// Unlock must run on the owning thread
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// The mutex this guard was taken from
    pub fn mutex(guard: &Self) -> &'a Mutex<T> {
        guard.mutex
    }
}

impl<'a, T: ?Sized> Deref for MutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the mutex is held
        unsafe { &*self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for MutexGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the mutex is held, and non-recursive
        // mutexes hand out a single guard
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for MutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

impl<'a, T: ?Sized + 'a> Relock<'a> for MutexGuard<'a, T> {
    type Lock = Mutex<T>;

    fn unlock(self) -> &'a Mutex<T> {
        let mutex = self.mutex;
        drop(self);
        mutex
    }

    fn relock(lock: &'a Mutex<T>) -> Self {
        lock.lock()
    }
}

/// ============================================================================
/// Recursive Mutex
/// ============================================================================

/// Mutex the owner may lock repeatedly
///
/// Several guards can be live on the owning thread at once, so they only
/// hand out shared references; use interior mutability for writes.
pub struct RecursiveMutex<T: ?Sized> {
    raw: RawMutex,
    data: T,
}

unsafe impl<T: ?Sized + Send> Send for RecursiveMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for RecursiveMutex<T> {}

impl<T> RecursiveMutex<T> {
    /// Create a new, unlocked recursive mutex
    pub fn new(data: T) -> Self {
        Self {
            raw: RawMutex::new(MutexFlags::RECURSIVE),
            data,
        }
    }
}

impl<T: ?Sized> RecursiveMutex<T> {
    /// Acquire the mutex, or deepen the caller's hold on it
    pub fn lock(&self) -> RecursiveMutexGuard<'_, T> {
        self.raw.lock();
        RecursiveMutexGuard { mutex: self, _not_send: PhantomData }
    }

    /// Try to acquire the mutex without blocking
    pub fn try_lock(&self) -> Option<RecursiveMutexGuard<'_, T>> {
        if self.raw.try_lock() {
            Some(RecursiveMutexGuard { mutex: self, _not_send: PhantomData })
        } else {
            None
        }
    }

    /// Current recursion depth (0 when unlocked)
    pub fn depth(&self) -> usize {
        self.raw.depth()
    }

    /// Check if the mutex is currently locked
    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }
}

/// RAII guard for a recursive mutex
pub struct RecursiveMutexGuard<'a, T: ?Sized> {
    mutex: &'a RecursiveMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for RecursiveMutexGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.mutex.data
    }
}

impl<'a, T: ?Sized> Drop for RecursiveMutexGuard<'a, T> {
    fn drop(&mut self) {
        self.mutex.raw.unlock();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rustux::errors::Error;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_mutex_new() {
        let mutex = RawMutex::default();
        assert!(!mutex.is_locked());
        assert!(mutex.owner().is_none());
        assert_eq!(mutex.magic, MUTEX_MAGIC);
    }

    #[test]
    fn test_mutex_try_lock() {
        let mutex = RawMutex::default();

        // First lock should succeed
        assert!(mutex.try_lock());
        assert!(mutex.is_locked());
        assert!(mutex.held_by_current());

        // Second lock should fail without deadlocking
        assert!(!mutex.try_lock());

        // Unlock
        mutex.unlock();
        assert!(!mutex.is_locked());
        mutex.destroy();
    }

    #[test]
    fn test_mutex_guard_data() {
        let mutex = Mutex::new(vec![1, 2]);
        mutex.lock().push(3);
        assert_eq!(*mutex.lock(), vec![1, 2, 3]);
        assert!(!mutex.is_locked());
        assert_eq!(mutex.into_inner(), vec![1, 2, 3]);
    }

    #[test]
    fn test_mutex_blocks_other_thread() {
        let mutex = Arc::new(Mutex::new(0u32));
        let guard = mutex.lock();

        let other = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let mut value = mutex.lock();
                *value += 1;
            })
        };

        thread::sleep(Duration::from_millis(20));
        assert!(!other.is_finished());
        drop(guard);
        other.join().unwrap();
        assert_eq!(*mutex.lock(), 1);
    }

    #[test]
    fn test_mutex_lock_until_times_out() {
        let mutex = Arc::new(Mutex::new(()));
        let _guard = mutex.lock();

        let res = {
            let mutex = Arc::clone(&mutex);
            thread::spawn(move || {
                let deadline = sched::scheduler().now() + crate::rustux::types::ms_to_ns(10);
                mutex.lock_until(deadline).map(|_| ())
            })
            .join()
            .unwrap()
        };
        assert_eq!(res, Err(Error::TimedOut));
    }

    #[test]
    fn test_recursive_mutex_needs_matching_unlocks() {
        let mutex = Arc::new(RecursiveMutex::new(AtomicUsize::new(0)));
        let outer = mutex.lock();
        let inner = mutex.lock();
        assert_eq!(mutex.depth(), 2);

        let acquired = Arc::new(AtomicUsize::new(0));
        let other = {
            let (mutex, acquired) = (Arc::clone(&mutex), Arc::clone(&acquired));
            thread::spawn(move || {
                let guard = mutex.lock();
                guard.fetch_add(1, Ordering::SeqCst);
                acquired.store(1, Ordering::SeqCst);
            })
        };

        drop(inner);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(acquired.load(Ordering::SeqCst), 0, "released after one unlock");
        assert_eq!(mutex.depth(), 1);

        drop(outer);
        other.join().unwrap();
        assert_eq!(acquired.load(Ordering::SeqCst), 1);
        assert_eq!(mutex.lock().load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "already owns")]
    fn test_mutex_self_deadlock_is_fatal() {
        let mutex = RawMutex::default();
        mutex.lock();
        mutex.lock();
    }

    #[test]
    #[should_panic(expected = "mutex_release")]
    fn test_mutex_unlock_by_non_owner_is_fatal() {
        let mutex = RawMutex::default();
        mutex.unlock();
    }

    #[test]
    #[should_panic(expected = "mutex_destroy")]
    fn test_mutex_destroy_locked_is_fatal() {
        let mutex = RawMutex::default();
        mutex.lock();
        mutex.destroy();
    }
}

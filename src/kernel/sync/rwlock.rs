// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reader/Writer Lock
//!
//! A sleeping lock admitting any number of readers or one writer.
//!
//! # Design
//!
//! - **Writer preference**: once a writer is queued, newly arriving readers
//!   block behind it, so a steady stream of readers cannot starve writers
//! - **Two queues**: readers and writers sleep on separate wait queues; the
//!   last reader out wakes one writer, a departing writer hands off to the
//!   next writer if one is queued and otherwise wakes every reader
//! - **Self-tracking unlock**: [`RawRwLock::unlock`] works out from the lock
//!   state whether the caller held it shared or exclusive
//!
//! Read locks are not recursive: a reader that read-locks again while a
//! writer is queued deadlocks against that writer.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};

use crate::kernel::debug::log_fatal;
use crate::kernel::sched::{self, ThreadId};
use crate::kernel::sync::{SpinLock, WaitQueue};
use crate::rustux::errors::Result;
use crate::rustux::types::{Nanoseconds, INFINITE_TIME};

/// Magic number for rwlock validation
const RWLOCK_MAGIC: u32 = 0x52574C4B; // "RWLK" in hex

#[derive(Debug, Default)]
struct RwState {
    /// Active readers
    readers: usize,

    /// Thread holding the lock exclusively
    writer: Option<ThreadId>,

    /// Writers blocked in `wrlock`
    writers_waiting: usize,
}

impl RwState {
    fn read_admissible(&self) -> bool {
        self.writer.is_none() && self.writers_waiting == 0
    }

    fn write_admissible(&self) -> bool {
        self.writer.is_none() && self.readers == 0
    }
}

/// ============================================================================
/// Raw RwLock
/// ============================================================================

/// Reader/writer lock without protected data
pub struct RawRwLock {
    state: SpinLock<RwState>,
    readers_q: WaitQueue,
    writers_q: WaitQueue,

    /// Magic number for validation
    magic: u32,
}

impl RawRwLock {
    /// Create a new, free lock
    pub fn new() -> Self {
        Self {
            state: SpinLock::new(RwState::default()),
            readers_q: WaitQueue::new(),
            writers_q: WaitQueue::new(),
            magic: RWLOCK_MAGIC,
        }
    }

    /// Acquire a shared hold, blocking while a writer holds or waits
    pub fn rdlock(&self) {
        while self.rdlock_until(INFINITE_TIME).is_err() {}
    }

    /// Acquire a shared hold, giving up at `deadline`
    pub fn rdlock_until(&self, deadline: Nanoseconds) -> Result {
        self.validate();

        let st = self.state.lock();
        let st = self.readers_q.wait_until(st, deadline, |st| {
            if st.read_admissible() {
                st.readers += 1;
                true
            } else {
                false
            }
        })?;
        drop(st);
        Ok(())
    }

    /// Acquire a shared hold without blocking
    pub fn try_rdlock(&self) -> bool {
        self.validate();

        let mut st = self.state.lock();
        if st.read_admissible() {
            st.readers += 1;
            true
        } else {
            false
        }
    }

    /// Acquire the lock exclusively, blocking while it is held
    pub fn wrlock(&self) {
        while self.wrlock_until(INFINITE_TIME).is_err() {}
    }

    /// Acquire the lock exclusively, giving up at `deadline`
    pub fn wrlock_until(&self, deadline: Nanoseconds) -> Result {
        self.validate();
        let me = sched::current_thread();

        let mut st = self.state.lock();
        if st.writer == Some(me) {
            drop(st);
            log_fatal(format_args!("rwlock: thread {} write-locked twice", me));
        }
        if st.write_admissible() {
            st.writer = Some(me);
            return Ok(());
        }

        st.writers_waiting += 1;
        let res = self.writers_q.wait_until(st, deadline, |st| {
            if st.write_admissible() {
                st.writer = Some(me);
                st.writers_waiting -= 1;
                true
            } else {
                false
            }
        });

        match res {
            Ok(_) => Ok(()),
            Err(err) => {
                // Withdraw; readers held back for us may now proceed
                let wake_readers = {
                    let mut st = self.state.lock();
                    st.writers_waiting -= 1;
                    st.read_admissible()
                };
                if wake_readers {
                    self.readers_q.wake_all();
                }
                Err(err)
            }
        }
    }

    /// Acquire the lock exclusively without blocking
    pub fn try_wrlock(&self) -> bool {
        self.validate();
        let me = sched::current_thread();

        let mut st = self.state.lock();
        if st.write_admissible() {
            st.writer = Some(me);
            true
        } else {
            false
        }
    }

    /// Release a shared hold
    pub fn rdunlock(&self) {
        self.validate();

        let wake_writer = {
            let mut st = self.state.lock();
            if st.readers == 0 {
                drop(st);
                log_fatal(format_args!("rwlock: read unlock without readers"));
            }
            st.readers -= 1;
            st.readers == 0 && st.writers_waiting > 0
        };

        if wake_writer {
            self.writers_q.wake_one();
        }
    }

    /// Release an exclusive hold
    pub fn wrunlock(&self) {
        self.validate();
        let me = sched::current_thread();

        let next_writer = {
            let mut st = self.state.lock();
            if st.writer != Some(me) {
                let owner = st.writer;
                drop(st);
                log_fatal(format_args!(
                    "rwlock: thread {} write-unlocked lock held by {:?}",
                    me, owner
                ));
            }
            st.writer = None;
            st.writers_waiting > 0
        };

        if next_writer {
            self.writers_q.wake_one();
        } else {
            self.readers_q.wake_all();
        }
    }

    /// Release whichever hold the caller has
    pub fn unlock(&self) {
        let writer = self.state.lock().writer;
        if writer.is_some() && writer == Some(sched::current_thread()) {
            self.wrunlock();
        } else {
            self.rdunlock();
        }
    }

    /// Number of active readers
    pub fn readers(&self) -> usize {
        self.state.lock().readers
    }

    /// Thread holding the lock exclusively
    pub fn writer(&self) -> Option<ThreadId> {
        self.state.lock().writer
    }

    /// Number of writers queued
    pub fn writers_waiting(&self) -> usize {
        self.state.lock().writers_waiting
    }

    /// Validate that this is a valid rwlock
    fn validate(&self) {
        debug_assert_eq!(self.magic, RWLOCK_MAGIC, "invalid rwlock magic");
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for RawRwLock {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let st = self.state.lock();
        f.debug_struct("RawRwLock")
            .field("readers", &st.readers)
            .field("writer", &st.writer)
            .field("writers_waiting", &st.writers_waiting)
            .finish()
    }
}

/// ============================================================================
/// RwLock
/// ============================================================================

/// Reader/writer lock protecting a value
pub struct RwLock<T: ?Sized> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Create a new, free lock
    pub fn new(data: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the protected data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized> RwLock<T> {
    /// Shared access
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.raw.rdlock();
        RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Shared access without blocking
    pub fn try_read(&self) -> Option<RwLockReadGuard<'_, T>> {
        if self.raw.try_rdlock() {
            Some(RwLockReadGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Exclusive access
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.raw.wrlock();
        RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Exclusive access without blocking
    pub fn try_write(&self) -> Option<RwLockWriteGuard<'_, T>> {
        if self.raw.try_wrlock() {
            Some(RwLockWriteGuard {
                lock: self,
                _not_send: PhantomData,
            })
        } else {
            None
        }
    }

    /// Mutable access without locking; `&mut self` proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}

impl<T: Default> Default for RwLock<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Shared guard for an [`RwLock`]
pub struct RwLockReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for RwLockReadGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: readers only get shared references
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockReadGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.rdunlock();
    }
}

/// Exclusive guard for an [`RwLock`]
pub struct RwLockWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> Deref for RwLockWriteGuard<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive access
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> DerefMut for RwLockWriteGuard<'a, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive access
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized> Drop for RwLockWriteGuard<'a, T> {
    fn drop(&mut self) {
        self.lock.raw.wrunlock();
    }
}

// ============================================================================
// Tests
// ============================================================================

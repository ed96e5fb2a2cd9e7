// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Spinlock Implementation
//!
//! This module provides the kernel spinlock. Spinlocks are used when the
//! expected wait time is very short, and they are the only lock an interrupt
//! handler may take.
//!
//! # Rules
//!
//! - Never block (mutex, wait queue, socket I/O) while holding a spinlock.
//!   The wait-queue sleep path checks the preemption count and treats a held
//!   spinlock as a fatal ordering violation.
//! - Critical sections are O(1). There is no fairness beyond eventual
//!   acquisition.
//! - Use [`SpinLock::lock_irqsave`] for data shared with interrupt handlers.

use core::cell::UnsafeCell;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use spin::relax::{RelaxStrategy, Spin};

use crate::kernel::arch::{self, IrqState};
use crate::kernel::sched;
use crate::kernel::sync::Relock;
use crate::rustux::types::CpuId;

/// Owner value while the lock is free
const NO_CPU: CpuId = CpuId::MAX;

/// A busy-waiting mutual exclusion lock
///
/// `R` selects what the CPU does between acquisition attempts; the default
/// issues the architecture's spin-loop hint.
pub struct SpinLock<T: ?Sized, R = Spin> {
    locked: AtomicBool,
    /// CPU holding the lock, for debugging
    owner_cpu: AtomicU32,
    _relax: PhantomData<fn() -> R>,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send, R> Send for SpinLock<T, R> {}
unsafe impl<T: ?Sized + Send, R> Sync for SpinLock<T, R> {}

impl<T> SpinLock<T> {
    /// Create a new, unlocked spinlock
    pub const fn new(data: T) -> Self {
        Self::with_relax(data)
    }
}

impl<T, R> SpinLock<T, R> {
    /// Create a new, unlocked spinlock with a custom relax strategy
    pub const fn with_relax(data: T) -> Self {
        Self {
            locked: AtomicBool::new(false),
            owner_cpu: AtomicU32::new(NO_CPU),
            _relax: PhantomData,
            data: UnsafeCell::new(data),
        }
    }

    /// Consume the lock, returning the protected data
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: ?Sized, R: RelaxStrategy> SpinLock<T, R> {
    /// Acquire the lock, spinning until it becomes available
    ///
    /// Preemption is disabled on the current CPU until the guard drops.
    pub fn lock(&self) -> SpinLockGuard<'_, T, R> {
        sched::preempt_disable();
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            // Spin on a plain load to keep the cache line shared
            while self.locked.load(Ordering::Relaxed) {
                R::relax();
            }
        }
        self.owner_cpu.store(sched::current_cpu(), Ordering::Relaxed);
        SpinLockGuard { lock: self }
    }

    /// Try to acquire the lock without spinning
    pub fn try_lock(&self) -> Option<SpinLockGuard<'_, T, R>> {
        sched::preempt_disable();
        if self
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            self.owner_cpu.store(sched::current_cpu(), Ordering::Relaxed);
            Some(SpinLockGuard { lock: self })
        } else {
            sched::preempt_enable();
            None
        }
    }

    /// Disable local interrupts, then acquire the lock
    ///
    /// The previous interrupt state is restored after the lock is released.
    pub fn lock_irqsave(&self) -> SpinLockIrqGuard<'_, T, R> {
        let irq = arch::irq_save();
        SpinLockIrqGuard {
            guard: core::mem::ManuallyDrop::new(self.lock()),
            irq,
        }
    }
}

impl<T: ?Sized, R> SpinLock<T, R> {
    /// Whether some CPU currently holds the lock
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }

    /// CPU currently holding the lock, if any
    pub fn holder_cpu(&self) -> Option<CpuId> {
        match self.owner_cpu.load(Ordering::Relaxed) {
            NO_CPU => None,
            cpu => Some(cpu),
        }
    }

    /// Mutable access without locking; `&mut self` proves exclusivity
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    fn release(&self) {
        self.owner_cpu.store(NO_CPU, Ordering::Relaxed);
        self.locked.store(false, Ordering::Release);
        sched::preempt_enable();
    }
}

impl<T: Default, R> Default for SpinLock<T, R> {
    fn default() -> Self {
        Self::with_relax(T::default())
    }
}

impl<T: ?Sized + core::fmt::Debug, R: RelaxStrategy> core::fmt::Debug for SpinLock<T, R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("SpinLock").field("data", &&*guard).finish(),
            None => f.write_str("SpinLock { <locked> }"),
        }
    }
}

/// RAII guard for a SpinLock
pub struct SpinLockGuard<'a, T: ?Sized, R = Spin> {
    lock: &'a SpinLock<T, R>,
}

impl<'a, T: ?Sized, R> Drop for SpinLockGuard<'a, T, R> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

impl<'a, T: ?Sized, R> Deref for SpinLockGuard<'a, T, R> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: the guard proves the lock is held
        unsafe { &*self.lock.data.get() }
    }
}

impl<'a, T: ?Sized, R> DerefMut for SpinLockGuard<'a, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves the lock is held
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<'a, T: ?Sized + 'a, R: RelaxStrategy + 'a> Relock<'a> for SpinLockGuard<'a, T, R> {
    type Lock = SpinLock<T, R>;

    fn unlock(self) -> &'a SpinLock<T, R> {
        let lock = self.lock;
        drop(self);
        lock
    }

    fn relock(lock: &'a SpinLock<T, R>) -> Self {
        lock.lock()
    }
}

/// Guard returned by [`SpinLock::lock_irqsave`]
pub struct SpinLockIrqGuard<'a, T: ?Sized, R = Spin> {
    guard: core::mem::ManuallyDrop<SpinLockGuard<'a, T, R>>,
    irq: IrqState,
}

impl<'a, T: ?Sized, R> Drop for SpinLockIrqGuard<'a, T, R> {
    fn drop(&mut self) {
        // SAFETY: dropped exactly once, here
        unsafe { core::mem::ManuallyDrop::drop(&mut self.guard) };
        arch::irq_restore(self.irq);
    }
}

impl<'a, T: ?Sized, R> Deref for SpinLockIrqGuard<'a, T, R> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<'a, T: ?Sized, R> DerefMut for SpinLockIrqGuard<'a, T, R> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

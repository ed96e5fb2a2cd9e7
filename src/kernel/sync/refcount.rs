// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Reference Counting
//!
//! An atomic open count for shared kernel objects. The creator starts the
//! count at 1, every new holder increments it, and the decrement that
//! observes the transition to zero is the unique trigger for destruction.
//!
//! All operations are lock-free. Counting below zero, or taking a new
//! reference on an object whose count already reached zero, are consistency
//! violations and halt the subsystem.

use core::sync::atomic::{fence, AtomicUsize, Ordering};

use crate::kernel::debug::log_fatal;

/// Atomic reference count
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// Create a counter holding `n` references
    pub const fn new(n: usize) -> Self {
        Self {
            count: AtomicUsize::new(n),
        }
    }

    /// Reset the counter to `n`
    ///
    /// Only valid while the owner still has exclusive access to the object.
    pub fn init(&self, n: usize) {
        self.count.store(n, Ordering::Release);
    }

    /// Take a reference, returning the new count
    pub fn inc(&self) -> usize {
        let old = self.count.fetch_add(1, Ordering::Relaxed);
        if old == 0 {
            log_fatal(format_args!("refcount: inc on a released object"));
        }
        old + 1
    }

    /// Take a reference unless the count already dropped to zero
    ///
    /// Used by lookups that race with the final release.
    pub fn try_inc(&self) -> bool {
        let mut cur = self.count.load(Ordering::Relaxed);
        loop {
            if cur == 0 {
                return false;
            }
            match self.count.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(seen) => cur = seen,
            }
        }
    }

    /// Drop a reference, returning the new count
    ///
    /// A return value of zero means the caller must destroy the object.
    pub fn dec(&self) -> usize {
        let old = self.count.fetch_sub(1, Ordering::Release);
        if old == 0 {
            log_fatal(format_args!("refcount: underflow"));
        }
        if old == 1 {
            // Order the destroyer after every other holder's last access
            fence(Ordering::Acquire);
        }
        old - 1
    }

    /// Current count
    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_refcount_basic() {
        let rc = RefCount::new(1);
        assert_eq!(rc.inc(), 2);
        assert_eq!(rc.get(), 2);
        assert_eq!(rc.dec(), 1);
        assert_eq!(rc.dec(), 0);
        assert!(!rc.try_inc());
        rc.init(3);
        assert_eq!(rc.get(), 3);
    }

    #[test]
    #[should_panic(expected = "refcount: underflow")]
    fn test_refcount_underflow_is_fatal() {
        let rc = RefCount::new(1);
        rc.dec();
        rc.dec();
    }

    #[test]
    #[should_panic(expected = "released object")]
    fn test_refcount_resurrect_is_fatal() {
        let rc = RefCount::new(0);
        rc.inc();
    }

    #[test]
    fn test_refcount_destroyed_exactly_once() {
        use rand::Rng;

        for _ in 0..20 {
            let rc = Arc::new(RefCount::new(1));
            let destroyed = Arc::new(AtomicUsize::new(0));
            let holders = rand::thread_rng().gen_range(2..8);

            // The creator's reference goes to the first thread; hand out one
            // more per remaining thread before any of them can drop.
            for _ in 1..holders {
                rc.inc();
            }
            let handles: Vec<_> = (0..holders)
                .map(|_| {
                    let rc = Arc::clone(&rc);
                    let destroyed = Arc::clone(&destroyed);
                    thread::spawn(move || {
                        let extra = rand::thread_rng().gen_range(0..50);
                        for _ in 0..extra {
                            rc.inc();
                            if rc.dec() == 0 {
                                destroyed.fetch_add(1, Ordering::SeqCst);
                            }
                        }
                        if rc.dec() == 0 {
                            destroyed.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(destroyed.load(Ordering::SeqCst), 1);
            assert_eq!(rc.get(), 0);
        }
    }
}

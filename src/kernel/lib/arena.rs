// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Fixed-Object Pool
//!
//! Bounded allocator for one kind of kernel object (sockets, pipes,
//! Unix-domain listener state). A pool is an explicitly constructed value
//! owned by the subsystem that allocates from it, so its initialization
//! order is visible and tests can build private pools.
//!
//! # Design
//!
//! - **Bounded**: at most `limit` objects are live; the next allocation
//!   fails with `NoMemory`
//! - **Slot tokens**: every object carries the [`PoolSlot`] it was
//!   allocated with; the slot returns to the pool when the object is
//!   destroyed, which for refcounted objects is the final release
//! - **Zero fill**: [`ObjectPool::alloc_zeroed`] builds the object from
//!   `Default`, the analogue of a zero-filled allocation

use alloc::sync::Arc;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};

use crate::rustux::errors::{Error, Result};

// Import logging macros
use crate::{log_debug, log_info};

#[derive(Debug)]
struct PoolCounters {
    name: &'static str,
    limit: usize,
    allocated: AtomicUsize,
    high_water: AtomicUsize,
}

/// Proof that an object occupies one pool slot
///
/// Dropping the slot frees it.
#[derive(Debug)]
pub struct PoolSlot {
    counters: Arc<PoolCounters>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.counters.allocated.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Bounded pool of `T` objects
pub struct ObjectPool<T> {
    counters: Arc<PoolCounters>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> ObjectPool<T> {
    /// Create a pool
    ///
    /// # Arguments
    ///
    /// * `name` - Pool name, used in diagnostics
    /// * `limit` - Maximum number of live objects (must be > 0)
    pub fn new(name: &'static str, limit: usize) -> Result<Self> {
        if limit == 0 {
            return Err(Error::InvalidArgs);
        }

        log_debug!("pool '{}': limit {}", name, limit);

        Ok(Self {
            counters: Arc::new(PoolCounters {
                name,
                limit,
                allocated: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
            }),
            _marker: PhantomData,
        })
    }

    /// Reserve a slot without building an object yet
    pub fn reserve(&self) -> Result<PoolSlot> {
        let c = &self.counters;
        let mut cur = c.allocated.load(Ordering::Relaxed);
        loop {
            if cur >= c.limit {
                log_debug!("pool '{}': exhausted ({} live)", c.name, cur);
                return Err(Error::NoMemory);
            }
            match c.allocated.compare_exchange_weak(
                cur,
                cur + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(seen) => cur = seen,
            }
        }
        c.high_water.fetch_max(cur + 1, Ordering::Relaxed);

        Ok(PoolSlot {
            counters: Arc::clone(&self.counters),
        })
    }

    /// Allocate an object; `init` receives the slot to store in it
    pub fn alloc<F>(&self, init: F) -> Result<Arc<T>>
    where
        F: FnOnce(PoolSlot) -> T,
    {
        let slot = self.reserve()?;
        Ok(Arc::new(init(slot)))
    }

    /// Get current allocation count
    pub fn allocated_count(&self) -> usize {
        self.counters.allocated.load(Ordering::Acquire)
    }

    /// Most objects ever live at once
    pub fn high_water(&self) -> usize {
        self.counters.high_water.load(Ordering::Relaxed)
    }

    /// Maximum number of live objects
    pub fn limit(&self) -> usize {
        self.counters.limit
    }

    /// Pool name
    pub fn name(&self) -> &'static str {
        self.counters.name
    }

    /// Dump pool information
    pub fn dump(&self) {
        log_info!(
            "pool '{}': {} of {} live, high water {}",
            self.name(),
            self.allocated_count(),
            self.limit(),
            self.high_water()
        );
    }
}

impl<T: Default> ObjectPool<T> {
    /// Allocate a default-initialized object together with its slot
    pub fn alloc_zeroed(&self) -> Result<(Arc<T>, PoolSlot)> {
        let slot = self.reserve()?;
        Ok((Arc::new(T::default()), slot))
    }
}

impl<T> core::fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.counters.name)
            .field("limit", &self.counters.limit)
            .field("allocated", &self.allocated_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    struct Obj {
        value: u32,
        _slot: PoolSlot,
    }

    #[test]
    fn test_pool_invalid_args() {
        assert_eq!(ObjectPool::<Obj>::new("zero", 0).err(), Some(Error::InvalidArgs));
    }

    #[test]
    fn test_pool_limit_and_release() {
        let pool = ObjectPool::new("objs", 2).unwrap();
        let a = pool.alloc(|slot| Obj { value: 1, _slot: slot }).unwrap();
        let b = pool.alloc(|slot| Obj { value: 2, _slot: slot }).unwrap();
        assert_eq!(a.value + b.value, 3);
        assert_eq!(pool.allocated_count(), 2);

        assert_eq!(
            pool.alloc(|slot| Obj { value: 3, _slot: slot }).err(),
            Some(Error::NoMemory)
        );

        // A second holder keeps the slot busy until the last reference goes
        let a2 = Arc::clone(&a);
        drop(a);
        assert_eq!(pool.allocated_count(), 2);
        drop(a2);
        assert_eq!(pool.allocated_count(), 1);
        assert!(pool.alloc(|slot| Obj { value: 4, _slot: slot }).is_ok());
        assert_eq!(pool.high_water(), 2);
    }

    #[test]
    fn test_pool_alloc_zeroed() {
        let pool: ObjectPool<u64> = ObjectPool::new("words", 1).unwrap();
        let (word, slot) = pool.alloc_zeroed().unwrap();
        assert_eq!(*word, 0);
        assert!(pool.alloc_zeroed().is_err());
        drop(slot);
        assert!(pool.alloc_zeroed().is_ok());
    }

    #[test]
    fn test_pool_concurrent_reserve_respects_limit() {
        let pool = Arc::new(ObjectPool::<()>::new("race", 8).unwrap());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                thread::spawn(move || pool.reserve().ok())
            })
            .collect();
        let slots: Vec<_> = handles.into_iter().filter_map(|h| h.join().unwrap()).collect();
        assert_eq!(slots.len(), 8);
        assert_eq!(pool.allocated_count(), 8);
        drop(slots);
        assert_eq!(pool.allocated_count(), 0);
    }
}

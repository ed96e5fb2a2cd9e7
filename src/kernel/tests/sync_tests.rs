// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Sync Tests
//!
//! Contention stress for the sleeping locks. Threads yield at random points
//! inside critical sections to widen the race windows.

use std::sync::Arc;
use std::thread;

use alloc::vec::Vec;
use rand::{thread_rng, Rng};

use crate::kernel::sync::{Mutex, RwLock};

const THREADS: usize = 8;
const ITERATIONS: usize = 1000;

// ============================================================================
// Mutex
// ============================================================================

#[test]
fn test_mutex_counter_under_contention() {
    let counter = Arc::new(Mutex::new(0usize));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let counter = counter.clone();
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..ITERATIONS {
                    let mut n = counter.lock();
                    let seen = *n;
                    if rng.gen_ratio(1, 16) {
                        thread::yield_now();
                    }
                    *n = seen + 1;
                }
            })
        })
        .collect();

    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(*counter.lock(), THREADS * ITERATIONS);
    assert!(!counter.is_locked());
}

// ============================================================================
// RwLock
// ============================================================================

#[test]
fn test_rwlock_readers_never_see_torn_writes() {
    // Writers keep both halves equal; a reader seeing them differ saw a
    // write in progress
    let pair = Arc::new(RwLock::new((0u64, 0u64)));

    let writers: Vec<_> = (0..THREADS / 2)
        .map(|_| {
            let pair = pair.clone();
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..ITERATIONS {
                    let mut p = pair.write();
                    p.0 += 1;
                    if rng.gen_ratio(1, 8) {
                        thread::yield_now();
                    }
                    p.1 += 1;
                }
            })
        })
        .collect();

    let readers: Vec<_> = (0..THREADS / 2)
        .map(|_| {
            let pair = pair.clone();
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..ITERATIONS {
                    let p = pair.read();
                    let first = p.0;
                    if rng.gen_ratio(1, 8) {
                        thread::yield_now();
                    }
                    assert_eq!(first, p.1);
                }
            })
        })
        .collect();

    for t in writers.into_iter().chain(readers) {
        t.join().unwrap();
    }
    let total = (THREADS / 2 * ITERATIONS) as u64;
    assert_eq!(*pair.read(), (total, total));
}

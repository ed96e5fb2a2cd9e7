// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Kernel - Socket Core
//!
//! The kernel-side pieces the socket and pipe layers are built from.
//!
//! # Modules
//!
//! - [`arch`] - Interrupt masking for IRQ-safe spinlocks
//! - [`debug`] - Logging macros
//! - [`cmdline`] - Boot arguments and [`cmdline::StackConfig`]
//! - [`sync`] - Spinlock, wait queue, reference count, mutex, rwlock
//! - [`sched`] - Scheduler contract and the hosted backend
//! - [`timer`] - Deadline timers
//! - [`uio`] - Scatter/gather transfers
//! - [`lib`] - Ring buffer and object pool
//! - [`poll`] - Readiness events and multi-object wait
//! - [`fs`] - Rendezvous namespace for named sockets and FIFOs
//! - [`object`] - Pipes and FIFOs
//! - [`net`] - Sockets and protocol families

// Architecture module
pub mod arch;

pub mod cmdline;
pub mod debug;
pub mod fs;
pub mod lib;
pub mod net;
pub mod object;
pub mod poll;
pub mod sched;
pub mod sync;
pub mod timer;
pub mod uio;

#[cfg(test)]
mod tests;

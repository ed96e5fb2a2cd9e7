// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Socket Core
//!
//! Synchronization primitives and the in-kernel IPC/socket stack of the
//! Rustux kernel: spinlocks, wait queues, sleeping mutexes, reader/writer
//! locks, reference counts, deadline timers, scatter/gather I/O, pipes and
//! FIFOs, and the socket layer with its Unix-domain, raw packet, UDP and TCP
//! families.
//!
//! The crate is `no_std` + `alloc` when linked into the kernel. Hosted builds
//! (`cfg(test)` or the `std` feature) add a scheduler backend on top of
//! `std::thread` so every blocking path can be exercised on real threads.
//!
//! # Layout
//!
//! - [`rustux`] - Status codes, [`Error`], [`Result`] and scalar aliases
//! - [`kernel::sync`] - SpinLock, WaitQueue, RefCount, Mutex, RwLock
//! - [`kernel::sched`] - Scheduler contract consumed by the blocking primitives
//! - [`kernel::timer`] - Deadline-ordered timer queue
//! - [`kernel::uio`] - Scatter/gather transfer descriptor
//! - [`kernel::object::pipe`] - Pipes and FIFOs
//! - [`kernel::net`] - Sockets and protocol families

#![cfg_attr(not(any(test, feature = "std")), no_std)]

extern crate alloc;

pub mod rustux;
pub mod kernel;

pub use rustux::errors::{Error, Result};
pub use kernel::cmdline::StackConfig;
pub use kernel::net::{NetStack, Socket};

#[cfg(feature = "logging")]
#[doc(hidden)]
pub use log as __log;

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Poll
//!
//! Waits on several sockets and pipe ends at once. A poller never sleeps on
//! the objects' wait queues itself; it registers a [`WakeHook`] on them and
//! sleeps on a private queue that the hook kicks.
//!
//! # Design
//!
//! - **Registration first**: hooks are installed before the first scan, and
//!   the kick flag is cleared before every scan, so an event that lands
//!   between "scan found nothing" and "sleep" still ends the sleep
//! - **Always-on conditions**: `ERR`, `HUP` and `NVAL` are reported whether
//!   or not they were requested
//! - **Scoped hooks**: a [`PollRegistration`] removes its hooks on drop

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::kernel::sync::{HookId, SpinLock, WaitQueue, WakeHook};
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::Nanoseconds;

bitflags! {
    /// Readiness conditions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PollEvents: u32 {
        /// Data (or a pending connection, or end-of-stream) can be read
        const IN = 0x0001;
        /// Data can be written without blocking
        const OUT = 0x0004;
        /// An error is pending
        const ERR = 0x0008;
        /// The peer hung up
        const HUP = 0x0010;
        /// The object is not open
        const NVAL = 0x0020;
    }
}

/// Conditions reported even when not requested
const ALWAYS: PollEvents = PollEvents::ERR.union(PollEvents::HUP).union(PollEvents::NVAL);

/// An object whose readiness can be polled
pub trait Pollable {
    /// Conditions that currently hold
    fn poll_events(&self) -> PollEvents;

    /// Watch every wait queue whose wakeups can change `poll_events`
    fn register<'a>(&'a self, reg: &mut PollRegistration<'a>);
}

/// Hooks installed on behalf of one poll call
pub struct PollRegistration<'a> {
    hook: Arc<dyn WakeHook>,
    watched: Vec<(&'a WaitQueue, HookId)>,
}

impl<'a> PollRegistration<'a> {
    /// Start a registration that installs `hook`
    pub fn new(hook: Arc<dyn WakeHook>) -> Self {
        Self {
            hook,
            watched: Vec::new(),
        }
    }

    /// Install the hook on `wq`
    pub fn watch(&mut self, wq: &'a WaitQueue) {
        let id = wq.add_hook(Arc::clone(&self.hook));
        self.watched.push((wq, id));
    }

    /// Number of queues watched
    pub fn len(&self) -> usize {
        self.watched.len()
    }

    /// Whether no queue is watched
    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }
}

impl Drop for PollRegistration<'_> {
    fn drop(&mut self) {
        for (wq, id) in self.watched.drain(..) {
            wq.remove_hook(id);
        }
    }
}

/// One entry of a poll set
pub struct PollItem<'a> {
    /// Object to watch
    pub object: &'a dyn Pollable,
    /// Requested conditions
    pub events: PollEvents,
    /// Conditions found, filled in by [`poll`]
    pub revents: PollEvents,
}

impl<'a> PollItem<'a> {
    /// Watch `object` for `events`
    pub fn new(object: &'a dyn Pollable, events: PollEvents) -> Self {
        Self {
            object,
            events,
            revents: PollEvents::empty(),
        }
    }
}

/// Wakes the polling thread
struct PollWaiter {
    kicked: SpinLock<bool>,
    wq: WaitQueue,
}

impl WakeHook for PollWaiter {
    fn wake(&self) {
        *self.kicked.lock() = true;
        self.wq.wake_all();
    }
}

/// Block until an item reports a requested condition or `deadline` passes
///
/// # Returns
///
/// Number of items with non-empty `revents`; 0 when the deadline passed.
///
/// - `Err(Error::Interrupted)` if the sleep was interrupted
pub fn poll(items: &mut [PollItem<'_>], deadline: Nanoseconds) -> Result<usize> {
    let waiter = Arc::new(PollWaiter {
        kicked: SpinLock::new(false),
        wq: WaitQueue::new(),
    });

    let hook: Arc<dyn WakeHook> = waiter.clone();
    let mut reg = PollRegistration::new(hook);
    for item in items.iter() {
        item.object.register(&mut reg);
    }

    loop {
        *waiter.kicked.lock() = false;

        let mut ready = 0;
        for item in items.iter_mut() {
            item.revents = item.object.poll_events() & (item.events | ALWAYS);
            if !item.revents.is_empty() {
                ready += 1;
            }
        }
        if ready > 0 {
            return Ok(ready);
        }

        match waiter.wq.wait_until(waiter.kicked.lock(), deadline, |kicked| **kicked) {
            Ok(_) => continue,
            Err(Error::TimedOut) => return Ok(0),
            Err(err) => return Err(err),
        }
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Pipes and FIFOs
//!
//! A pipe is a fixed-capacity byte ring behind one mutex, with one wait
//! queue for readers and one for writers. Anonymous pipes come from
//! [`Pipes::pipe`]; named pipes attach a pipe to a FIFO node on first open.
//!
//! # Design
//!
//! - **End of stream**: once every write end is closed, reads drain what is
//!   buffered and then return 0
//! - **Broken pipe**: once every read end is closed, writes fail with
//!   `BrokenPipe`, including a writer already blocked for space
//! - **Atomic writes**: a write of at most `capacity` bytes lands in one
//!   piece; larger writes may interleave with other writers
//! - **Rendezvous**: a blocking FIFO open waits for the other side; a
//!   non-blocking write-open with no reader fails with `NotFound`
//! - **Timeouts**: each end carries an optional timeout applied to every
//!   blocking read or write; expiry reports `TimedOut` and leaves the ring
//!   as it was, except for bytes a partial write already moved
//!
//! # Usage
//!
//! ```text
//! let pipes = Pipes::new(&StackConfig::default())?;
//! let (rd, wr) = pipes.pipe()?;
//! wr.write(&mut Uio::from_slice(b"hello"))?;
//! let n = rd.read(&mut Uio::from_mut_slice(&mut buf))?;
//! ```

use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;

use crate::kernel::cmdline::StackConfig;
use crate::kernel::debug::log_fatal;
use crate::kernel::fs::{VNode, VNodeKind};
use crate::kernel::lib::{CBuf, ObjectPool, PoolSlot};
use crate::kernel::net::socket::WaitPolicy;
use crate::kernel::poll::{PollEvents, PollRegistration, Pollable};
use crate::kernel::sync::{Mutex, SpinLock, WaitQueue};
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::Nanoseconds;

// Import logging macros
use crate::{log_debug, log_trace};

/// ============================================================================
/// Pipe ID
/// ============================================================================

/// Pipe identifier
pub type PipeId = u64;

static NEXT_PIPE_ID: AtomicU64 = AtomicU64::new(1);

fn alloc_pipe_id() -> PipeId {
    NEXT_PIPE_ID.fetch_add(1, Ordering::Relaxed)
}

/// Which end of a pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeMode {
    Read,
    Write,
}

bitflags! {
    /// Flags for opening a pipe end
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        /// Return `ShouldWait` instead of blocking
        const NONBLOCK = 1 << 0;
    }
}

/// ============================================================================
/// Pipe
/// ============================================================================

struct PipeState {
    buf: CBuf,
    readers: usize,
    writers: usize,
    /// Read-end opens ever, for FIFO rendezvous
    read_opens: u64,
    /// Write-end opens ever, for FIFO rendezvous
    write_opens: u64,
    /// Detached from its FIFO node; new opens must not use it
    detached: bool,
}

/// Shared pipe object
pub struct Pipe {
    id: PipeId,
    state: Mutex<PipeState>,
    /// Readers waiting for data or for a writer to open
    rd_wait: WaitQueue,
    /// Writers waiting for space or for a reader to open
    wr_wait: WaitQueue,
    capacity: usize,
    node: Option<Weak<VNode>>,
    _slot: PoolSlot,
}

impl Pipe {
    /// Pipe ID
    pub fn id(&self) -> PipeId {
        self.id
    }

    /// Ring capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes buffered
    pub fn buffered(&self) -> usize {
        self.state.lock().buf.data_avail()
    }

    /// Open read and write ends
    pub fn ends(&self) -> (usize, usize) {
        let st = self.state.lock();
        (st.readers, st.writers)
    }

    fn wake_both(&self) {
        self.rd_wait.wake_all();
        self.wr_wait.wake_all();
    }
}

impl core::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("fifo", &self.node.is_some())
            .finish()
    }
}

/// ============================================================================
/// Pipe Ends
/// ============================================================================

/// One open end of a pipe
///
/// Dropping the end closes it.
pub struct PipeEnd {
    pipe: Arc<Pipe>,
    mode: PipeMode,
    nonblocking: AtomicBool,
    /// Bound on each blocking read or write; `None` waits forever
    timeout: SpinLock<Option<Nanoseconds>>,
}

impl PipeEnd {
    fn new(pipe: Arc<Pipe>, mode: PipeMode, flags: OpenFlags) -> Self {
        Self {
            pipe,
            mode,
            nonblocking: AtomicBool::new(flags.contains(OpenFlags::NONBLOCK)),
            timeout: SpinLock::new(None),
        }
    }

    /// Which end this is
    pub fn mode(&self) -> PipeMode {
        self.mode
    }

    /// The underlying pipe
    pub fn pipe(&self) -> &Arc<Pipe> {
        &self.pipe
    }

    /// Switch non-blocking mode
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.nonblocking.store(nonblocking, Ordering::Relaxed);
    }

    /// Whether the end is non-blocking
    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking.load(Ordering::Relaxed)
    }

    /// Bound every later blocking read or write on this end
    pub fn set_timeout(&self, timeout: Option<Nanoseconds>) {
        *self.timeout.lock() = timeout;
    }

    pub fn timeout(&self) -> Option<Nanoseconds> {
        *self.timeout.lock()
    }

    /// Blocking rules for an operation starting now
    fn policy(&self) -> WaitPolicy {
        WaitPolicy::new(self.is_nonblocking(), self.timeout())
    }

    /// Open another handle on the same end
    pub fn dup(&self) -> PipeEnd {
        {
            let mut st = self.pipe.state.lock();
            match self.mode {
                PipeMode::Read => st.readers += 1,
                PipeMode::Write => st.writers += 1,
            }
        }
        let end = PipeEnd::new(self.pipe.clone(), self.mode, self.flags());
        end.set_timeout(self.timeout());
        end
    }

    fn flags(&self) -> OpenFlags {
        if self.is_nonblocking() {
            OpenFlags::NONBLOCK
        } else {
            OpenFlags::empty()
        }
    }

    /// Write the bytes described by `uio`
    ///
    /// Blocks while the ring is full. Writes of at most `capacity` bytes wait
    /// until they fit whole.
    ///
    /// # Returns
    ///
    /// - `Ok(n)` bytes written; short when the call stops after moving some
    ///   bytes (non-blocking, timeout, interrupt, or the last reader closing)
    /// - `Err(Error::BrokenPipe)` once no read end is open
    /// - `Err(Error::ShouldWait)` in non-blocking mode when nothing fits
    /// - `Err(Error::TimedOut)` / `Err(Error::Interrupted)` before any byte moved
    /// - `Err(Error::BadState)` on a read end
    pub fn write(&self, uio: &mut Uio<'_>) -> Result<usize> {
        if self.mode != PipeMode::Write {
            return Err(Error::BadState);
        }
        if uio.is_empty() {
            return Ok(0);
        }

        let pipe = &*self.pipe;
        let policy = self.policy();
        let atomic = uio.resid() <= pipe.capacity;
        let mut written = 0;
        let mut st = pipe.state.lock();

        loop {
            if st.readers == 0 {
                log_trace!("pipe {}: write with no readers after {} bytes", pipe.id, written);
                return if written > 0 {
                    Ok(written)
                } else {
                    Err(Error::BrokenPipe)
                };
            }

            let need = if atomic { uio.resid() } else { 1 };
            if st.buf.space_avail() >= need {
                written += st.buf.write_from(uio, usize::MAX);
                pipe.rd_wait.wake_all();
                if uio.is_empty() {
                    return Ok(written);
                }
                continue;
            }

            st = match policy.wait(&pipe.wr_wait, st, |st| {
                st.readers == 0 || st.buf.space_avail() >= need
            }) {
                Ok(st) => st,
                Err(_) if written > 0 => return Ok(written),
                Err(e) => return Err(e),
            };
        }
    }

    /// Read up to `uio.resid()` bytes into `uio`
    ///
    /// Blocks while the ring is empty and a write end is open.
    ///
    /// # Returns
    ///
    /// - `Ok(0)` at end of stream
    /// - `Err(Error::ShouldWait)` in non-blocking mode with nothing buffered
    /// - `Err(Error::TimedOut)` when the end's timeout expires first
    /// - `Err(Error::BadState)` on a write end
    pub fn read(&self, uio: &mut Uio<'_>) -> Result<usize> {
        if self.mode != PipeMode::Read {
            return Err(Error::BadState);
        }
        if uio.is_empty() {
            return Ok(0);
        }

        let pipe = &*self.pipe;
        let policy = self.policy();
        let mut st = pipe.state.lock();

        loop {
            if !st.buf.is_empty() {
                let n = st.buf.read_into(uio, usize::MAX);
                pipe.wr_wait.wake_all();
                return Ok(n);
            }
            if st.writers == 0 {
                return Ok(0);
            }
            st = policy.wait(&pipe.rd_wait, st, |st| !st.buf.is_empty() || st.writers == 0)?;
        }
    }
}

impl Pollable for PipeEnd {
    fn poll_events(&self) -> PollEvents {
        let st = self.pipe.state.lock();
        let mut events = PollEvents::empty();
        match self.mode {
            PipeMode::Read => {
                if !st.buf.is_empty() {
                    events |= PollEvents::IN;
                }
                if st.writers == 0 {
                    events |= PollEvents::IN | PollEvents::HUP;
                }
            }
            PipeMode::Write => {
                if st.readers == 0 {
                    events |= PollEvents::ERR;
                } else if !st.buf.is_full() {
                    events |= PollEvents::OUT;
                }
            }
        }
        events
    }

    fn register<'a>(&'a self, reg: &mut PollRegistration<'a>) {
        reg.watch(&self.pipe.rd_wait);
        reg.watch(&self.pipe.wr_wait);
    }
}

impl Drop for PipeEnd {
    fn drop(&mut self) {
        let pipe = &self.pipe;
        {
            let mut st = pipe.state.lock();
            let count = match self.mode {
                PipeMode::Read => &mut st.readers,
                PipeMode::Write => &mut st.writers,
            };
            if *count == 0 {
                log_fatal(format_args!("pipe {}: {:?} end closed twice", pipe.id, self.mode));
            }
            *count -= 1;

            // A FIFO with no open ends starts over empty
            if st.readers == 0 && st.writers == 0 {
                if let Some(node) = pipe.node.as_ref().and_then(Weak::upgrade) {
                    st.detached = true;
                    node.detach(pipe);
                }
            }
        }
        pipe.wake_both();
    }
}

impl core::fmt::Debug for PipeEnd {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PipeEnd")
            .field("pipe", &self.pipe.id)
            .field("mode", &self.mode)
            .field("nonblocking", &self.is_nonblocking())
            .finish()
    }
}

/// ============================================================================
/// Pipe Allocator
/// ============================================================================

/// Creates pipes from a bounded pool
pub struct Pipes {
    pool: ObjectPool<Pipe>,
    capacity: usize,
}

impl Pipes {
    /// Create the allocator; limits come from `config`
    pub fn new(config: &StackConfig) -> Result<Self> {
        if config.pipe_capacity == 0 {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            pool: ObjectPool::new("pipe", config.max_pipes)?,
            capacity: config.pipe_capacity,
        })
    }

    fn alloc(&self, node: Option<Weak<VNode>>, readers: usize, writers: usize) -> Result<Arc<Pipe>> {
        let buf = CBuf::new(self.capacity).ok_or(Error::InvalidArgs)?;
        let pipe = self.pool.alloc(|slot| Pipe {
            id: alloc_pipe_id(),
            state: Mutex::new(PipeState {
                buf,
                readers,
                writers,
                read_opens: readers as u64,
                write_opens: writers as u64,
                detached: false,
            }),
            rd_wait: WaitQueue::new(),
            wr_wait: WaitQueue::new(),
            capacity: self.capacity,
            node,
            _slot: slot,
        })?;
        log_debug!("pipe {}: created, capacity {}", pipe.id, pipe.capacity);
        Ok(pipe)
    }

    /// Create an anonymous pipe
    ///
    /// # Returns
    ///
    /// `(read end, write end)`, or `Err(Error::NoMemory)` when the pipe
    /// limit is reached.
    pub fn pipe(&self) -> Result<(PipeEnd, PipeEnd)> {
        let pipe = self.alloc(None, 1, 1)?;
        Ok((
            PipeEnd::new(pipe.clone(), PipeMode::Read, OpenFlags::empty()),
            PipeEnd::new(pipe, PipeMode::Write, OpenFlags::empty()),
        ))
    }

    /// Open one end of the FIFO at `node`
    ///
    /// The first open attaches a fresh pipe to the node; the pipe goes away
    /// when its last end closes.
    ///
    /// # Returns
    ///
    /// - `Err(Error::WrongType)` if `node` is not a FIFO
    /// - `Err(Error::NotFound)` for a non-blocking write-open with no reader
    pub fn open_fifo(&self, node: &Arc<VNode>, mode: PipeMode, flags: OpenFlags) -> Result<PipeEnd> {
        self.open_fifo_timeout(node, mode, flags, None)
    }

    /// Open one end of the FIFO at `node`, waiting at most `timeout` for the
    /// other side
    ///
    /// The opened end keeps `timeout` for its later reads or writes.
    ///
    /// # Returns
    ///
    /// As [`Pipes::open_fifo`], plus `Err(Error::TimedOut)` when no peer
    /// showed up in time
    pub fn open_fifo_timeout(
        &self,
        node: &Arc<VNode>,
        mode: PipeMode,
        flags: OpenFlags,
        timeout: Option<Nanoseconds>,
    ) -> Result<PipeEnd> {
        if node.kind() != VNodeKind::Fifo {
            return Err(Error::WrongType);
        }

        loop {
            let pipe = node
                .attachment_or_insert_with(|| self.alloc(Some(Arc::downgrade(node)), 0, 0))?;
            let mut st = pipe.state.lock();
            if st.detached {
                // Lost a race with the last close; the node is free again
                continue;
            }

            let nonblock = flags.contains(OpenFlags::NONBLOCK);
            let seen = match mode {
                PipeMode::Read => {
                    st.readers += 1;
                    st.read_opens += 1;
                    st.write_opens
                }
                PipeMode::Write => {
                    if st.readers == 0 && nonblock {
                        return Err(Error::NotFound);
                    }
                    st.writers += 1;
                    st.write_opens += 1;
                    st.read_opens
                }
            };
            pipe.wake_both();

            let end = PipeEnd::new(pipe.clone(), mode, flags);
            end.set_timeout(timeout);
            if nonblock {
                return Ok(end);
            }

            // Wait for the other side; an open-and-close by it also counts
            let wq = match mode {
                PipeMode::Read => &pipe.rd_wait,
                PipeMode::Write => &pipe.wr_wait,
            };
            // On failure `end` drops and closes itself
            drop(WaitPolicy::new(false, timeout).wait(wq, st, |st| match mode {
                PipeMode::Read => st.writers > 0 || st.write_opens != seen,
                PipeMode::Write => st.readers > 0 || st.read_opens != seen,
            })?);
            log_trace!("pipe {}: fifo {:?} open", pipe.id, mode);
            return Ok(end);
        }
    }

    /// Live pipes
    pub fn allocated(&self) -> usize {
        self.pool.allocated_count()
    }

    /// Ring capacity of new pipes
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::fs::Namespace;
    use crate::rustux::types::ms_to_ns;
    use std::thread;
    use std::time::Duration;

    fn pipes(capacity: usize, max: usize) -> Pipes {
        let config = StackConfig {
            pipe_capacity: capacity,
            max_pipes: max,
            ..StackConfig::default()
        };
        Pipes::new(&config).unwrap()
    }

    fn write_all(end: &PipeEnd, data: &[u8]) -> Result<usize> {
        end.write(&mut Uio::from_slice(data))
    }

    fn read_some(end: &PipeEnd, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = end.read(&mut Uio::from_mut_slice(&mut buf))?;
        buf.truncate(n);
        Ok(buf)
    }

    #[test]
    fn test_pipe_round_trip() {
        let pipes = pipes(64, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        assert_eq!(write_all(&wr, b"hello pipe"), Ok(10));
        assert_eq!(read_some(&rd, 64).unwrap(), b"hello pipe");
        assert_eq!(rd.pipe().buffered(), 0);
    }

    #[test]
    fn test_wrong_end() {
        let pipes = pipes(64, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        assert_eq!(write_all(&rd, b"x"), Err(Error::BadState));
        assert_eq!(read_some(&wr, 4), Err(Error::BadState));
    }

    #[test]
    fn test_eof_after_writers_close() {
        let pipes = pipes(64, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        let wr2 = wr.dup();
        write_all(&wr, b"tail").unwrap();
        drop(wr);
        assert_eq!(rd.pipe().ends(), (1, 1));
        drop(wr2);

        assert_eq!(read_some(&rd, 64).unwrap(), b"tail");
        assert_eq!(read_some(&rd, 64).unwrap(), b"");
        assert!(rd.poll_events().contains(PollEvents::HUP));
    }

    #[test]
    fn test_broken_pipe() {
        let pipes = pipes(64, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        drop(rd);
        assert_eq!(write_all(&wr, b"x"), Err(Error::BrokenPipe));
        assert_eq!(wr.poll_events(), PollEvents::ERR);
    }

    #[test]
    fn test_nonblocking() {
        let pipes = pipes(8, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        rd.set_nonblocking(true);
        wr.set_nonblocking(true);

        assert_eq!(read_some(&rd, 8), Err(Error::ShouldWait));
        assert_eq!(write_all(&wr, b"123456"), Ok(6));
        // Fits whole or not at all
        assert_eq!(write_all(&wr, b"789"), Err(Error::ShouldWait));
        // Larger than capacity: partial
        assert_eq!(write_all(&wr, b"abcdefghijkl"), Ok(2));
        assert_eq!(read_some(&rd, 16).unwrap(), b"123456ab");
    }

    #[test]
    fn test_writer_blocks_until_reader_drains() {
        let pipes = pipes(16, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        let data: Vec<u8> = (0..100u8).collect();

        let writer = {
            let data = data.clone();
            thread::spawn(move || write_all(&wr, &data))
        };

        let mut got = Vec::new();
        while got.len() < data.len() {
            thread::sleep(Duration::from_millis(1));
            got.extend(read_some(&rd, 7).unwrap());
        }
        assert_eq!(writer.join().unwrap(), Ok(100));
        assert_eq!(got, data);
    }

    #[test]
    fn test_blocked_writer_fails_when_readers_close() {
        let pipes = pipes(4, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        write_all(&wr, b"full").unwrap();

        let writer = thread::spawn(move || write_all(&wr, b"more"));
        thread::sleep(Duration::from_millis(20));
        drop(rd);
        assert_eq!(writer.join().unwrap(), Err(Error::BrokenPipe));
    }

    #[test]
    fn test_partial_write_kept_when_readers_close() {
        let pipes = pipes(8, 4);
        let (rd, wr) = pipes.pipe().unwrap();

        // Larger than capacity: the first 8 bytes land, then the writer waits
        let writer = thread::spawn(move || write_all(&wr, &[7u8; 20]));
        while rd.pipe().buffered() < 8 {
            thread::sleep(Duration::from_millis(1));
        }
        thread::sleep(Duration::from_millis(20));
        drop(rd);
        assert_eq!(writer.join().unwrap(), Ok(8));
    }

    #[test]
    fn test_read_timeout_leaves_ring_unchanged() {
        let pipes = pipes(16, 4);
        let (rd, wr) = pipes.pipe().unwrap();

        rd.set_timeout(Some(0));
        assert_eq!(read_some(&rd, 16), Err(Error::TimedOut));
        rd.set_timeout(Some(ms_to_ns(10)));
        assert_eq!(read_some(&rd, 16), Err(Error::TimedOut));
        assert_eq!(rd.pipe().buffered(), 0);
        assert_eq!(rd.pipe().ends(), (1, 1));

        write_all(&wr, b"late").unwrap();
        assert_eq!(read_some(&rd, 16).unwrap(), b"late");
    }

    #[test]
    fn test_write_timeout() {
        let pipes = pipes(4, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        write_all(&wr, b"full").unwrap();

        wr.set_timeout(Some(0));
        assert_eq!(write_all(&wr, b"more"), Err(Error::TimedOut));
        wr.set_timeout(Some(ms_to_ns(10)));
        assert_eq!(write_all(&wr, b"more"), Err(Error::TimedOut));
        assert_eq!(wr.pipe().buffered(), 4);
        assert_eq!(read_some(&rd, 16).unwrap(), b"full");

        // A write that moved some bytes before expiring reports them
        assert_eq!(wr.dup().timeout(), Some(ms_to_ns(10)));
        assert_eq!(write_all(&wr, b"0123456789"), Ok(4));
        assert_eq!(read_some(&rd, 16).unwrap(), b"0123");
    }

    #[test]
    fn test_blocked_reader_sees_eof() {
        let pipes = pipes(4, 4);
        let (rd, wr) = pipes.pipe().unwrap();
        let reader = thread::spawn(move || read_some(&rd, 4));
        thread::sleep(Duration::from_millis(20));
        drop(wr);
        assert_eq!(reader.join().unwrap(), Ok(Vec::new()));
    }

    #[test]
    fn test_small_writes_are_atomic() {
        const CHUNK: usize = 24;
        let pipes = pipes(64, 4);
        let (rd, wr) = pipes.pipe().unwrap();

        let writers: Vec<_> = [b'a', b'b', b'c']
            .into_iter()
            .map(|byte| {
                let wr = wr.dup();
                thread::spawn(move || {
                    for _ in 0..20 {
                        write_all(&wr, &[byte; CHUNK]).unwrap();
                    }
                })
            })
            .collect();
        drop(wr);

        let mut got = Vec::new();
        loop {
            let chunk = read_some(&rd, 50).unwrap();
            if chunk.is_empty() {
                break;
            }
            got.extend(chunk);
        }
        for w in writers {
            w.join().unwrap();
        }

        assert_eq!(got.len(), 3 * 20 * CHUNK);
        for run in got.chunks(CHUNK) {
            assert!(run.iter().all(|&b| b == run[0]));
        }
    }

    #[test]
    fn test_pipe_limit() {
        let pipes = pipes(8, 1);
        let ends = pipes.pipe().unwrap();
        assert_eq!(pipes.pipe().err(), Some(Error::NoMemory));
        drop(ends);
        assert_eq!(pipes.allocated(), 0);
        assert!(pipes.pipe().is_ok());
    }

    #[test]
    fn test_fifo_nonblocking_write_open_without_reader() {
        let ns = Namespace::new();
        let pipes = pipes(32, 4);
        let node = ns.mknod("/run/fifo", VNodeKind::Fifo).unwrap();

        assert_eq!(
            pipes.open_fifo(&node, PipeMode::Write, OpenFlags::NONBLOCK).err(),
            Some(Error::NotFound)
        );

        let rd = pipes.open_fifo(&node, PipeMode::Read, OpenFlags::NONBLOCK).unwrap();
        let wr = pipes.open_fifo(&node, PipeMode::Write, OpenFlags::NONBLOCK).unwrap();
        assert!(Arc::ptr_eq(rd.pipe(), wr.pipe()));
        write_all(&wr, b"named").unwrap();
        assert_eq!(read_some(&rd, 32).unwrap(), b"named");

        // Last close detaches; the next open gets a fresh pipe
        let old = rd.pipe().id();
        drop(rd);
        drop(wr);
        assert!(!node.is_attached());
        let rd = pipes.open_fifo(&node, PipeMode::Read, OpenFlags::NONBLOCK).unwrap();
        assert_ne!(rd.pipe().id(), old);
    }

    #[test]
    fn test_fifo_blocking_open_rendezvous() {
        let ns = Namespace::new();
        let pipes = Arc::new(pipes(32, 4));
        let node = ns.mknod("/run/rv", VNodeKind::Fifo).unwrap();

        let reader = {
            let (pipes, node) = (pipes.clone(), node.clone());
            thread::spawn(move || {
                let rd = pipes.open_fifo(&node, PipeMode::Read, OpenFlags::empty()).unwrap();
                read_some(&rd, 32)
            })
        };

        thread::sleep(Duration::from_millis(20));
        let wr = pipes.open_fifo(&node, PipeMode::Write, OpenFlags::empty()).unwrap();
        write_all(&wr, b"ping").unwrap();
        assert_eq!(reader.join().unwrap(), Ok(b"ping".to_vec()));
    }

    #[test]
    fn test_fifo_open_timeout() {
        let ns = Namespace::new();
        let pipes = pipes(32, 4);
        let node = ns.mknod("/run/late", VNodeKind::Fifo).unwrap();

        assert_eq!(
            pipes
                .open_fifo_timeout(&node, PipeMode::Read, OpenFlags::empty(), Some(ms_to_ns(10)))
                .err(),
            Some(Error::TimedOut)
        );
        // The half-open end closed itself on the way out
        assert!(!node.is_attached());
        assert_eq!(pipes.allocated(), 0);
    }

    #[test]
    fn test_fifo_wrong_node_kind() {
        let ns = Namespace::new();
        let pipes = pipes(32, 4);
        let node = ns.mknod("/run/sock", VNodeKind::Socket).unwrap();
        assert_eq!(
            pipes.open_fifo(&node, PipeMode::Read, OpenFlags::empty()).err(),
            Some(Error::WrongType)
        );
    }
}

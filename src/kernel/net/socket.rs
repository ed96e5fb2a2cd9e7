// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Socket Core
//!
//! Every socket is a [`Sock<P>`]: one mutex over the generic state and the
//! family's protocol control block, a readable and a writable wait queue,
//! an open count, and per-socket options. Each family implements
//! [`Protocol`]; [`Socket`] is the tagged handle callers hold, dispatching
//! to the family with an exhaustive match.
//!
//! # Design
//!
//! - **One lock per socket**: all mutable socket state, buffers included,
//!   lives behind `Sock::inner`; the open count is the only state changed
//!   without it
//! - **Handle = descriptor**: a [`Socket`] is one open reference; `dup`
//!   adds one, dropping removes one, and the family's `close` runs exactly
//!   once, on the last drop
//! - **Timeouts**: a [`WaitPolicy`] captures non-blocking mode and the
//!   operation's deadline once, at entry, so every sleep of one operation
//!   shares the same deadline
//!
//! # Wait queues
//!
//! `rx_wait` wakes on "readable changed" (data, connections, EOF, errors);
//! `tx_wait` wakes on "writable changed". A sender that fills another
//! socket's buffer sleeps on its own `tx_wait`; the reader that frees
//! space wakes the sender's queue.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::kernel::lib::{ObjectPool, PoolSlot};
use crate::kernel::poll::{PollEvents, PollRegistration, Pollable};
use crate::kernel::sched;
use crate::kernel::sync::{Mutex, MutexGuard, RefCount, SpinLock, WaitQueue};
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::{deadline_after, Nanoseconds, INFINITE_TIME};

use super::addr::SockAddr;
use super::local::LocalProto;
use super::packet::PacketProto;
use super::tcp::TcpProto;
use super::udp::UdpProto;

// Import logging macros
use crate::log_debug;

/// ============================================================================
/// Socket Kinds
/// ============================================================================

/// Protocol family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// Unix-domain, named through the filesystem namespace
    Local,
    /// Raw link-layer frames
    Packet,
    /// IPv4 (UDP and TCP)
    Inet,
}

/// Socket type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockType {
    Stream,
    Dgram,
    Raw,
}

/// Direction(s) to shut down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    Read,
    Write,
    Both,
}

impl Shutdown {
    pub fn read(self) -> bool {
        matches!(self, Shutdown::Read | Shutdown::Both)
    }

    pub fn write(self) -> bool {
        matches!(self, Shutdown::Write | Shutdown::Both)
    }
}

/// Family-independent socket state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SockState {
    /// Fresh, no local address
    Unbound,
    /// Local address assigned
    Bound,
    /// Accepting connections
    Listening,
    /// Connection being set up
    Connecting,
    /// Connected, or has a default peer
    Connected,
    /// Connection over, or the socket was closed
    Closed,
}

/// ============================================================================
/// Options and Waiting
/// ============================================================================

/// Per-socket options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SockOptions {
    /// Return `ShouldWait` instead of blocking
    pub nonblocking: bool,
    /// Longest a receive (or accept) may block; None blocks forever
    pub recv_timeout: Option<Nanoseconds>,
    /// Longest a send (or connect) may block; None blocks forever
    pub send_timeout: Option<Nanoseconds>,
}

/// How one operation may block
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    nonblocking: bool,
    deadline: Nanoseconds,
}

impl WaitPolicy {
    /// Policy for an operation starting now
    pub fn new(nonblocking: bool, timeout: Option<Nanoseconds>) -> Self {
        let deadline = match timeout {
            Some(t) if !nonblocking => deadline_after(sched::scheduler().now(), t),
            _ => INFINITE_TIME,
        };
        Self { nonblocking, deadline }
    }

    pub fn is_nonblocking(&self) -> bool {
        self.nonblocking
    }

    /// Sleep on `wq` until `ready` holds for the state behind `guard`
    ///
    /// # Returns
    ///
    /// - `Ok(guard)` with `ready` true
    /// - `Err(Error::ShouldWait)` in non-blocking mode when not ready
    /// - `Err(Error::TimedOut)` / `Err(Error::Interrupted)` from the sleep
    pub fn wait<'a, T, F>(&self, wq: &WaitQueue, mut guard: MutexGuard<'a, T>, mut ready: F) -> Result<MutexGuard<'a, T>>
    where
        T: ?Sized + 'a,
        F: FnMut(&mut T) -> bool,
    {
        if ready(&mut *guard) {
            return Ok(guard);
        }
        if self.nonblocking {
            return Err(Error::ShouldWait);
        }
        wq.wait_until(guard, self.deadline, |g| ready(&mut **g))
    }
}

/// ============================================================================
/// Protocol Interface
/// ============================================================================

/// Operations every protocol family provides
///
/// The implementing type is the family instance (tables, pools, limits);
/// `Pcb` is its per-socket control block.
pub trait Protocol: Send + Sync + Sized + 'static {
    /// Per-socket protocol state
    type Pcb: Send + 'static;

    /// Family name, for log lines
    const NAME: &'static str;

    fn bind(&self, sock: &Arc<Sock<Self>>, addr: &SockAddr) -> Result;

    fn connect(&self, sock: &Arc<Sock<Self>>, addr: &SockAddr) -> Result;

    fn listen(&self, _sock: &Arc<Sock<Self>>, _backlog: usize) -> Result {
        Err(Error::NotSupported)
    }

    fn accept(&self, _sock: &Arc<Sock<Self>>) -> Result<Arc<Sock<Self>>> {
        Err(Error::NotSupported)
    }

    /// Send the bytes described by `uio`, to `dest` if given
    fn send(&self, sock: &Arc<Sock<Self>>, uio: &mut Uio<'_>, dest: Option<&SockAddr>) -> Result<usize>;

    /// Receive into `uio`, reporting the sender's address where known
    fn recv(&self, sock: &Arc<Sock<Self>>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)>;

    fn shutdown(&self, sock: &Arc<Sock<Self>>, how: Shutdown) -> Result;

    /// Last open reference went away
    fn close(&self, sock: &Arc<Sock<Self>>);

    fn poll_events(&self, sock: &Sock<Self>) -> PollEvents;

    fn local_addr(&self, sock: &Sock<Self>) -> Result<SockAddr>;

    fn peer_addr(&self, sock: &Sock<Self>) -> Result<SockAddr>;
}

/// ============================================================================
/// Sock
/// ============================================================================

/// Socket identifier
pub type SockId = u64;

static NEXT_SOCK_ID: AtomicU64 = AtomicU64::new(1);

fn alloc_sock_id() -> SockId {
    NEXT_SOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// State behind a socket's mutex
pub struct SockInner<Pcb> {
    pub state: SockState,
    /// No more receives
    pub shut_rd: bool,
    /// No more sends
    pub shut_wr: bool,
    /// Terminal error reported to callers
    pub error: Option<Error>,
    /// Protocol control block
    pub pcb: Pcb,
}

impl<Pcb> SockInner<Pcb> {
    /// Whether the socket can no longer be used
    pub fn is_closed(&self) -> bool {
        self.state == SockState::Closed
    }
}

/// A socket of family `P`
pub struct Sock<P: Protocol> {
    id: SockId,
    ty: SockType,
    proto: Arc<P>,
    pub(crate) inner: Mutex<SockInner<P::Pcb>>,
    /// Readable-changed waiters
    pub(crate) rx_wait: WaitQueue,
    /// Writable-changed waiters
    pub(crate) tx_wait: WaitQueue,
    /// Open references (descriptors)
    opens: RefCount,
    opts: SpinLock<SockOptions>,
    _slot: PoolSlot,
}

impl<P: Protocol> Sock<P> {
    /// Allocate a socket from `pool` with one open reference
    pub(crate) fn alloc(
        pool: &ObjectPool<Sock<P>>,
        proto: Arc<P>,
        ty: SockType,
        state: SockState,
        pcb: P::Pcb,
    ) -> Result<Arc<Self>> {
        let sock = pool.alloc(|slot| Sock {
            id: alloc_sock_id(),
            ty,
            proto,
            inner: Mutex::new(SockInner {
                state,
                shut_rd: false,
                shut_wr: false,
                error: None,
                pcb,
            }),
            rx_wait: WaitQueue::new(),
            tx_wait: WaitQueue::new(),
            opens: RefCount::new(1),
            opts: SpinLock::new(SockOptions::default()),
            _slot: slot,
        })?;
        log_debug!("{} socket {}: open ({:?})", P::NAME, sock.id, ty);
        Ok(sock)
    }

    pub fn id(&self) -> SockId {
        self.id
    }

    pub fn ty(&self) -> SockType {
        self.ty
    }

    /// The family instance
    pub fn proto(&self) -> &Arc<P> {
        &self.proto
    }

    /// Lock the socket state
    pub fn lock(&self) -> MutexGuard<'_, SockInner<P::Pcb>> {
        self.inner.lock()
    }

    /// Current generic state
    pub fn state(&self) -> SockState {
        self.inner.lock().state
    }

    pub fn options(&self) -> SockOptions {
        *self.opts.lock()
    }

    pub fn set_options(&self, opts: SockOptions) {
        *self.opts.lock() = opts;
    }

    /// Blocking rules for a receive starting now
    pub fn recv_policy(&self) -> WaitPolicy {
        let o = self.options();
        WaitPolicy::new(o.nonblocking, o.recv_timeout)
    }

    /// Blocking rules for a send starting now
    pub fn send_policy(&self) -> WaitPolicy {
        let o = self.options();
        WaitPolicy::new(o.nonblocking, o.send_timeout)
    }

    /// Wake every waiter on both queues
    pub(crate) fn wake_all(&self) {
        self.rx_wait.wake_all();
        self.tx_wait.wake_all();
    }

    /// Open references
    pub fn open_count(&self) -> usize {
        self.opens.get()
    }

    fn retain(&self) {
        self.opens.inc();
    }

    /// Drop one open reference, closing on the last
    pub(crate) fn release(self: &Arc<Self>) {
        if self.opens.dec() == 0 {
            log_debug!("{} socket {}: close", P::NAME, self.id);
            self.proto.close(self);
        }
    }
}

impl<P: Protocol> core::fmt::Debug for Sock<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Sock")
            .field("family", &P::NAME)
            .field("id", &self.id)
            .field("ty", &self.ty)
            .field("opens", &self.opens.get())
            .finish()
    }
}

/// ============================================================================
/// Port Allocation
/// ============================================================================

/// Round-robin ephemeral port picker
#[derive(Debug)]
pub struct PortAllocator {
    first: u16,
    last: u16,
    cursor: AtomicU32,
}

impl PortAllocator {
    /// Allocator over `first..=last`
    ///
    /// Returns `Err(Error::InvalidArgs)` for an empty range.
    pub fn new(first: u16, last: u16) -> Result<Self> {
        if first > last {
            return Err(Error::InvalidArgs);
        }
        Ok(Self {
            first,
            last,
            cursor: AtomicU32::new(0),
        })
    }

    /// First free port in the range, starting after the last one handed out
    ///
    /// Returns `Err(Error::AddrInUse)` when every port is taken.
    pub fn pick(&self, in_use: impl Fn(u16) -> bool) -> Result<u16> {
        let span = u32::from(self.last - self.first) + 1;
        for _ in 0..span {
            let step = self.cursor.fetch_add(1, Ordering::Relaxed) % span;
            // step < span, so this stays within first..=last
            let port = self.first + step as u16;
            if !in_use(port) {
                return Ok(port);
            }
        }
        Err(Error::AddrInUse)
    }
}

/// ============================================================================
/// Socket Handle
/// ============================================================================

pub type LocalSock = Sock<LocalProto>;
pub type PacketSock = Sock<PacketProto>;
pub type UdpSock = Sock<UdpProto>;
pub type TcpSock = Sock<TcpProto>;

/// An open socket of any family
///
/// Dropping the handle closes this reference.
pub enum Socket {
    Local(Arc<LocalSock>),
    Packet(Arc<PacketSock>),
    Udp(Arc<UdpSock>),
    Tcp(Arc<TcpSock>),
}

/// Run `$body` with `$s` bound to the inner `Arc<Sock<_>>`
macro_rules! with_sock {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Socket::Local($s) => $body,
            Socket::Packet($s) => $body,
            Socket::Udp($s) => $body,
            Socket::Tcp($s) => $body,
        }
    };
}

/// Like `with_sock!`, rewrapping the result in the same variant
macro_rules! map_sock {
    ($self:expr, $s:ident => $body:expr) => {
        match $self {
            Socket::Local($s) => Socket::Local($body),
            Socket::Packet($s) => Socket::Packet($body),
            Socket::Udp($s) => Socket::Udp($body),
            Socket::Tcp($s) => Socket::Tcp($body),
        }
    };
}

impl Socket {
    pub fn id(&self) -> SockId {
        with_sock!(self, s => s.id())
    }

    pub fn family(&self) -> Family {
        match self {
            Socket::Local(_) => Family::Local,
            Socket::Packet(_) => Family::Packet,
            Socket::Udp(_) | Socket::Tcp(_) => Family::Inet,
        }
    }

    pub fn ty(&self) -> SockType {
        with_sock!(self, s => s.ty())
    }

    pub fn state(&self) -> SockState {
        with_sock!(self, s => s.state())
    }

    /// Assign a local address
    pub fn bind(&self, addr: &SockAddr) -> Result {
        with_sock!(self, s => s.proto().bind(s, addr))
    }

    /// Connect (stream) or set the default peer (datagram)
    pub fn connect(&self, addr: &SockAddr) -> Result {
        with_sock!(self, s => s.proto().connect(s, addr))
    }

    /// Start accepting connections, at most `backlog` pending
    pub fn listen(&self, backlog: usize) -> Result {
        with_sock!(self, s => s.proto().listen(s, backlog))
    }

    /// Take the next pending connection
    pub fn accept(&self) -> Result<Socket> {
        Ok(map_sock!(self, s => s.proto().accept(s)?))
    }

    /// Send to the connected peer
    pub fn send(&self, uio: &mut Uio<'_>) -> Result<usize> {
        with_sock!(self, s => s.proto().send(s, uio, None))
    }

    /// Send to `dest`
    pub fn send_to(&self, uio: &mut Uio<'_>, dest: &SockAddr) -> Result<usize> {
        with_sock!(self, s => s.proto().send(s, uio, Some(dest)))
    }

    /// Receive; 0 means end of stream
    pub fn recv(&self, uio: &mut Uio<'_>) -> Result<usize> {
        self.recv_from(uio).map(|(n, _)| n)
    }

    /// Receive, also returning the sender's address where known
    pub fn recv_from(&self, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        with_sock!(self, s => s.proto().recv(s, uio))
    }

    pub fn shutdown(&self, how: Shutdown) -> Result {
        with_sock!(self, s => s.proto().shutdown(s, how))
    }

    pub fn local_addr(&self) -> Result<SockAddr> {
        with_sock!(self, s => s.proto().local_addr(s))
    }

    pub fn peer_addr(&self) -> Result<SockAddr> {
        with_sock!(self, s => s.proto().peer_addr(s))
    }

    pub fn options(&self) -> SockOptions {
        with_sock!(self, s => s.options())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        with_sock!(self, s => {
            let mut o = s.options();
            o.nonblocking = nonblocking;
            s.set_options(o);
        })
    }

    pub fn set_recv_timeout(&self, timeout: Option<Nanoseconds>) {
        with_sock!(self, s => {
            let mut o = s.options();
            o.recv_timeout = timeout;
            s.set_options(o);
        })
    }

    pub fn set_send_timeout(&self, timeout: Option<Nanoseconds>) {
        with_sock!(self, s => {
            let mut o = s.options();
            o.send_timeout = timeout;
            s.set_options(o);
        })
    }

    /// Open another reference to the same socket
    pub fn dup(&self) -> Socket {
        map_sock!(self, s => {
            s.retain();
            s.clone()
        })
    }

    /// Open references to the socket
    pub fn open_count(&self) -> usize {
        with_sock!(self, s => s.open_count())
    }

    /// Close this reference
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        with_sock!(self, s => s.release())
    }
}

impl Pollable for Socket {
    fn poll_events(&self) -> PollEvents {
        with_sock!(self, s => s.proto().poll_events(s))
    }

    fn register<'a>(&'a self, reg: &mut PollRegistration<'a>) {
        with_sock!(self, s => {
            reg.watch(&s.rx_wait);
            reg.watch(&s.tx_wait);
        })
    }
}

impl core::fmt::Debug for Socket {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        with_sock!(self, s => core::fmt::Debug::fmt(&**s, f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rustux::types::ms_to_ns;

    #[test]
    fn test_policy_nonblocking_never_sleeps() {
        let m = Mutex::new(0u32);
        let wq = WaitQueue::new();
        let policy = WaitPolicy::new(true, Some(ms_to_ns(1000)));
        assert!(policy.is_nonblocking());
        assert_eq!(policy.wait(&wq, m.lock(), |v| *v > 0).err(), Some(Error::ShouldWait));
        *m.lock() = 1;
        assert!(policy.wait(&wq, m.lock(), |v| *v > 0).is_ok());
    }

    #[test]
    fn test_policy_zero_timeout() {
        let m = Mutex::new(false);
        let wq = WaitQueue::new();
        let policy = WaitPolicy::new(false, Some(0));
        assert_eq!(policy.wait(&wq, m.lock(), |v| *v).err(), Some(Error::TimedOut));
        assert!(wq.is_empty());
        assert!(!m.is_locked());
    }

    #[test]
    fn test_port_allocator_wraps_and_skips() {
        let ports = PortAllocator::new(100, 102).unwrap();
        assert_eq!(ports.pick(|_| false), Ok(100));
        assert_eq!(ports.pick(|p| p == 101), Ok(102));
        assert_eq!(ports.pick(|_| false), Ok(100));
        assert_eq!(ports.pick(|_| true), Err(Error::AddrInUse));

        let single = PortAllocator::new(7, 7).unwrap();
        assert_eq!(single.pick(|_| false), Ok(7));
        assert_eq!(PortAllocator::new(9, 8).err(), Some(Error::InvalidArgs));
    }

    #[test]
    fn test_shutdown_directions() {
        assert!(Shutdown::Both.read() && Shutdown::Both.write());
        assert!(Shutdown::Read.read() && !Shutdown::Read.write());
    }
}

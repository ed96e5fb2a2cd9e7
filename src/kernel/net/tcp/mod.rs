// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! TCP
//!
//! Connection state machine, send/receive buffering and retransmission.
//!
//! # States
//!
//! ```text
//!            connect                     listen
//! CLOSED ----------------> SYN_SENT    CLOSED ------> LISTEN
//!                             |                         | SYN (child)
//!                     SYN+ACK |                         v
//!                             |                    SYN_RECEIVED
//!                             v                         | ACK
//!                        ESTABLISHED <------------------+
//!            close /          |        \ FIN
//!                 v           |         v
//!            FIN_WAIT_1       |      CLOSE_WAIT
//!          ACK /    \ FIN     |         | close
//!             v      v        |         v
//!     FIN_WAIT_2   CLOSING    |      LAST_ACK
//!         | FIN      | ACK    |         | ACK
//!         v          v        v         v
//!       CLOSED     CLOSED              CLOSED
//! ```
//!
//! There is no TIME_WAIT: a connection is released as soon as both FINs
//! are acknowledged. A connection nobody can read any more skips
//! FIN_WAIT_2.
//!
//! # Buffers
//!
//! `sndq` holds every byte from `snd_una` on, acknowledged bytes are
//! dropped from its front; `rx` is the receive ring, and its free space is
//! the advertised window. Only in-order data is accepted: a segment
//! beyond `rcv_nxt` is dropped and answered with a duplicate ACK.
//!
//! # Retransmission
//!
//! One timer per connection covers the oldest unacknowledged byte (or
//! the SYN). On expiry everything from `snd_una` is sent again with the
//! timeout doubled, up to the configured ceiling. After
//! `tcp_max_retries` expiries in a row the connection is reset. With the
//! peer's window closed the same timer sends one-byte window probes.
//!
//! Timer callbacks run from the tick and cannot take the socket mutex,
//! so they only queue the socket; [`TcpProto::run_timers`] does the work.
//!
//! # Locking
//!
//! Segments are built under the socket mutex and handed to the network
//! layer after it is released. Table locks (`conns`, `listeners`, `ports`)
//! may be taken while holding one socket mutex, never the other way
//! round: input clones the socket out of the table first.

pub mod segment;

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::kernel::cmdline::StackConfig;
use crate::kernel::lib::{CBuf, ObjectPool};
use crate::kernel::poll::PollEvents;
use crate::kernel::sync::{RwLock, SpinLock};
use crate::kernel::timer::Timer;
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::{deadline_after, Nanoseconds};

use super::addr::{Ipv4Addr, SockAddr, SockAddrIn};
use super::netpkt::NetPkt;
use super::socket::{PortAllocator, Protocol, Shutdown, Sock, SockId, SockInner, SockState, SockType, TcpSock};
use super::stack::{DropReason, InputResult, NetClock, NetOutput, IPPROTO_TCP};

pub use segment::{Segment, TcpFlags, TcpHeader};
use segment::{reset_for, seq_ge, seq_gt, seq_le, seq_lt, TCP_DEFAULT_MSS};

// Import logging macros
use crate::{log_debug, log_trace};

/// ISS clock increment per connection
const ISS_STEP: u32 = 64_000;

/// ============================================================================
/// Connection State
/// ============================================================================

/// TCP connection states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,
    FinWait1,
    FinWait2,
    Closing,
    CloseWait,
    LastAck,
}

impl TcpState {
    /// SYNs exchanged in both directions
    pub fn is_synchronized(self) -> bool {
        matches!(
            self,
            Self::Established | Self::FinWait1 | Self::FinWait2 | Self::Closing | Self::CloseWait | Self::LastAck
        )
    }

    /// The application may still queue data
    fn can_send(self) -> bool {
        matches!(self, Self::Established | Self::CloseWait)
    }

    /// The peer may still send data
    fn accepts_data(self) -> bool {
        matches!(self, Self::Established | Self::FinWait1 | Self::FinWait2)
    }

    fn sock_state(self) -> SockState {
        match self {
            Self::Closed => SockState::Closed,
            Self::Listen => SockState::Listening,
            Self::SynSent | Self::SynReceived => SockState::Connecting,
            _ => SockState::Connected,
        }
    }
}

struct ListenState {
    backlog: usize,
    /// Established, waiting for accept
    accept_q: VecDeque<Arc<TcpSock>>,
    /// Children still in SYN_RECEIVED
    embryonic: usize,
}

/// TCP protocol control block
pub struct TcpPcb {
    state: TcpState,
    local: Option<SockAddrIn>,
    remote: Option<SockAddrIn>,
    /// Holds a reference on `local.port`
    port_held: bool,
    in_conns: bool,
    in_listeners: bool,

    // Send side
    iss: u32,
    snd_una: u32,
    snd_nxt: u32,
    /// Highest sequence number sent
    snd_max: u32,
    snd_wnd: u32,
    /// Largest segment we send
    mss: usize,
    /// MSS we advertise
    adv_mss: u16,
    /// Bytes from `snd_una` on, sent or not
    sndq: VecDeque<u8>,
    /// The application is done; a FIN follows the queued data
    fin_queued: bool,
    /// Sequence number of our FIN once sent
    fin_seq: Option<u32>,

    // Receive side
    irs: u32,
    rcv_nxt: u32,
    rx: CBuf,
    fin_received: bool,

    // Retransmission
    rto: Nanoseconds,
    retries: u32,
    rtx: Option<Timer>,
    /// Invalidates timer firings already queued
    rtx_gen: u64,

    listen: Option<ListenState>,
    /// Listener of a passive child not yet accepted
    parent: Option<Weak<TcpSock>>,
    /// No handle refers to the socket any more
    orphaned: bool,
}

/// A segment built under the socket lock, sent after it is released
struct Tx {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    bytes: Vec<u8>,
}

fn raw_tx(local: SockAddrIn, remote: SockAddrIn, hdr: &TcpHeader) -> Tx {
    Tx {
        src: local.addr,
        dst: remote.addr,
        bytes: hdr.encode(local.addr, remote.addr, &[]),
    }
}

/// Work deferred until the socket mutex is released
#[derive(Default)]
struct Work {
    tx: Vec<Tx>,
    wake: bool,
    /// Handshake completed; queue on this listener
    promote: Option<Weak<TcpSock>>,
    /// Died before the handshake completed; give the slot back
    unparent: Option<Weak<TcpSock>>,
}

impl TcpPcb {
    fn new(config: &StackConfig) -> Result<Self> {
        Ok(Self {
            state: TcpState::Closed,
            local: None,
            remote: None,
            port_held: false,
            in_conns: false,
            in_listeners: false,
            iss: 0,
            snd_una: 0,
            snd_nxt: 0,
            snd_max: 0,
            snd_wnd: 0,
            mss: config.tcp_mss,
            adv_mss: config.tcp_mss.min(usize::from(u16::MAX)) as u16,
            sndq: VecDeque::new(),
            fin_queued: false,
            fin_seq: None,
            irs: 0,
            rcv_nxt: 0,
            rx: CBuf::new(config.tcp_rcvbuf).ok_or(Error::InvalidArgs)?,
            fin_received: false,
            rto: config.tcp_rto_initial,
            retries: 0,
            rtx: None,
            rtx_gen: 0,
            listen: None,
            parent: None,
            orphaned: false,
        })
    }

    pub fn state(&self) -> TcpState {
        self.state
    }

    /// Start a handshake with `iss`
    fn start(&mut self, iss: u32) {
        self.iss = iss;
        self.snd_una = iss;
        self.snd_nxt = iss.wrapping_add(1);
        self.snd_max = self.snd_nxt;
    }

    /// Take the peer's MSS option into account
    fn peer_mss(&mut self, mss: Option<u16>) {
        self.mss = self.mss.min(usize::from(mss.unwrap_or(TCP_DEFAULT_MSS))).max(1);
    }

    fn rcv_wnd(&self) -> u32 {
        self.rx.space_avail().min(usize::from(u16::MAX)) as u32
    }

    fn in_flight(&self) -> u32 {
        self.snd_nxt.wrapping_sub(self.snd_una)
    }

    /// Queued bytes not yet sent
    fn unsent(&self) -> usize {
        let sent = (self.in_flight() as usize).min(self.sndq.len());
        self.sndq.len() - sent
    }

    fn fin_acked(&self) -> bool {
        self.fin_seq.is_some_and(|fin| seq_gt(self.snd_una, fin))
    }

    /// Something is waiting on the retransmission timer
    fn needs_timer(&self) -> bool {
        match self.state {
            TcpState::SynSent | TcpState::SynReceived => true,
            s if s.is_synchronized() => self.in_flight() > 0 || (self.unsent() > 0 && self.snd_wnd == 0),
            _ => false,
        }
    }

    fn segment(&self, flags: TcpFlags, seq: u32, payload: &[u8]) -> Tx {
        let local = self.local.unwrap_or_default();
        let remote = self.remote.unwrap_or_default();
        let hdr = TcpHeader {
            src_port: local.port,
            dst_port: remote.port,
            seq,
            ack: if flags.contains(TcpFlags::ACK) { self.rcv_nxt } else { 0 },
            flags,
            window: self.rcv_wnd() as u16,
            mss: flags.contains(TcpFlags::SYN).then_some(self.adv_mss),
        };
        Tx {
            src: local.addr,
            dst: remote.addr,
            bytes: hdr.encode(local.addr, remote.addr, payload),
        }
    }

    /// Our SYN, or SYN+ACK on the passive side
    fn syn(&self) -> Tx {
        match self.state {
            TcpState::SynReceived => self.segment(TcpFlags::SYN | TcpFlags::ACK, self.iss, &[]),
            _ => self.segment(TcpFlags::SYN, self.iss, &[]),
        }
    }

    fn ack(&self) -> Tx {
        self.segment(TcpFlags::ACK, self.snd_nxt, &[])
    }

    fn rst(&self) -> Tx {
        self.segment(TcpFlags::RST | TcpFlags::ACK, self.snd_nxt, &[])
    }

    fn note_sent(&mut self) {
        if seq_gt(self.snd_nxt, self.snd_max) {
            self.snd_max = self.snd_nxt;
        }
    }

    /// Send what the peer's window allows, then the FIN when it is due
    ///
    /// A `probe` treats a closed window as one byte wide.
    fn output(&mut self, probe: bool, tx: &mut Vec<Tx>) {
        if !self.state.is_synchronized() {
            return;
        }

        let wnd = if probe { self.snd_wnd.max(1) } else { self.snd_wnd };
        loop {
            let unsent = self.unsent();
            let usable = wnd.saturating_sub(self.in_flight()) as usize;
            let n = unsent.min(usable).min(self.mss);
            if n == 0 {
                break;
            }

            let off = self.sndq.len() - unsent;
            let payload: Vec<u8> = self.sndq.range(off..off + n).copied().collect();
            let mut flags = TcpFlags::ACK;
            if n == unsent {
                flags |= TcpFlags::PSH;
            }
            tx.push(self.segment(flags, self.snd_nxt, &payload));
            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.note_sent();
        }

        let fin_at = self.snd_una.wrapping_add(self.sndq.len() as u32);
        if self.fin_queued && !self.fin_acked() && self.snd_nxt == fin_at {
            tx.push(self.segment(TcpFlags::FIN | TcpFlags::ACK, self.snd_nxt, &[]));
            self.fin_seq = Some(self.snd_nxt);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
            self.note_sent();
        }
    }
}

fn set_state(id: SockId, inner: &mut SockInner<TcpPcb>, new: TcpState) {
    let old = inner.pcb.state;
    if old == new {
        return;
    }
    log_debug!("tcp socket {}: {:?} -> {:?}", id, old, new);
    inner.pcb.state = new;
    inner.state = new.sock_state();
}

/// Can a send make progress (or fail) now
fn send_ready(inner: &SockInner<TcpPcb>, sndbuf: usize) -> bool {
    inner.error.is_some()
        || inner.shut_wr
        || match inner.pcb.state {
            TcpState::SynSent | TcpState::SynReceived => false,
            s if s.can_send() => inner.pcb.sndq.len() < sndbuf,
            _ => true,
        }
}

impl Sock<TcpProto> {
    /// Current connection state
    pub fn tcp_state(&self) -> TcpState {
        self.lock().pcb.state
    }
}

/// ============================================================================
/// Protocol
/// ============================================================================

type ConnKey = (SockAddrIn, SockAddrIn);

/// TCP family
pub struct TcpProto {
    config: StackConfig,
    output: Arc<dyn NetOutput>,
    clock: Arc<NetClock>,
    pool: ObjectPool<TcpSock>,
    /// Connections by (local, remote)
    conns: RwLock<BTreeMap<ConnKey, Arc<TcpSock>>>,
    /// Listeners by local port
    listeners: RwLock<BTreeMap<u16, Arc<TcpSock>>>,
    /// Local port -> sockets using it
    ports: SpinLock<BTreeMap<u16, usize>>,
    ephemeral: PortAllocator,
    /// Sockets whose retransmission timer fired, with the timer generation
    rtx_ready: Arc<SpinLock<VecDeque<(Weak<TcpSock>, u64)>>>,
    iss: AtomicU32,
}

impl TcpProto {
    pub fn new(config: &StackConfig, output: Arc<dyn NetOutput>, clock: Arc<NetClock>) -> Result<Self> {
        Ok(Self {
            pool: ObjectPool::new("tcp-sock", config.max_sockets)?,
            ephemeral: PortAllocator::new(config.ephemeral_first, config.ephemeral_last)?,
            config: config.clone(),
            output,
            clock,
            conns: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(BTreeMap::new()),
            ports: SpinLock::new(BTreeMap::new()),
            rtx_ready: Arc::new(SpinLock::new(VecDeque::new())),
            iss: AtomicU32::new(0x0101_0000),
        })
    }

    pub fn open(self: &Arc<Self>) -> Result<Arc<TcpSock>> {
        let pcb = TcpPcb::new(&self.config)?;
        Sock::alloc(&self.pool, self.clone(), SockType::Stream, SockState::Unbound, pcb)
    }

    pub fn allocated(&self) -> usize {
        self.pool.allocated_count()
    }

    /// Connections in the demultiplexing table
    pub fn connection_count(&self) -> usize {
        self.conns.read().len()
    }

    fn next_iss(&self) -> u32 {
        // 4 us clock plus a per-connection step
        let t = (self.clock.now() / 4_000) as u32;
        t.wrapping_add(self.iss.fetch_add(ISS_STEP, Ordering::Relaxed))
    }

    /// ------------------------------------------------------------------
    /// Ports and tables
    /// ------------------------------------------------------------------

    fn bind_port(&self, pcb: &mut TcpPcb, addr: SockAddrIn) -> Result {
        if pcb.local.is_some() {
            return Err(Error::InvalidArgs);
        }

        let mut ports = self.ports.lock();
        let port = match addr.port {
            0 => self.ephemeral.pick(|p| ports.contains_key(&p))?,
            p if ports.contains_key(&p) => return Err(Error::AddrInUse),
            p => p,
        };
        ports.insert(port, 1);
        drop(ports);

        pcb.local = Some(SockAddrIn::new(addr.addr, port));
        pcb.port_held = true;
        Ok(())
    }

    fn port_get(&self, port: u16) {
        *self.ports.lock().entry(port).or_insert(0) += 1;
    }

    fn port_put(&self, port: u16) {
        let mut ports = self.ports.lock();
        if let Some(users) = ports.get_mut(&port) {
            *users -= 1;
            if *users == 0 {
                ports.remove(&port);
            }
        }
    }

    /// Leave every table and stop the timer
    fn teardown(&self, pcb: &mut TcpPcb) {
        self.cancel_timer(pcb);
        pcb.sndq.clear();

        if let Some(local) = pcb.local {
            if pcb.in_conns {
                if let Some(remote) = pcb.remote {
                    self.conns.write().remove(&(local, remote));
                }
                pcb.in_conns = false;
            }
            if pcb.in_listeners {
                self.listeners.write().remove(&local.port);
                pcb.in_listeners = false;
            }
            if pcb.port_held {
                self.port_put(local.port);
                pcb.port_held = false;
            }
        }
    }

    /// ------------------------------------------------------------------
    /// Timers
    /// ------------------------------------------------------------------

    fn arm_timer(&self, sock: &Arc<TcpSock>, pcb: &mut TcpPcb) {
        pcb.rtx_gen += 1;
        let gen = pcb.rtx_gen;
        let weak = Arc::downgrade(sock);
        let ready = self.rtx_ready.clone();
        let deadline = deadline_after(self.clock.now(), pcb.rto);
        pcb.rtx = Some(self.clock.timers().add(deadline, move || {
            ready.lock().push_back((weak, gen));
        }));
    }

    fn cancel_timer(&self, pcb: &mut TcpPcb) {
        if let Some(timer) = pcb.rtx.take() {
            self.clock.timers().remove(&timer);
        }
        pcb.rtx_gen += 1;
    }

    fn update_timer(&self, sock: &Arc<TcpSock>, pcb: &mut TcpPcb) {
        if !pcb.needs_timer() {
            self.cancel_timer(pcb);
        } else if pcb.rtx.is_none() {
            self.arm_timer(sock, pcb);
        }
    }

    /// Handle retransmission timeouts queued by the timer callbacks
    pub fn run_timers(&self) {
        loop {
            let next = self.rtx_ready.lock().pop_front();
            let Some((weak, gen)) = next else { break };
            if let Some(sock) = weak.upgrade() {
                self.on_timeout(&sock, gen);
            }
        }
    }

    fn on_timeout(&self, sock: &Arc<TcpSock>, gen: u64) {
        let id = sock.id();
        let mut work = Work::default();
        {
            let mut inner = sock.lock();
            if inner.pcb.rtx_gen != gen {
                return;
            }
            inner.pcb.rtx = None;
            if !inner.pcb.needs_timer() {
                return;
            }

            inner.pcb.retries += 1;
            if inner.pcb.retries > self.config.tcp_max_retries {
                log_debug!("tcp socket {}: unanswered after {} retransmissions", id, self.config.tcp_max_retries);
                self.abort(id, &mut inner, Some(Error::ConnectionReset), true, &mut work);
            } else {
                inner.pcb.rto = inner.pcb.rto.saturating_mul(2).min(self.config.tcp_rto_max);
                log_trace!("tcp socket {}: retransmit #{}, rto now {}", id, inner.pcb.retries, inner.pcb.rto);
                match inner.pcb.state {
                    TcpState::SynSent | TcpState::SynReceived => work.tx.push(inner.pcb.syn()),
                    _ => {
                        let probe = inner.pcb.snd_wnd == 0;
                        inner.pcb.snd_nxt = inner.pcb.snd_una;
                        inner.pcb.output(probe, &mut work.tx);
                    }
                }
                self.arm_timer(sock, &mut inner.pcb);
            }
        }
        self.finish(sock, work);
    }

    /// ------------------------------------------------------------------
    /// Deferred work
    /// ------------------------------------------------------------------

    fn transmit(&self, tx: Vec<Tx>) {
        for t in tx {
            let pkt = NetPkt::new(t.bytes, 0);
            if let Err(err) = self.output.ip_output(t.src, t.dst, IPPROTO_TCP, pkt) {
                // Retransmission covers it
                log_debug!("tcp: output to {} failed: {:?}", t.dst, err);
            }
        }
    }

    fn finish(&self, sock: &Arc<TcpSock>, work: Work) {
        self.transmit(work.tx);
        if work.wake {
            sock.wake_all();
        }
        if let Some(parent) = work.promote {
            self.promote(&parent, sock);
        }
        if let Some(parent) = work.unparent {
            self.embryo_died(&parent, sock);
        }
    }

    /// Move a child that finished its handshake to the accept queue
    fn promote(&self, parent: &Weak<TcpSock>, child: &Arc<TcpSock>) {
        if let Some(parent) = parent.upgrade() {
            let queued = {
                let mut l = parent.lock();
                match l.pcb.listen.as_mut() {
                    Some(lst) => {
                        lst.embryonic = lst.embryonic.saturating_sub(1);
                        lst.accept_q.push_back(child.clone());
                        true
                    }
                    None => false,
                }
            };
            if queued {
                log_debug!("tcp socket {}: ready on listener {}", child.id(), parent.id());
                parent.rx_wait.wake_all();
                return;
            }
        }

        // The listener is gone
        self.abort_child(child);
    }

    fn embryo_died(&self, parent: &Weak<TcpSock>, child: &Arc<TcpSock>) {
        if let Some(parent) = parent.upgrade() {
            if let Some(lst) = parent.lock().pcb.listen.as_mut() {
                lst.embryonic = lst.embryonic.saturating_sub(1);
            }
        }
        child.release();
    }

    /// Reset a child nobody will accept and drop its open reference
    fn abort_child(&self, child: &Arc<TcpSock>) {
        let mut work = Work::default();
        {
            let mut inner = child.lock();
            inner.pcb.parent = None;
            self.abort(child.id(), &mut inner, Some(Error::ConnectionReset), true, &mut work);
        }
        self.finish(child, work);
        child.release();
    }

    /// ------------------------------------------------------------------
    /// State changes
    /// ------------------------------------------------------------------

    fn enter_closed(&self, id: SockId, inner: &mut SockInner<TcpPcb>, work: &mut Work) {
        set_state(id, inner, TcpState::Closed);
        self.teardown(&mut inner.pcb);
        work.unparent = inner.pcb.parent.take();
        work.wake = true;
    }

    /// Drop the connection, optionally telling the peer
    fn abort(&self, id: SockId, inner: &mut SockInner<TcpPcb>, err: Option<Error>, send_rst: bool, work: &mut Work) {
        let state = inner.pcb.state;
        if send_rst && (state.is_synchronized() || state == TcpState::SynReceived) {
            work.tx.push(inner.pcb.rst());
        }
        if let Some(err) = err {
            inner.error = Some(err);
            inner.pcb.rx.clear();
        }
        self.enter_closed(id, inner, work);
    }

    /// Queue our FIN behind the pending data
    fn queue_fin(&self, sock: &Arc<TcpSock>, inner: &mut SockInner<TcpPcb>, work: &mut Work) {
        let next = match inner.pcb.state {
            TcpState::Established => TcpState::FinWait1,
            TcpState::CloseWait => TcpState::LastAck,
            _ => return,
        };
        inner.pcb.fin_queued = true;
        set_state(sock.id(), inner, next);
        inner.pcb.output(false, &mut work.tx);
        self.update_timer(sock, &mut inner.pcb);
    }

    /// ------------------------------------------------------------------
    /// Input
    /// ------------------------------------------------------------------

    /// Deliver a segment from the network layer
    pub fn input(&self, pkt: NetPkt, src: Ipv4Addr, dst: Ipv4Addr) -> InputResult {
        let seg = match Segment::parse(src, dst, &pkt) {
            Ok(seg) => seg,
            Err(reason) => return InputResult::Dropped(reason),
        };
        let local = seg.dst(dst);
        let remote = seg.src(src);

        let conn = self.conns.read().get(&(local, remote)).cloned();
        if let Some(sock) = conn {
            return self.segment_arrives(&sock, &seg, local, remote);
        }

        let listener = self.listeners.read().get(&local.port).cloned();
        if let Some(listener) = listener {
            return self.listen_input(&listener, &seg, local, remote);
        }

        self.reply_reset(&seg, local, remote);
        InputResult::Dropped(DropReason::NoSocket)
    }

    fn reply_reset(&self, seg: &Segment, local: SockAddrIn, remote: SockAddrIn) {
        if let Some(hdr) = reset_for(seg) {
            self.transmit(alloc::vec![raw_tx(local, remote, &hdr)]);
        }
    }

    fn listen_input(&self, listener: &Arc<TcpSock>, seg: &Segment, local: SockAddrIn, remote: SockAddrIn) -> InputResult {
        {
            let mut l = listener.lock();
            let addr_ok = l
                .pcb
                .local
                .is_some_and(|a| a.addr.is_unspecified() || a.addr == local.addr);
            if !addr_ok || l.pcb.listen.is_none() {
                drop(l);
                self.reply_reset(seg, local, remote);
                return InputResult::Dropped(DropReason::NoSocket);
            }
            if seg.has(TcpFlags::RST) {
                return InputResult::Dropped(DropReason::Filtered);
            }
            if seg.has(TcpFlags::ACK) {
                drop(l);
                self.reply_reset(seg, local, remote);
                return InputResult::Dropped(DropReason::Filtered);
            }
            if !seg.has(TcpFlags::SYN) {
                return InputResult::Dropped(DropReason::Filtered);
            }

            let Some(lst) = l.pcb.listen.as_mut() else {
                return InputResult::Dropped(DropReason::NoSocket);
            };
            if lst.accept_q.len() + lst.embryonic >= lst.backlog {
                log_debug!("tcp socket {}: backlog full, SYN from {} dropped", listener.id(), remote);
                return InputResult::Dropped(DropReason::BacklogFull);
            }
            lst.embryonic += 1;
        }

        match self.spawn_child(listener, seg, local, remote) {
            Ok(()) => InputResult::Accepted,
            Err(err) => {
                if let Some(lst) = listener.lock().pcb.listen.as_mut() {
                    lst.embryonic = lst.embryonic.saturating_sub(1);
                }
                match err {
                    Error::NoMemory => InputResult::Dropped(DropReason::NoMemory),
                    _ => InputResult::Dropped(DropReason::Filtered),
                }
            }
        }
    }

    /// Create the SYN_RECEIVED child for a SYN on `listener`
    fn spawn_child(&self, listener: &Arc<TcpSock>, seg: &Segment, local: SockAddrIn, remote: SockAddrIn) -> Result {
        let mut pcb = TcpPcb::new(&self.config)?;
        pcb.local = Some(local);
        pcb.remote = Some(remote);
        pcb.parent = Some(Arc::downgrade(listener));
        pcb.irs = seg.hdr.seq;
        pcb.rcv_nxt = seg.hdr.seq.wrapping_add(1);
        pcb.start(self.next_iss());
        pcb.snd_wnd = u32::from(seg.hdr.window);
        pcb.peer_mss(seg.hdr.mss);
        pcb.state = TcpState::SynReceived;

        let child = Sock::alloc(&self.pool, listener.proto().clone(), SockType::Stream, SockState::Connecting, pcb)?;
        {
            let mut conns = self.conns.write();
            if conns.contains_key(&(local, remote)) {
                return Err(Error::AddrInUse);
            }
            conns.insert((local, remote), child.clone());
        }
        self.port_get(local.port);

        let mut work = Work::default();
        {
            let mut inner = child.lock();
            inner.pcb.in_conns = true;
            inner.pcb.port_held = true;
            log_debug!("tcp socket {}: SYN from {} on listener {}", child.id(), remote, listener.id());
            work.tx.push(inner.pcb.syn());
            self.arm_timer(&child, &mut inner.pcb);
        }
        self.finish(&child, work);
        Ok(())
    }

    fn segment_arrives(&self, sock: &Arc<TcpSock>, seg: &Segment, local: SockAddrIn, remote: SockAddrIn) -> InputResult {
        let mut work = Work::default();
        let res = {
            let mut inner = sock.lock();
            match inner.pcb.state {
                TcpState::Closed | TcpState::Listen => {
                    if let Some(hdr) = reset_for(seg) {
                        work.tx.push(raw_tx(local, remote, &hdr));
                    }
                    InputResult::Dropped(DropReason::NoSocket)
                }
                TcpState::SynSent => self.syn_sent_input(sock, &mut inner, seg, local, remote, &mut work),
                _ => self.synced_input(sock, &mut inner, seg, local, remote, &mut work),
            }
        };
        self.finish(sock, work);
        res
    }

    fn syn_sent_input(
        &self,
        sock: &Arc<TcpSock>,
        inner: &mut SockInner<TcpPcb>,
        seg: &Segment,
        local: SockAddrIn,
        remote: SockAddrIn,
        work: &mut Work,
    ) -> InputResult {
        let id = sock.id();
        let h = &seg.hdr;
        let has_ack = seg.has(TcpFlags::ACK);
        let ack_ok = has_ack && seq_gt(h.ack, inner.pcb.iss) && seq_le(h.ack, inner.pcb.snd_max);

        if has_ack && !ack_ok {
            if let Some(hdr) = reset_for(seg) {
                work.tx.push(raw_tx(local, remote, &hdr));
            }
            return InputResult::Dropped(DropReason::Filtered);
        }
        if seg.has(TcpFlags::RST) {
            if !ack_ok {
                return InputResult::Dropped(DropReason::Filtered);
            }
            log_debug!("tcp socket {}: connection refused by {}", id, remote);
            self.abort(id, inner, Some(Error::ConnectionRefused), false, work);
            return InputResult::Accepted;
        }
        if !seg.has(TcpFlags::SYN) {
            return InputResult::Dropped(DropReason::Filtered);
        }

        inner.pcb.irs = h.seq;
        inner.pcb.rcv_nxt = h.seq.wrapping_add(1);
        inner.pcb.snd_wnd = u32::from(h.window);
        inner.pcb.peer_mss(h.mss);

        if ack_ok {
            inner.pcb.snd_una = h.ack;
            inner.pcb.retries = 0;
            inner.pcb.rto = self.config.tcp_rto_initial;
            self.cancel_timer(&mut inner.pcb);
            set_state(id, inner, TcpState::Established);
            work.tx.push(inner.pcb.ack());
            inner.pcb.output(false, &mut work.tx);
            self.update_timer(sock, &mut inner.pcb);
        } else {
            // Simultaneous open
            set_state(id, inner, TcpState::SynReceived);
            work.tx.push(inner.pcb.syn());
        }
        work.wake = true;
        InputResult::Accepted
    }

    fn synced_input(
        &self,
        sock: &Arc<TcpSock>,
        inner: &mut SockInner<TcpPcb>,
        seg: &Segment,
        local: SockAddrIn,
        remote: SockAddrIn,
        work: &mut Work,
    ) -> InputResult {
        let id = sock.id();
        let h = &seg.hdr;
        let rcv_nxt = inner.pcb.rcv_nxt;

        if seg.has(TcpFlags::RST) {
            let wnd = inner.pcb.rcv_wnd().max(1);
            if seq_lt(h.seq, rcv_nxt) || seq_ge(h.seq, rcv_nxt.wrapping_add(wnd)) {
                return InputResult::Dropped(DropReason::Filtered);
            }
            if inner.pcb.parent.is_some() {
                log_debug!("tcp socket {}: handshake reset by {}", id, remote);
                self.abort(id, inner, None, false, work);
            } else {
                log_debug!("tcp socket {}: reset by {}", id, remote);
                self.abort(id, inner, Some(Error::ConnectionReset), false, work);
            }
            return InputResult::Accepted;
        }

        if seg.has(TcpFlags::SYN) {
            if inner.pcb.state == TcpState::SynReceived && h.seq == inner.pcb.irs {
                // Our SYN+ACK was lost
                work.tx.push(inner.pcb.syn());
            } else {
                work.tx.push(inner.pcb.ack());
            }
            return InputResult::Dropped(DropReason::Filtered);
        }

        let seg_len = seg.seq_len();
        let seg_end = h.seq.wrapping_add(seg_len);
        let acceptable = seq_le(h.seq, rcv_nxt) && (seg_len == 0 || seq_gt(seg_end, rcv_nxt));
        if !acceptable {
            // Out of order or an old duplicate: say where we are
            work.tx.push(inner.pcb.ack());
            return InputResult::Dropped(DropReason::Filtered);
        }
        if !seg.has(TcpFlags::ACK) {
            return InputResult::Dropped(DropReason::Filtered);
        }
        if seq_gt(h.ack, inner.pcb.snd_max) {
            work.tx.push(inner.pcb.ack());
            return InputResult::Dropped(DropReason::Filtered);
        }

        if inner.pcb.state == TcpState::SynReceived {
            if seq_le(h.ack, inner.pcb.iss) {
                if let Some(hdr) = reset_for(seg) {
                    work.tx.push(raw_tx(local, remote, &hdr));
                }
                return InputResult::Dropped(DropReason::Filtered);
            }
            // The SYN is acknowledged
            inner.pcb.snd_una = inner.pcb.iss.wrapping_add(1);
            set_state(id, inner, TcpState::Established);
            work.promote = inner.pcb.parent.take();
            work.wake = true;
        }

        self.process_ack(id, inner, h, work);
        if inner.pcb.state == TcpState::Closed {
            return InputResult::Accepted;
        }

        // Payload, trimmed to what is new
        let mut payload = seg.payload.clone();
        if seq_lt(h.seq, rcv_nxt) {
            payload = payload.skip(rcv_nxt.wrapping_sub(h.seq) as usize);
        }

        let mut need_ack = false;
        let mut took_all = true;
        if !payload.is_empty() && inner.pcb.state.accepts_data() {
            if inner.pcb.orphaned {
                log_debug!("tcp socket {}: data after close, resetting", id);
                self.abort(id, inner, None, true, work);
                return InputResult::Accepted;
            }
            let n = if inner.shut_rd {
                // Read side shut: acknowledge and discard
                payload.len()
            } else {
                inner.pcb.rx.write(payload.as_slice())
            };
            inner.pcb.rcv_nxt = inner.pcb.rcv_nxt.wrapping_add(n as u32);
            took_all = n == payload.len();
            need_ack = true;
            if n > 0 {
                work.wake = true;
            }
        }

        let mut closed = false;
        if seg.has(TcpFlags::FIN) && took_all {
            need_ack = true;
            if !inner.pcb.fin_received {
                inner.pcb.rcv_nxt = inner.pcb.rcv_nxt.wrapping_add(1);
                inner.pcb.fin_received = true;
                work.wake = true;
                match inner.pcb.state {
                    TcpState::Established => set_state(id, inner, TcpState::CloseWait),
                    TcpState::FinWait1 => set_state(id, inner, TcpState::Closing),
                    TcpState::FinWait2 => closed = true,
                    _ => {}
                }
            }
        }

        let queued = work.tx.len();
        inner.pcb.output(false, &mut work.tx);
        if need_ack && work.tx.len() == queued {
            work.tx.push(inner.pcb.ack());
        }

        if closed {
            self.enter_closed(id, inner, work);
        } else {
            self.update_timer(sock, &mut inner.pcb);
        }
        InputResult::Accepted
    }

    /// Take an acceptable ACK into account
    fn process_ack(&self, id: SockId, inner: &mut SockInner<TcpPcb>, h: &TcpHeader, work: &mut Work) {
        let pcb = &mut inner.pcb;
        if seq_ge(h.ack, pcb.snd_una) {
            pcb.snd_wnd = u32::from(h.window);
        }
        if !seq_gt(h.ack, pcb.snd_una) {
            if pcb.snd_wnd == 0 {
                // The peer is answering our window probes
                pcb.retries = 0;
            }
            return;
        }

        let fin_acked_now = !pcb.fin_acked() && pcb.fin_seq.is_some_and(|fin| seq_gt(h.ack, fin));
        let mut acked = h.ack.wrapping_sub(pcb.snd_una) as usize;
        if fin_acked_now {
            acked -= 1;
        }
        let drain = acked.min(pcb.sndq.len());
        pcb.sndq.drain(..drain);
        pcb.snd_una = h.ack;
        if seq_lt(pcb.snd_nxt, h.ack) {
            pcb.snd_nxt = h.ack;
        }
        pcb.retries = 0;
        pcb.rto = self.config.tcp_rto_initial;
        self.cancel_timer(pcb);
        work.wake = true;

        if fin_acked_now {
            match inner.pcb.state {
                TcpState::FinWait1 if inner.pcb.orphaned => self.enter_closed(id, inner, work),
                TcpState::FinWait1 => set_state(id, inner, TcpState::FinWait2),
                TcpState::Closing | TcpState::LastAck => self.enter_closed(id, inner, work),
                _ => {}
            }
        }
    }
}

impl Protocol for TcpProto {
    type Pcb = TcpPcb;

    const NAME: &'static str = "tcp";

    fn bind(&self, sock: &Arc<TcpSock>, addr: &SockAddr) -> Result {
        let addr = addr.as_inet().ok_or(Error::InvalidArgs)?;
        let mut inner = sock.lock();
        if inner.pcb.state != TcpState::Closed || inner.is_closed() {
            return Err(Error::InvalidArgs);
        }
        self.bind_port(&mut inner.pcb, addr)?;
        inner.state = SockState::Bound;
        log_debug!("tcp socket {}: bound to {}", sock.id(), inner.pcb.local.unwrap_or_default());
        Ok(())
    }

    /// Active open
    ///
    /// Blocks until the handshake completes unless the socket is
    /// non-blocking, in which case it returns `InProgress` and completion
    /// is reported by poll (writable) or a later send/recv.
    fn connect(&self, sock: &Arc<TcpSock>, addr: &SockAddr) -> Result {
        let remote = addr.as_inet().ok_or(Error::InvalidArgs)?;
        if remote.port == 0 || remote.addr.is_unspecified() {
            return Err(Error::InvalidArgs);
        }

        let id = sock.id();
        let mut work = Work::default();
        {
            let mut inner = sock.lock();
            match inner.pcb.state {
                TcpState::Closed if inner.is_closed() => return Err(Error::BadState),
                TcpState::Closed => {}
                TcpState::SynSent | TcpState::SynReceived => return Err(Error::InProgress),
                TcpState::Listen => return Err(Error::InvalidArgs),
                _ => return Err(Error::AlreadyConnected),
            }

            if inner.pcb.local.is_none() {
                self.bind_port(&mut inner.pcb, SockAddrIn::default())?;
            }
            let bound = inner.pcb.local.ok_or(Error::BadState)?;
            let src = if bound.addr.is_unspecified() {
                self.output.local_addr_for(remote.addr).ok_or(Error::NotFound)?
            } else {
                bound.addr
            };
            let local = SockAddrIn::new(src, bound.port);

            {
                let mut conns = self.conns.write();
                if conns.contains_key(&(local, remote)) {
                    return Err(Error::AddrInUse);
                }
                conns.insert((local, remote), sock.clone());
            }
            inner.pcb.in_conns = true;
            inner.pcb.local = Some(local);
            inner.pcb.remote = Some(remote);
            inner.pcb.start(self.next_iss());
            set_state(id, &mut inner, TcpState::SynSent);
            log_debug!("tcp socket {}: connecting {} -> {}", id, local, remote);

            work.tx.push(inner.pcb.syn());
            self.arm_timer(sock, &mut inner.pcb);
        }
        self.finish(sock, work);

        let policy = sock.send_policy();
        if policy.is_nonblocking() {
            return Err(Error::InProgress);
        }
        let inner = sock.lock();
        let inner = policy.wait(&sock.tx_wait, inner, |i| {
            !matches!(i.pcb.state, TcpState::SynSent | TcpState::SynReceived)
        })?;
        if let Some(err) = inner.error {
            return Err(err);
        }
        match inner.pcb.state {
            s if s.is_synchronized() => Ok(()),
            _ => Err(Error::ConnectionReset),
        }
    }

    fn listen(&self, sock: &Arc<TcpSock>, backlog: usize) -> Result {
        let backlog = backlog.clamp(1, self.config.listen_backlog);
        let mut inner = sock.lock();
        match inner.pcb.state {
            TcpState::Listen => {
                if let Some(lst) = inner.pcb.listen.as_mut() {
                    lst.backlog = backlog;
                }
                return Ok(());
            }
            TcpState::Closed if !inner.is_closed() => {}
            _ => return Err(Error::InvalidArgs),
        }

        if inner.pcb.local.is_none() {
            self.bind_port(&mut inner.pcb, SockAddrIn::default())?;
        }
        let local = inner.pcb.local.ok_or(Error::BadState)?;
        {
            let mut listeners = self.listeners.write();
            if listeners.contains_key(&local.port) {
                return Err(Error::AddrInUse);
            }
            listeners.insert(local.port, sock.clone());
        }
        inner.pcb.in_listeners = true;
        inner.pcb.listen = Some(ListenState {
            backlog,
            accept_q: VecDeque::new(),
            embryonic: 0,
        });
        set_state(sock.id(), &mut inner, TcpState::Listen);
        Ok(())
    }

    fn accept(&self, sock: &Arc<TcpSock>) -> Result<Arc<TcpSock>> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        if inner.pcb.listen.is_none() {
            return Err(Error::InvalidArgs);
        }

        let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
            i.pcb.listen.as_ref().map_or(true, |lst| !lst.accept_q.is_empty())
        })?;
        inner
            .pcb
            .listen
            .as_mut()
            .and_then(|lst| lst.accept_q.pop_front())
            .ok_or(Error::BadState)
    }

    /// Queue data for transmission
    ///
    /// Blocks while the send buffer is full. A send interrupted by a
    /// timeout after queuing some bytes reports the partial count.
    fn send(&self, sock: &Arc<TcpSock>, uio: &mut Uio<'_>, _dest: Option<&SockAddr>) -> Result<usize> {
        if uio.is_empty() {
            return Ok(0);
        }

        let policy = sock.send_policy();
        let sndbuf = self.config.tcp_sndbuf;
        let mut written = 0;
        loop {
            let mut work = Work::default();
            {
                let inner = sock.lock();
                let mut inner = match policy.wait(&sock.tx_wait, inner, |i| send_ready(i, sndbuf)) {
                    Ok(inner) => inner,
                    Err(Error::ShouldWait | Error::TimedOut) if written > 0 => return Ok(written),
                    Err(err) => return Err(err),
                };
                if let Some(err) = inner.error {
                    return if written > 0 { Ok(written) } else { Err(err) };
                }
                if inner.shut_wr || inner.pcb.fin_queued {
                    return Err(Error::BrokenPipe);
                }
                if !inner.pcb.state.can_send() {
                    return Err(Error::NotConnected);
                }

                let n = (sndbuf - inner.pcb.sndq.len()).min(uio.resid());
                let data = uio.copy_in_vec(n);
                inner.pcb.sndq.extend(data);
                written += n;
                inner.pcb.output(false, &mut work.tx);
                self.update_timer(sock, &mut inner.pcb);
            }
            self.finish(sock, work);
            if uio.is_empty() {
                return Ok(written);
            }
        }
    }

    /// Read in-order data; 0 once the peer's FIN has been read
    fn recv(&self, sock: &Arc<TcpSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        let policy = sock.recv_policy();
        let mut work = Work::default();
        let n = {
            let inner = sock.lock();
            if matches!(inner.pcb.state, TcpState::Closed | TcpState::Listen) && !inner.is_closed() {
                return Err(Error::NotConnected);
            }

            let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
                !i.pcb.rx.is_empty() || i.pcb.fin_received || i.error.is_some() || i.shut_rd || i.is_closed()
            })?;
            if inner.pcb.rx.is_empty() {
                return match inner.error {
                    Some(err) => Err(err),
                    None => Ok((0, None)),
                };
            }

            let before = inner.pcb.rcv_wnd();
            let n = inner.pcb.rx.read_into(uio, usize::MAX);
            let after = inner.pcb.rcv_wnd();
            // Window update once it reopens past a segment
            let threshold = self.config.tcp_mss.min(self.config.tcp_rcvbuf / 2) as u32;
            if inner.pcb.state.accepts_data() && before < threshold && after >= threshold {
                work.tx.push(inner.pcb.ack());
            }
            n
        };
        self.finish(sock, work);
        Ok((n, None))
    }

    fn shutdown(&self, sock: &Arc<TcpSock>, how: Shutdown) -> Result {
        let mut work = Work::default();
        {
            let mut inner = sock.lock();
            if !inner.pcb.state.is_synchronized() {
                return Err(Error::NotConnected);
            }
            if how.read() {
                inner.shut_rd = true;
                inner.pcb.rx.clear();
                work.wake = true;
            }
            if how.write() && !inner.shut_wr {
                inner.shut_wr = true;
                self.queue_fin(sock, &mut inner, &mut work);
                work.wake = true;
            }
        }
        self.finish(sock, work);
        Ok(())
    }

    fn close(&self, sock: &Arc<TcpSock>) {
        let id = sock.id();
        let mut work = Work::default();
        let mut children = VecDeque::new();
        {
            let mut inner = sock.lock();
            inner.pcb.orphaned = true;
            inner.shut_rd = true;
            inner.shut_wr = true;
            match inner.pcb.state {
                TcpState::Listen => {
                    if let Some(lst) = inner.pcb.listen.take() {
                        children = lst.accept_q;
                    }
                    self.enter_closed(id, &mut inner, &mut work);
                }
                TcpState::Established | TcpState::CloseWait if !inner.pcb.rx.is_empty() => {
                    log_debug!("tcp socket {}: closed with unread data", id);
                    self.abort(id, &mut inner, None, true, &mut work);
                }
                TcpState::Established | TcpState::CloseWait => self.queue_fin(sock, &mut inner, &mut work),
                TcpState::SynReceived => self.abort(id, &mut inner, None, true, &mut work),
                TcpState::Closed | TcpState::SynSent | TcpState::FinWait2 => {
                    self.enter_closed(id, &mut inner, &mut work)
                }
                TcpState::FinWait1 | TcpState::Closing | TcpState::LastAck => {}
            }
        }
        self.finish(sock, work);

        for child in children {
            self.abort_child(&child);
        }
    }

    fn poll_events(&self, sock: &TcpSock) -> PollEvents {
        let inner = sock.lock();
        let mut events = PollEvents::empty();

        if let Some(lst) = &inner.pcb.listen {
            if !lst.accept_q.is_empty() {
                events |= PollEvents::IN;
            }
            return events;
        }
        if !inner.pcb.rx.is_empty() || inner.pcb.fin_received || inner.shut_rd || inner.is_closed() {
            events |= PollEvents::IN;
        }
        if inner.pcb.state.can_send() && !inner.shut_wr && inner.pcb.sndq.len() < self.config.tcp_sndbuf {
            events |= PollEvents::OUT;
        }
        if inner.error.is_some() {
            events |= PollEvents::ERR;
        }
        if inner.is_closed() || (inner.pcb.fin_received && inner.shut_wr) {
            events |= PollEvents::HUP;
        }
        events
    }

    fn local_addr(&self, sock: &TcpSock) -> Result<SockAddr> {
        Ok(SockAddr::Inet(sock.lock().pcb.local.unwrap_or_default()))
    }

    fn peer_addr(&self, sock: &TcpSock) -> Result<SockAddr> {
        sock.lock().pcb.remote.map(SockAddr::Inet).ok_or(Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::net::socket::{Family, Socket};
    use crate::kernel::net::stack::testing::{stack, Wire};
    use crate::kernel::net::stack::NetStack;
    use crate::rustux::types::ms_to_ns;
    use std::thread;
    use std::time::Duration;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn config() -> StackConfig {
        StackConfig {
            tcp_rto_initial: ms_to_ns(10),
            tcp_rto_max: ms_to_ns(1000),
            tcp_max_retries: 2,
            tcp_sndbuf: 64,
            tcp_rcvbuf: 64,
            tcp_mss: 16,
            ..StackConfig::default()
        }
    }

    fn tcp(s: &Socket) -> &Arc<TcpSock> {
        match s {
            Socket::Tcp(t) => t,
            _ => panic!("not a tcp socket"),
        }
    }

    fn sent(wire: &Wire) -> Vec<Segment> {
        wire.take()
            .into_iter()
            .map(|s| Segment::parse(s.src, s.dst, &NetPkt::new(s.bytes, 0)).unwrap())
            .collect()
    }

    /// The remote end, driven by hand
    struct Peer {
        port: u16,
        host_port: u16,
        seq: u32,
        ack: u32,
        window: u16,
    }

    impl Peer {
        fn send(&mut self, stack: &NetStack, flags: TcpFlags, payload: &[u8]) -> InputResult {
            let hdr = TcpHeader {
                src_port: self.port,
                dst_port: self.host_port,
                seq: self.seq,
                ack: self.ack,
                flags,
                window: self.window,
                mss: None,
            };
            let mut len = payload.len() as u32;
            if flags.contains(TcpFlags::SYN) {
                len += 1;
            }
            if flags.contains(TcpFlags::FIN) {
                len += 1;
            }
            self.seq = self.seq.wrapping_add(len);
            stack.tcp_input(NetPkt::new(hdr.encode(PEER, HOST, payload), 1), PEER, HOST)
        }
    }

    fn connected(stack: &NetStack, wire: &Wire, window: u16) -> (Socket, Peer) {
        let s = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
        s.set_nonblocking(true);
        assert_eq!(s.connect(&SockAddr::inet(PEER, 7000)), Err(Error::InProgress));
        let syn = sent(wire).pop().unwrap();
        assert_eq!(syn.hdr.flags, TcpFlags::SYN);
        assert_eq!(syn.hdr.mss, Some(16));

        let mut peer = Peer {
            port: 7000,
            host_port: syn.hdr.src_port,
            seq: 5000,
            ack: syn.hdr.seq.wrapping_add(1),
            window,
        };
        assert!(peer.send(stack, TcpFlags::SYN | TcpFlags::ACK, b"").is_accepted());
        let ack = sent(wire).pop().unwrap();
        assert_eq!(ack.hdr.ack, 5001);
        s.set_nonblocking(false);
        (s, peer)
    }

    fn recv(s: &Socket) -> Result<Vec<u8>> {
        let mut buf = [0u8; 64];
        let n = s.recv(&mut Uio::from_mut_slice(&mut buf))?;
        Ok(buf[..n].to_vec())
    }

    #[test]
    fn test_active_open_and_data() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        assert_eq!(s.state(), SockState::Connected);
        assert_eq!(tcp(&s).tcp_state(), TcpState::Established);
        assert_eq!(s.local_addr().unwrap().as_inet().unwrap().addr, HOST);

        // Split at the MSS
        assert_eq!(s.send(&mut Uio::from_slice(&[7u8; 20])), Ok(20));
        let segs = sent(&wire);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].payload.len(), 16);
        assert_eq!(segs[1].payload.len(), 4);
        assert!(segs[1].has(TcpFlags::PSH));

        peer.ack = peer.ack.wrapping_add(20);
        assert!(peer.send(&stack, TcpFlags::ACK, b"").is_accepted());
        assert!(tcp(&s).lock().pcb.sndq.is_empty());
        assert!(tcp(&s).lock().pcb.rtx.is_none());

        assert!(peer.send(&stack, TcpFlags::ACK | TcpFlags::PSH, b"hello").is_accepted());
        assert_eq!(sent(&wire).last().unwrap().hdr.ack, 5006);
        assert_eq!(recv(&s).unwrap(), b"hello");
    }

    #[test]
    fn test_passive_open() {
        let (stack, wire) = stack(config());
        let l = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
        l.bind(&SockAddr::inet(Ipv4Addr::UNSPECIFIED, 80)).unwrap();
        l.listen(4).unwrap();
        assert_eq!(l.state(), SockState::Listening);

        let mut peer = Peer {
            port: 7000,
            host_port: 80,
            seq: 100,
            ack: 0,
            window: 512,
        };
        assert!(peer.send(&stack, TcpFlags::SYN, b"").is_accepted());
        let synack = sent(&wire).pop().unwrap();
        assert_eq!(synack.hdr.flags, TcpFlags::SYN | TcpFlags::ACK);
        assert_eq!(synack.hdr.ack, 101);

        l.set_nonblocking(true);
        assert_eq!(l.accept().err(), Some(Error::ShouldWait));

        peer.ack = synack.hdr.seq.wrapping_add(1);
        assert!(peer.send(&stack, TcpFlags::ACK | TcpFlags::PSH, b"hi").is_accepted());
        let c = l.accept().unwrap();
        assert_eq!(c.peer_addr(), Ok(SockAddr::inet(PEER, 7000)));
        assert_eq!(c.local_addr(), Ok(SockAddr::inet(HOST, 80)));
        assert_eq!(recv(&c).unwrap(), b"hi");
    }

    #[test]
    fn test_reset_for_closed_port() {
        let (stack, wire) = stack(config());
        let mut peer = Peer {
            port: 7000,
            host_port: 81,
            seq: 1,
            ack: 0,
            window: 512,
        };
        assert_eq!(peer.send(&stack, TcpFlags::SYN, b""), InputResult::Dropped(DropReason::NoSocket));
        let rst = sent(&wire).pop().unwrap();
        assert_eq!(rst.hdr.flags, TcpFlags::RST | TcpFlags::ACK);
        assert_eq!(rst.hdr.ack, 2);
    }

    #[test]
    fn test_backlog_full() {
        let (stack, wire) = stack(config());
        let l = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
        l.bind(&SockAddr::inet(Ipv4Addr::UNSPECIFIED, 80)).unwrap();
        l.listen(1).unwrap();

        let mut first = Peer { port: 7000, host_port: 80, seq: 1, ack: 0, window: 512 };
        let mut second = Peer { port: 7001, ..first };
        assert!(first.send(&stack, TcpFlags::SYN, b"").is_accepted());
        assert_eq!(second.send(&stack, TcpFlags::SYN, b""), InputResult::Dropped(DropReason::BacklogFull));
        assert_eq!(sent(&wire).len(), 1);
    }

    #[test]
    fn test_syn_retransmit_then_reset() {
        let (stack, wire) = stack(config());
        let s = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
        s.set_nonblocking(true);
        assert_eq!(s.connect(&SockAddr::inet(PEER, 7000)), Err(Error::InProgress));
        s.set_nonblocking(false);
        let first = sent(&wire).pop().unwrap();

        let reader = {
            let r = s.dup();
            thread::spawn(move || recv(&r))
        };

        // rto 10ms, doubling: retransmits at 10 and 30, reset at 70
        stack.tick(ms_to_ns(10));
        stack.tick(ms_to_ns(30));
        let resent = sent(&wire);
        assert_eq!(resent.len(), 2);
        assert!(resent.iter().all(|seg| seg.hdr.flags == TcpFlags::SYN && seg.hdr.seq == first.hdr.seq));

        stack.tick(ms_to_ns(69));
        assert_eq!(tcp(&s).tcp_state(), TcpState::SynSent);
        stack.tick(ms_to_ns(70));
        assert_eq!(tcp(&s).tcp_state(), TcpState::Closed);
        assert_eq!(reader.join().unwrap(), Err(Error::ConnectionReset));
        assert_eq!(s.send(&mut Uio::from_slice(b"x")), Err(Error::ConnectionReset));
        assert_eq!(tcp(&s).proto().connection_count(), 0);
    }

    #[test]
    fn test_data_retransmit_and_ack() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        s.send(&mut Uio::from_slice(b"abc")).unwrap();
        let orig = sent(&wire).pop().unwrap();

        stack.tick(ms_to_ns(10));
        let again = sent(&wire).pop().unwrap();
        assert_eq!(again.hdr.seq, orig.hdr.seq);
        assert_eq!(again.payload.as_slice(), b"abc");
        assert_eq!(tcp(&s).lock().pcb.rto, ms_to_ns(20));

        peer.ack = peer.ack.wrapping_add(3);
        peer.send(&stack, TcpFlags::ACK, b"");
        assert!(tcp(&s).lock().pcb.rtx.is_none());
        assert_eq!(tcp(&s).lock().pcb.rto, ms_to_ns(10));
    }

    #[test]
    fn test_rst_wakes_blocked_reader() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        let reader = {
            let r = s.dup();
            thread::spawn(move || recv(&r))
        };
        thread::sleep(Duration::from_millis(20));

        assert!(peer.send(&stack, TcpFlags::RST, b"").is_accepted());
        assert_eq!(reader.join().unwrap(), Err(Error::ConnectionReset));
        assert_eq!(s.state(), SockState::Closed);
    }

    #[test]
    fn test_out_of_order_gets_duplicate_ack() {
        let (stack, wire) = stack(config());
        let (_s, mut peer) = connected(&stack, &wire, 1024);
        peer.seq = peer.seq.wrapping_add(10);
        assert_eq!(peer.send(&stack, TcpFlags::ACK, b"late"), InputResult::Dropped(DropReason::Filtered));
        let dup = sent(&wire).pop().unwrap();
        assert_eq!(dup.hdr.ack, 5001);
        assert!(dup.payload.is_empty());
    }

    #[test]
    fn test_zero_window_probe() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 0);
        assert_eq!(s.send(&mut Uio::from_slice(b"data")), Ok(4));
        assert_eq!(wire.len(), 0);

        stack.tick(ms_to_ns(10));
        let probe = sent(&wire).pop().unwrap();
        assert_eq!(probe.payload.as_slice(), b"d");

        peer.ack = peer.ack.wrapping_add(1);
        peer.window = 1024;
        peer.send(&stack, TcpFlags::ACK, b"");
        let rest = sent(&wire).pop().unwrap();
        assert_eq!(rest.payload.as_slice(), b"ata");
    }

    #[test]
    fn test_active_close() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);

        s.shutdown(Shutdown::Write).unwrap();
        assert_eq!(tcp(&s).tcp_state(), TcpState::FinWait1);
        let fin = sent(&wire).pop().unwrap();
        assert!(fin.has(TcpFlags::FIN));
        assert_eq!(s.send(&mut Uio::from_slice(b"x")), Err(Error::BrokenPipe));

        peer.ack = fin.hdr.seq.wrapping_add(1);
        peer.send(&stack, TcpFlags::ACK, b"");
        assert_eq!(tcp(&s).tcp_state(), TcpState::FinWait2);

        peer.send(&stack, TcpFlags::FIN | TcpFlags::ACK, b"");
        assert_eq!(tcp(&s).tcp_state(), TcpState::Closed);
        assert_eq!(sent(&wire).pop().unwrap().hdr.ack, peer.seq);
        assert_eq!(recv(&s).unwrap(), b"");
    }

    #[test]
    fn test_passive_close() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        let proto = tcp(&s).proto().clone();

        peer.send(&stack, TcpFlags::FIN | TcpFlags::ACK, b"");
        assert_eq!(tcp(&s).tcp_state(), TcpState::CloseWait);
        assert_eq!(recv(&s).unwrap(), b"");

        drop(s);
        let fin = sent(&wire).pop().unwrap();
        assert!(fin.has(TcpFlags::FIN));
        assert_eq!(proto.connection_count(), 1);

        peer.ack = fin.hdr.seq.wrapping_add(1);
        peer.send(&stack, TcpFlags::ACK, b"");
        assert_eq!(proto.connection_count(), 0);
        assert_eq!(proto.allocated(), 0);
    }

    #[test]
    fn test_close_with_unread_data_resets() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        peer.send(&stack, TcpFlags::ACK, b"unread");
        wire.take();

        drop(s);
        let rst = sent(&wire).pop().unwrap();
        assert!(rst.has(TcpFlags::RST));
    }

    #[test]
    fn test_send_waits_for_acks() {
        let (stack, wire) = stack(config());
        let (s, mut peer) = connected(&stack, &wire, 1024);
        let writer = {
            let w = s.dup();
            thread::spawn(move || w.send(&mut Uio::from_slice(&[1u8; 200])))
        };

        let mut acked = 0u32;
        for _ in 0..1000 {
            for seg in sent(&wire) {
                acked += seg.payload.len() as u32;
            }
            peer.ack = tcp(&s).lock().pcb.iss.wrapping_add(1 + acked);
            peer.send(&stack, TcpFlags::ACK, b"");
            if acked == 200 {
                break;
            }
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(acked, 200);
        assert_eq!(writer.join().unwrap(), Ok(200));
    }
}

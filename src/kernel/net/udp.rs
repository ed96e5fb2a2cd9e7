// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! UDP
//!
//! Datagram sockets over IPv4. Sockets are found by local port; a socket
//! bound to a specific address only takes datagrams addressed to it, and a
//! connected socket only takes datagrams from its peer.
//!
//! Sends never block: the datagram goes straight to the network layer.
//! Receives queue up to the configured depth of datagrams, each kept as a
//! view into the packet it arrived in.

use alloc::collections::{BTreeMap, VecDeque};
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kernel::cmdline::StackConfig;
use crate::kernel::lib::ObjectPool;
use crate::kernel::poll::PollEvents;
use crate::kernel::sync::RwLock;
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};

use super::addr::{Ipv4Addr, SockAddr, SockAddrIn};
use super::checksum::Checksum;
use super::netpkt::NetPkt;
use super::socket::{PortAllocator, Protocol, Shutdown, Sock, SockInner, SockState, SockType, UdpSock};
use super::stack::{DropReason, InputResult, NetOutput, IPPROTO_UDP};

// Import logging macros
use crate::{log_debug, log_trace};

/// UDP header size
pub const UDP_HEADER_LEN: usize = 8;

/// Largest payload that fits one IPv4 datagram
pub const UDP_MAX_PAYLOAD: usize = 65507;

/// UDP protocol control block
pub struct UdpPcb {
    local: Option<SockAddrIn>,
    remote: Option<SockAddrIn>,
    rxq: VecDeque<(SockAddrIn, NetPkt)>,
    /// Datagrams dropped on a full queue
    drops: u64,
}

/// UDP family
pub struct UdpProto {
    output: Arc<dyn NetOutput>,
    pool: ObjectPool<UdpSock>,
    ports: RwLock<BTreeMap<u16, Arc<UdpSock>>>,
    ephemeral: PortAllocator,
    queue_depth: usize,
}

impl UdpProto {
    pub fn new(config: &StackConfig, output: Arc<dyn NetOutput>) -> Result<Self> {
        Ok(Self {
            output,
            pool: ObjectPool::new("udp-sock", config.max_sockets)?,
            ports: RwLock::new(BTreeMap::new()),
            ephemeral: PortAllocator::new(config.ephemeral_first, config.ephemeral_last)?,
            queue_depth: config.udp_queue,
        })
    }

    pub fn open(self: &Arc<Self>) -> Result<Arc<UdpSock>> {
        let pcb = UdpPcb {
            local: None,
            remote: None,
            rxq: VecDeque::new(),
            drops: 0,
        };
        Sock::alloc(&self.pool, self.clone(), SockType::Dgram, SockState::Unbound, pcb)
    }

    pub fn allocated(&self) -> usize {
        self.pool.allocated_count()
    }

    /// Claim `addr` (port 0 picks an ephemeral port) for `sock`
    fn bind_locked(&self, sock: &Arc<UdpSock>, inner: &mut SockInner<UdpPcb>, addr: SockAddrIn) -> Result {
        if inner.pcb.local.is_some() {
            return Err(Error::InvalidArgs);
        }

        let mut ports = self.ports.write();
        let port = match addr.port {
            0 => self.ephemeral.pick(|p| ports.contains_key(&p))?,
            p if ports.contains_key(&p) => return Err(Error::AddrInUse),
            p => p,
        };
        ports.insert(port, sock.clone());
        drop(ports);

        inner.pcb.local = Some(SockAddrIn::new(addr.addr, port));
        if inner.state == SockState::Unbound {
            inner.state = SockState::Bound;
        }
        log_debug!("udp socket {}: bound to {}:{}", sock.id(), addr.addr, port);
        Ok(())
    }

    /// Build the datagram `src` -> `dst` carrying `payload`
    fn encode(src: SockAddrIn, dst: SockAddrIn, payload: &[u8]) -> Vec<u8> {
        let len = UDP_HEADER_LEN + payload.len();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&src.port.to_be_bytes());
        buf.extend_from_slice(&dst.port.to_be_bytes());
        buf.extend_from_slice(&(len as u16).to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(payload);

        let mut sum = Checksum::pseudo_header(src.addr, dst.addr, IPPROTO_UDP, len);
        sum.add_bytes(&buf);
        // Zero on the wire means "no checksum"
        let csum = match sum.finish() {
            0 => 0xffff,
            c => c,
        };
        buf[6..8].copy_from_slice(&csum.to_be_bytes());
        buf
    }

    /// Deliver a datagram from the network layer
    pub fn input(&self, pkt: NetPkt, src: Ipv4Addr, dst: Ipv4Addr) -> InputResult {
        let bytes = pkt.as_slice();
        if bytes.len() < UDP_HEADER_LEN {
            return InputResult::Dropped(DropReason::Malformed);
        }
        let sport = u16::from_be_bytes([bytes[0], bytes[1]]);
        let dport = u16::from_be_bytes([bytes[2], bytes[3]]);
        let ulen = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
        let csum = u16::from_be_bytes([bytes[6], bytes[7]]);
        if ulen < UDP_HEADER_LEN || ulen > bytes.len() {
            return InputResult::Dropped(DropReason::Malformed);
        }
        if csum != 0 {
            let mut sum = Checksum::pseudo_header(src, dst, IPPROTO_UDP, ulen);
            sum.add_bytes(&bytes[..ulen]);
            if sum.finish() != 0 {
                return InputResult::Dropped(DropReason::BadChecksum);
            }
        }

        let Some(sock) = self.ports.read().get(&dport).cloned() else {
            return InputResult::Dropped(DropReason::NoSocket);
        };
        let from = SockAddrIn::new(src, sport);

        {
            let mut inner = sock.lock();
            let Some(local) = inner.pcb.local else {
                return InputResult::Dropped(DropReason::NoSocket);
            };
            if inner.is_closed() || inner.shut_rd || (!local.addr.is_unspecified() && local.addr != dst) {
                return InputResult::Dropped(DropReason::NoSocket);
            }
            if inner.pcb.remote.is_some_and(|r| r != from) {
                return InputResult::Dropped(DropReason::Filtered);
            }
            if inner.pcb.rxq.len() >= self.queue_depth {
                inner.pcb.drops += 1;
                return InputResult::Dropped(DropReason::QueueFull);
            }
            inner.pcb.rxq.push_back((from, pkt.slice(UDP_HEADER_LEN..ulen)));
        }
        sock.rx_wait.wake_all();
        log_trace!("udp socket {}: {} bytes from {}", sock.id(), ulen - UDP_HEADER_LEN, from);
        InputResult::Accepted
    }
}

impl Protocol for UdpProto {
    type Pcb = UdpPcb;

    const NAME: &'static str = "udp";

    fn bind(&self, sock: &Arc<UdpSock>, addr: &SockAddr) -> Result {
        let addr = addr.as_inet().ok_or(Error::InvalidArgs)?;
        let mut inner = sock.lock();
        if inner.is_closed() {
            return Err(Error::BadState);
        }
        self.bind_locked(sock, &mut inner, addr)
    }

    /// Set the default destination and accept datagrams only from it
    fn connect(&self, sock: &Arc<UdpSock>, addr: &SockAddr) -> Result {
        let remote = addr.as_inet().ok_or(Error::InvalidArgs)?;
        if remote.port == 0 || remote.addr.is_unspecified() {
            return Err(Error::InvalidArgs);
        }

        let mut inner = sock.lock();
        if inner.is_closed() {
            return Err(Error::BadState);
        }
        if inner.pcb.local.is_none() {
            self.bind_locked(sock, &mut inner, SockAddrIn::default())?;
        }
        inner.pcb.remote = Some(remote);
        inner.state = SockState::Connected;
        log_debug!("udp socket {}: connected to {}", sock.id(), remote);
        Ok(())
    }

    fn send(&self, sock: &Arc<UdpSock>, uio: &mut Uio<'_>, dest: Option<&SockAddr>) -> Result<usize> {
        let len = uio.resid();
        if len > UDP_MAX_PAYLOAD {
            return Err(Error::MessageTooLong);
        }

        let (local, dst) = {
            let mut inner = sock.lock();
            if inner.shut_wr {
                return Err(Error::BrokenPipe);
            }
            let dst = match dest {
                Some(addr) => addr.as_inet().ok_or(Error::InvalidArgs)?,
                None => inner.pcb.remote.ok_or(Error::NotConnected)?,
            };
            if dst.port == 0 {
                return Err(Error::InvalidArgs);
            }
            if inner.pcb.local.is_none() {
                self.bind_locked(sock, &mut inner, SockAddrIn::default())?;
            }
            (inner.pcb.local.ok_or(Error::BadState)?, dst)
        };

        let src_addr = if local.addr.is_unspecified() {
            self.output.local_addr_for(dst.addr).ok_or(Error::NotFound)?
        } else {
            local.addr
        };
        let src = SockAddrIn::new(src_addr, local.port);

        let payload = uio.copy_in_vec(len);
        let datagram = Self::encode(src, dst, &payload);
        self.output.ip_output(src.addr, dst.addr, IPPROTO_UDP, NetPkt::new(datagram, 0))?;
        log_trace!("udp socket {}: {} bytes to {}", sock.id(), len, dst);
        Ok(len)
    }

    /// Receive one datagram; bytes past the caller's buffer are discarded
    fn recv(&self, sock: &Arc<UdpSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
            !i.pcb.rxq.is_empty() || i.shut_rd || i.is_closed()
        })?;
        let Some((from, payload)) = inner.pcb.rxq.pop_front() else {
            return Ok((0, None));
        };
        drop(inner);

        let n = uio.copy_out(payload.as_slice());
        Ok((n, Some(SockAddr::Inet(from))))
    }

    fn shutdown(&self, sock: &Arc<UdpSock>, how: Shutdown) -> Result {
        {
            let mut inner = sock.lock();
            if inner.state != SockState::Connected {
                return Err(Error::NotConnected);
            }
            if how.read() {
                inner.shut_rd = true;
                inner.pcb.rxq.clear();
            }
            if how.write() {
                inner.shut_wr = true;
            }
        }
        sock.wake_all();
        Ok(())
    }

    fn close(&self, sock: &Arc<UdpSock>) {
        let local = {
            let mut inner = sock.lock();
            inner.state = SockState::Closed;
            inner.pcb.rxq.clear();
            inner.pcb.local
        };
        if let Some(local) = local {
            let mut ports = self.ports.write();
            if ports.get(&local.port).is_some_and(|s| Arc::ptr_eq(s, sock)) {
                ports.remove(&local.port);
            }
        }
        sock.wake_all();
    }

    fn poll_events(&self, sock: &UdpSock) -> PollEvents {
        let inner = sock.lock();
        let mut events = PollEvents::empty();
        if !inner.pcb.rxq.is_empty() || inner.shut_rd {
            events |= PollEvents::IN;
        }
        if !inner.shut_wr {
            events |= PollEvents::OUT;
        }
        events
    }

    fn local_addr(&self, sock: &UdpSock) -> Result<SockAddr> {
        Ok(SockAddr::Inet(sock.lock().pcb.local.unwrap_or_default()))
    }

    fn peer_addr(&self, sock: &UdpSock) -> Result<SockAddr> {
        sock.lock().pcb.remote.map(SockAddr::Inet).ok_or(Error::NotConnected)
    }
}

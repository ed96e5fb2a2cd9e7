// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Network Stack
//!
//! [`NetStack`] owns one instance of every protocol family and is the
//! surface the rest of the kernel talks to:
//!
//! - callers open sockets with [`NetStack::socket`]
//! - the network layer delivers demultiplexed packets to
//!   [`NetStack::udp_input`], [`NetStack::tcp_input`] and
//!   [`NetStack::packet_input`]
//! - the scheduler tick calls [`NetStack::tick`], which fires protocol
//!   timers and runs the TCP retransmissions they requested
//!
//! Outbound packets leave through the [`NetOutput`] the stack was built
//! with.
//!
//! # Timers
//!
//! Timer callbacks run from the tick and must not sleep. A TCP
//! retransmission needs the socket mutex, so its callback only queues the
//! socket; the tick then runs the queued work after all callbacks return.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::kernel::cmdline::StackConfig;
use crate::kernel::fs::Namespace;
use crate::kernel::timer::TimerQueue;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::{IfIndex, Nanoseconds};

use super::addr::Ipv4Addr;
use super::local::LocalProto;
use super::netpkt::NetPkt;
use super::packet::PacketProto;
use super::socket::{Family, SockType, Socket};
use super::tcp::TcpProto;
use super::udp::UdpProto;

// Import logging macros
use crate::{log_info, log_trace};

/// IP protocol number of TCP
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number of UDP
pub const IPPROTO_UDP: u8 = 17;
/// Packet-socket protocol matching every frame type
pub const ETH_P_ALL: u16 = 0;

/// ============================================================================
/// Network Layer Interface
/// ============================================================================

/// Transmit path and routing the stack consumes
pub trait NetOutput: Send + Sync {
    /// Send an IPv4 payload (a UDP datagram or TCP segment with its header)
    fn ip_output(&self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, pkt: NetPkt) -> Result;

    /// Send a raw link-layer frame
    fn link_output(&self, ifindex: IfIndex, protocol: u16, pkt: NetPkt) -> Result;

    /// Source address to use toward `dst`, None if unreachable
    fn local_addr_for(&self, dst: Ipv4Addr) -> Option<Ipv4Addr>;
}

/// Why an input packet was not delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header too short or lengths inconsistent
    Malformed,
    /// Checksum did not verify
    BadChecksum,
    /// No socket owns the destination
    NoSocket,
    /// Receive queue of the owning socket is full
    QueueFull,
    /// Listener has no room for another connection
    BacklogFull,
    /// Not acceptable for the connection (sequence, source or state)
    Filtered,
    /// Could not allocate per-connection state
    NoMemory,
    /// Protocol not handled by the stack
    NoProtocol,
}

/// Outcome of an input call, for the network layer's accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputResult {
    Accepted,
    Dropped(DropReason),
}

impl InputResult {
    pub fn is_accepted(&self) -> bool {
        *self == InputResult::Accepted
    }
}

/// ============================================================================
/// Clock
/// ============================================================================

/// Time and timers of one stack, advanced by [`NetStack::tick`]
pub struct NetClock {
    now: AtomicU64,
    timers: TimerQueue,
}

impl NetClock {
    pub const fn new() -> Self {
        Self {
            now: AtomicU64::new(0),
            timers: TimerQueue::new(),
        }
    }

    /// Time of the last tick
    pub fn now(&self) -> Nanoseconds {
        self.now.load(Ordering::Acquire)
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    /// Move the clock forward and fire expired timers
    ///
    /// Time never goes backwards; an older `now` is ignored.
    fn advance(&self, now: Nanoseconds) -> usize {
        let now = self.now.fetch_max(now, Ordering::AcqRel).max(now);
        self.timers.check_timeout(now)
    }
}

impl Default for NetClock {
    fn default() -> Self {
        Self::new()
    }
}

/// ============================================================================
/// Stack
/// ============================================================================

/// All socket families of one kernel instance
pub struct NetStack {
    config: StackConfig,
    clock: Arc<NetClock>,
    local: Arc<LocalProto>,
    packet: Arc<PacketProto>,
    udp: Arc<UdpProto>,
    tcp: Arc<TcpProto>,
}

impl NetStack {
    /// Build a stack
    ///
    /// # Arguments
    ///
    /// * `config` - Buffer sizes, limits and TCP timing
    /// * `ns` - Namespace Unix-domain sockets are named in
    /// * `output` - Transmit path toward the network layer
    ///
    /// # Returns
    ///
    /// `Err(Error::InvalidArgs)` if `config` does not validate
    pub fn new(config: StackConfig, ns: Arc<Namespace>, output: Arc<dyn NetOutput>) -> Result<Self> {
        config.validate()?;
        let clock = Arc::new(NetClock::new());
        let stack = Self {
            local: Arc::new(LocalProto::new(&config, ns)?),
            packet: Arc::new(PacketProto::new(&config, output.clone())?),
            udp: Arc::new(UdpProto::new(&config, output.clone())?),
            tcp: Arc::new(TcpProto::new(&config, output, clock.clone())?),
            clock,
            config,
        };
        log_info!(
            "net: stack up, {} sockets per family, tcp mss {}",
            stack.config.max_sockets,
            stack.config.tcp_mss
        );
        Ok(stack)
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<NetClock> {
        &self.clock
    }

    /// Open a socket
    ///
    /// # Arguments
    ///
    /// * `family` - Protocol family
    /// * `ty` - Socket type
    /// * `protocol` - 0 for the family default; for packet sockets the
    ///   frame type to receive ([`ETH_P_ALL`] for every frame)
    ///
    /// # Returns
    ///
    /// - `Err(Error::NotSupported)` for a family/type/protocol combination
    ///   the stack does not implement
    /// - `Err(Error::NoMemory)` when the family's socket pool is exhausted
    pub fn socket(&self, family: Family, ty: SockType, protocol: u16) -> Result<Socket> {
        let sock = match (family, ty) {
            (Family::Local, SockType::Stream | SockType::Dgram) if protocol == 0 => {
                Socket::Local(self.local.open(ty)?)
            }
            (Family::Packet, SockType::Raw) => Socket::Packet(self.packet.open(protocol)?),
            (Family::Inet, SockType::Stream) if matches!(protocol, 0 | 6) => {
                Socket::Tcp(self.tcp.open()?)
            }
            (Family::Inet, SockType::Dgram) if matches!(protocol, 0 | 17) => {
                Socket::Udp(self.udp.open()?)
            }
            _ => return Err(Error::NotSupported),
        };
        Ok(sock)
    }

    /// Two connected Unix-domain sockets
    pub fn socketpair(&self, ty: SockType) -> Result<(Socket, Socket)> {
        let (a, b) = self.local.socketpair(ty)?;
        Ok((Socket::Local(a), Socket::Local(b)))
    }

    /// Deliver a UDP datagram (header included) addressed `src` -> `dst`
    pub fn udp_input(&self, pkt: NetPkt, src: Ipv4Addr, dst: Ipv4Addr) -> InputResult {
        let res = self.udp.input(pkt, src, dst);
        if let InputResult::Dropped(reason) = res {
            log_trace!("udp: drop {} -> {}: {:?}", src, dst, reason);
        }
        res
    }

    /// Deliver a TCP segment (header included) addressed `src` -> `dst`
    pub fn tcp_input(&self, pkt: NetPkt, src: Ipv4Addr, dst: Ipv4Addr) -> InputResult {
        let res = self.tcp.input(pkt, src, dst);
        if let InputResult::Dropped(reason) = res {
            log_trace!("tcp: drop {} -> {}: {:?}", src, dst, reason);
        }
        res
    }

    /// Deliver an IPv4 payload by protocol number
    pub fn ip_input(&self, protocol: u8, pkt: NetPkt, src: Ipv4Addr, dst: Ipv4Addr) -> InputResult {
        match protocol {
            IPPROTO_TCP => self.tcp_input(pkt, src, dst),
            IPPROTO_UDP => self.udp_input(pkt, src, dst),
            _ => InputResult::Dropped(DropReason::NoProtocol),
        }
    }

    /// Hand a received link-layer frame to the packet sockets
    ///
    /// Returns how many sockets queued it.
    pub fn packet_input(&self, ifindex: IfIndex, protocol: u16, pkt: NetPkt) -> usize {
        self.packet.queue(ifindex, protocol, pkt)
    }

    /// Advance time to `now`: fire expired timers, then run the protocol
    /// work they queued
    pub fn tick(&self, now: Nanoseconds) {
        let fired = self.clock.advance(now);
        if fired > 0 {
            log_trace!("net: tick at {}, {} timers fired", now, fired);
        }
        self.tcp.run_timers();
    }

    /// Sockets currently allocated, all families
    pub fn sockets_allocated(&self) -> usize {
        self.local.allocated() + self.packet.allocated() + self.udp.allocated() + self.tcp.allocated()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! A [`NetOutput`] that records what the stack transmits

    use super::*;
    use crate::kernel::sync::SpinLock;
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;

    /// One transmitted packet
    #[derive(Debug, Clone)]
    pub struct Sent {
        pub src: Ipv4Addr,
        pub dst: Ipv4Addr,
        pub protocol: u8,
        pub ifindex: IfIndex,
        pub bytes: Vec<u8>,
    }

    /// Wire capturing every transmitted packet
    pub struct Wire {
        pub local: Ipv4Addr,
        sent: SpinLock<VecDeque<Sent>>,
    }

    impl Wire {
        pub fn new(local: Ipv4Addr) -> Arc<Self> {
            Arc::new(Self {
                local,
                sent: SpinLock::new(VecDeque::new()),
            })
        }

        pub fn take(&self) -> Vec<Sent> {
            self.sent.lock().drain(..).collect()
        }

        pub fn pop(&self) -> Option<Sent> {
            self.sent.lock().pop_front()
        }

        pub fn len(&self) -> usize {
            self.sent.lock().len()
        }
    }

    impl NetOutput for Wire {
        fn ip_output(&self, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, pkt: NetPkt) -> Result {
            self.sent.lock().push_back(Sent {
                src,
                dst,
                protocol,
                ifindex: 0,
                bytes: pkt.as_slice().to_vec(),
            });
            Ok(())
        }

        fn link_output(&self, ifindex: IfIndex, protocol: u16, pkt: NetPkt) -> Result {
            self.sent.lock().push_back(Sent {
                src: Ipv4Addr::UNSPECIFIED,
                dst: Ipv4Addr::UNSPECIFIED,
                protocol: protocol as u8,
                ifindex,
                bytes: pkt.as_slice().to_vec(),
            });
            Ok(())
        }

        fn local_addr_for(&self, _dst: Ipv4Addr) -> Option<Ipv4Addr> {
            Some(self.local)
        }
    }

    pub fn stack(config: StackConfig) -> (NetStack, Arc<Wire>) {
        let wire = Wire::new(Ipv4Addr::new(10, 0, 0, 1));
        let stack = NetStack::new(config, Arc::new(Namespace::new()), wire.clone()).unwrap();
        (stack, wire)
    }
}

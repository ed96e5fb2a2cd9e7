// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Packet Sockets
//!
//! Raw link-layer access. A packet socket receives every frame of the type
//! it was opened for, optionally narrowed to one interface by `bind`, and
//! transmits raw frames through the link-layer output.
//!
//! The family keeps a table of open sockets with their filters, so the
//! receive path selects targets without touching any socket mutex, then
//! queues into each target in turn.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::kernel::cmdline::StackConfig;
use crate::kernel::lib::ObjectPool;
use crate::kernel::poll::PollEvents;
use crate::kernel::sync::RwLock;
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};
use crate::rustux::types::IfIndex;

use super::addr::SockAddr;
use super::netpkt::NetPkt;
use super::socket::{PacketSock, Protocol, Shutdown, Sock, SockId, SockState, SockType};
use super::stack::{NetOutput, ETH_P_ALL};

// Import logging macros
use crate::{log_debug, log_trace};

/// Which frames a socket receives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Filter {
    protocol: u16,
    ifindex: Option<IfIndex>,
}

impl Filter {
    fn matches(&self, ifindex: IfIndex, protocol: u16) -> bool {
        (self.protocol == ETH_P_ALL || self.protocol == protocol)
            && self.ifindex.map_or(true, |i| i == ifindex)
    }
}

struct Entry {
    sock: Arc<PacketSock>,
    filter: Filter,
}

/// Packet protocol control block
pub struct PacketPcb {
    rxq: VecDeque<(u16, NetPkt)>,
    /// Frames dropped on a full queue
    drops: u64,
}

/// Packet family
pub struct PacketProto {
    output: Arc<dyn NetOutput>,
    pool: ObjectPool<PacketSock>,
    socks: RwLock<Vec<Entry>>,
    queue_depth: usize,
}

impl PacketProto {
    pub fn new(config: &StackConfig, output: Arc<dyn NetOutput>) -> Result<Self> {
        Ok(Self {
            output,
            pool: ObjectPool::new("packet-sock", config.max_sockets)?,
            socks: RwLock::new(Vec::new()),
            queue_depth: config.packet_queue,
        })
    }

    /// Open a socket receiving frames of type `protocol`
    pub fn open(self: &Arc<Self>, protocol: u16) -> Result<Arc<PacketSock>> {
        let pcb = PacketPcb {
            rxq: VecDeque::new(),
            drops: 0,
        };
        let sock = Sock::alloc(&self.pool, self.clone(), SockType::Raw, SockState::Bound, pcb)?;
        self.socks.write().push(Entry {
            sock: sock.clone(),
            filter: Filter {
                protocol,
                ifindex: None,
            },
        });
        Ok(sock)
    }

    pub fn allocated(&self) -> usize {
        self.pool.allocated_count()
    }

    fn filter_of(&self, id: SockId) -> Option<Filter> {
        self.socks.read().iter().find(|e| e.sock.id() == id).map(|e| e.filter)
    }

    /// Queue a received frame on every matching socket
    ///
    /// Returns how many sockets took it.
    pub fn queue(&self, ifindex: IfIndex, protocol: u16, pkt: NetPkt) -> usize {
        let targets: Vec<Arc<PacketSock>> = self
            .socks
            .read()
            .iter()
            .filter(|e| e.filter.matches(ifindex, protocol))
            .map(|e| e.sock.clone())
            .collect();

        let mut delivered = 0;
        for sock in targets {
            {
                let mut inner = sock.lock();
                if inner.is_closed() || inner.shut_rd {
                    continue;
                }
                if inner.pcb.rxq.len() >= self.queue_depth {
                    inner.pcb.drops += 1;
                    log_trace!("packet socket {}: queue full, {} drops", sock.id(), inner.pcb.drops);
                    continue;
                }
                inner.pcb.rxq.push_back((protocol, pkt.clone()));
            }
            sock.rx_wait.wake_all();
            delivered += 1;
        }
        delivered
    }
}

impl Protocol for PacketProto {
    type Pcb = PacketPcb;

    const NAME: &'static str = "packet";

    /// Narrow delivery to one interface (0 = any) and set the frame type
    fn bind(&self, sock: &Arc<PacketSock>, addr: &SockAddr) -> Result {
        let SockAddr::Packet { ifindex, protocol } = *addr else {
            return Err(Error::InvalidArgs);
        };
        if sock.lock().is_closed() {
            return Err(Error::BadState);
        }

        let mut socks = self.socks.write();
        let entry = socks.iter_mut().find(|e| e.sock.id() == sock.id()).ok_or(Error::BadState)?;
        entry.filter = Filter {
            protocol,
            ifindex: (ifindex != 0).then_some(ifindex),
        };
        log_debug!("packet socket {}: bound to if {} type {:#06x}", sock.id(), ifindex, protocol);
        Ok(())
    }

    fn connect(&self, _sock: &Arc<PacketSock>, _addr: &SockAddr) -> Result {
        Err(Error::NotSupported)
    }

    /// Transmit one frame, to `dest` or to the bound interface
    fn send(&self, sock: &Arc<PacketSock>, uio: &mut Uio<'_>, dest: Option<&SockAddr>) -> Result<usize> {
        if sock.lock().shut_wr {
            return Err(Error::BrokenPipe);
        }

        let (ifindex, protocol) = match dest {
            Some(SockAddr::Packet { ifindex, protocol }) => (*ifindex, *protocol),
            Some(_) => return Err(Error::InvalidArgs),
            None => {
                let filter = self.filter_of(sock.id()).ok_or(Error::BadState)?;
                (filter.ifindex.ok_or(Error::NotConnected)?, filter.protocol)
            }
        };
        if ifindex == 0 {
            return Err(Error::InvalidArgs);
        }

        let len = uio.resid();
        if len == 0 {
            return Err(Error::InvalidArgs);
        }
        let frame = NetPkt::new(uio.copy_in_vec(len), ifindex);
        self.output.link_output(ifindex, protocol, frame)?;
        Ok(len)
    }

    fn recv(&self, sock: &Arc<PacketSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
            !i.pcb.rxq.is_empty() || i.shut_rd || i.is_closed()
        })?;
        let Some((protocol, pkt)) = inner.pcb.rxq.pop_front() else {
            return Ok((0, None));
        };
        drop(inner);

        let n = uio.copy_out(pkt.as_slice());
        Ok((
            n,
            Some(SockAddr::Packet {
                ifindex: pkt.ifindex(),
                protocol,
            }),
        ))
    }

    fn shutdown(&self, sock: &Arc<PacketSock>, how: Shutdown) -> Result {
        {
            let mut inner = sock.lock();
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

    fn close(&self, sock: &Arc<PacketSock>) {
        // Out of the table first so no new frames arrive
        self.socks.write().retain(|e| !Arc::ptr_eq(&e.sock, sock));
        {
            let mut inner = sock.lock();
            inner.state = SockState::Closed;
            inner.pcb.rxq.clear();
        }
        sock.wake_all();
    }

    fn poll_events(&self, sock: &PacketSock) -> PollEvents {
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

    fn local_addr(&self, sock: &PacketSock) -> Result<SockAddr> {
        let filter = self.filter_of(sock.id()).ok_or(Error::BadState)?;
        Ok(SockAddr::Packet {
            ifindex: filter.ifindex.unwrap_or(0),
            protocol: filter.protocol,
        })
    }

    fn peer_addr(&self, _sock: &PacketSock) -> Result<SockAddr> {
        Err(Error::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::net::socket::Socket;
    use crate::kernel::net::stack::testing::Wire;
    use crate::kernel::net::addr::Ipv4Addr;

    const ETH_P_IP: u16 = 0x0800;
    const ETH_P_ARP: u16 = 0x0806;

    fn proto(depth: usize) -> (Arc<PacketProto>, Arc<Wire>) {
        let wire = Wire::new(Ipv4Addr::LOCALHOST);
        let config = StackConfig {
            packet_queue: depth,
            ..StackConfig::default()
        };
        (Arc::new(PacketProto::new(&config, wire.clone()).unwrap()), wire)
    }

    fn recv(s: &Socket) -> (Vec<u8>, Option<SockAddr>) {
        let mut buf = [0u8; 64];
        let (n, from) = s.recv_from(&mut Uio::from_mut_slice(&mut buf)).unwrap();
        (buf[..n].to_vec(), from)
    }

    #[test]
    fn test_delivery_by_type_and_interface() {
        let (p, _wire) = proto(8);
        let all = Socket::Packet(p.open(ETH_P_ALL).unwrap());
        let ip = Socket::Packet(p.open(ETH_P_IP).unwrap());
        let arp_if2 = Socket::Packet(p.open(ETH_P_ARP).unwrap());
        arp_if2.bind(&SockAddr::Packet { ifindex: 2, protocol: ETH_P_ARP }).unwrap();

        assert_eq!(p.queue(1, ETH_P_IP, NetPkt::from_slice(b"ip", 1)), 2);
        assert_eq!(p.queue(1, ETH_P_ARP, NetPkt::from_slice(b"arp1", 1)), 1);
        assert_eq!(p.queue(2, ETH_P_ARP, NetPkt::from_slice(b"arp2", 2)), 2);

        assert_eq!(recv(&ip).0, b"ip");
        let (data, from) = recv(&arp_if2);
        assert_eq!(data, b"arp2");
        assert_eq!(from, Some(SockAddr::Packet { ifindex: 2, protocol: ETH_P_ARP }));

        all.set_nonblocking(true);
        assert_eq!(recv(&all).0, b"ip");
        assert_eq!(recv(&all).0, b"arp1");
        assert_eq!(recv(&all).0, b"arp2");
        let mut buf = [0u8; 4];
        assert_eq!(all.recv(&mut Uio::from_mut_slice(&mut buf)), Err(Error::ShouldWait));
    }

    #[test]
    fn test_full_queue_drops() {
        let (p, _wire) = proto(1);
        let s = p.open(ETH_P_ALL).unwrap();
        assert_eq!(p.queue(1, ETH_P_IP, NetPkt::from_slice(b"a", 1)), 1);
        assert_eq!(p.queue(1, ETH_P_IP, NetPkt::from_slice(b"b", 1)), 0);
        assert_eq!(s.lock().pcb.drops, 1);
        drop(Socket::Packet(s));
    }

    #[test]
    fn test_send_needs_interface() {
        let (p, wire) = proto(4);
        let s = Socket::Packet(p.open(ETH_P_IP).unwrap());
        assert_eq!(s.send(&mut Uio::from_slice(b"frame")), Err(Error::NotConnected));

        let dest = SockAddr::Packet { ifindex: 3, protocol: ETH_P_ARP };
        assert_eq!(s.send_to(&mut Uio::from_slice(b"frame"), &dest), Ok(5));
        let sent = wire.pop().unwrap();
        assert_eq!(sent.ifindex, 3);
        assert_eq!(sent.bytes, b"frame");
        assert_eq!(s.connect(&dest), Err(Error::NotSupported));
    }

    #[test]
    fn test_closed_socket_leaves_table() {
        let (p, _wire) = proto(4);
        let s = Socket::Packet(p.open(ETH_P_ALL).unwrap());
        drop(s);
        assert_eq!(p.queue(1, ETH_P_IP, NetPkt::from_slice(b"x", 1)), 0);
        assert_eq!(p.allocated(), 0);
    }
}

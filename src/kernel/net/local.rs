// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Unix-Domain Sockets
//!
//! Stream and datagram sockets named through the [`Namespace`]. Binding
//! creates a socket node and attaches a [`LocalBinding`] to it; connecting
//! and sending-to resolve the name back to the bound socket.
//!
//! # Streams
//!
//! Each connected socket owns a receive ring. A writer copies into its
//! peer's ring and, when the ring is full, sleeps on its own `tx_wait`
//! until the reader drains it. `connect` builds the server-side socket
//! immediately and queues it on the listener; `accept` hands it out.
//!
//! # Datagrams
//!
//! Each socket owns a bounded queue of messages. A sender whose target
//! queue is full sleeps on the target's `tx_wait`.
//!
//! # Lock ordering
//!
//! At most one socket mutex is held at a time. The namespace lock may be
//! taken under a socket mutex, never the other way round.

use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use crate::kernel::cmdline::StackConfig;
use crate::kernel::fs::{Namespace, VNode, VNodeKind};
use crate::kernel::lib::{CBuf, ObjectPool, PoolSlot};
use crate::kernel::poll::PollEvents;
use crate::kernel::uio::Uio;
use crate::rustux::errors::{Error, Result};

use super::addr::SockAddr;
use super::socket::{LocalSock, Protocol, Shutdown, Sock, SockState, SockType};

// Import logging macros
use crate::{log_debug, log_trace};

/// What a socket node carries
pub struct LocalBinding {
    sock: Weak<LocalSock>,
}

/// Listener state, allocated from the family's listener pool
struct Listener {
    backlog: usize,
    pending: VecDeque<Arc<LocalSock>>,
    _slot: PoolSlot,
}

struct Datagram {
    from: Option<String>,
    data: Vec<u8>,
}

/// Unix-domain protocol control block
pub struct LocalPcb {
    /// Bound name
    path: Option<String>,
    node: Option<Arc<VNode>>,
    binding: Option<Arc<LocalBinding>>,
    /// Connected peer, or a datagram socket's default destination
    peer: Option<Weak<LocalSock>>,
    peer_path: Option<String>,
    /// The peer will send nothing more
    peer_closed: bool,
    /// Stream receive ring
    rx: Option<CBuf>,
    /// Datagram receive queue
    dgrams: VecDeque<Datagram>,
    listener: Option<Listener>,
}

impl LocalPcb {
    fn new(ty: SockType, ring: usize) -> Result<Self> {
        let rx = match ty {
            SockType::Stream => Some(CBuf::new(ring).ok_or(Error::InvalidArgs)?),
            _ => None,
        };
        Ok(Self {
            path: None,
            node: None,
            binding: None,
            peer: None,
            peer_path: None,
            peer_closed: false,
            rx,
            dgrams: VecDeque::new(),
            listener: None,
        })
    }

    fn rx_len(&self) -> usize {
        self.rx.as_ref().map_or(0, CBuf::data_avail)
    }

    fn upgrade_peer(&self) -> Option<Arc<LocalSock>> {
        self.peer.as_ref().and_then(Weak::upgrade)
    }
}

/// Unix-domain family
pub struct LocalProto {
    ns: Arc<Namespace>,
    pool: ObjectPool<LocalSock>,
    listeners: ObjectPool<Listener>,
    stream_buf: usize,
    dgram_queue: usize,
    max_backlog: usize,
}

impl LocalProto {
    pub fn new(config: &StackConfig, ns: Arc<Namespace>) -> Result<Self> {
        Ok(Self {
            ns,
            pool: ObjectPool::new("local-sock", config.max_sockets)?,
            listeners: ObjectPool::new("local-listener", config.max_sockets)?,
            stream_buf: config.local_stream_buf,
            dgram_queue: config.local_dgram_queue,
            max_backlog: config.listen_backlog,
        })
    }

    /// Create an unconnected socket
    pub fn open(self: &Arc<Self>, ty: SockType) -> Result<Arc<LocalSock>> {
        if ty == SockType::Raw {
            return Err(Error::NotSupported);
        }
        let pcb = LocalPcb::new(ty, self.stream_buf)?;
        Sock::alloc(&self.pool, self.clone(), ty, SockState::Unbound, pcb)
    }

    /// Create two sockets connected to each other
    pub fn socketpair(self: &Arc<Self>, ty: SockType) -> Result<(Arc<LocalSock>, Arc<LocalSock>)> {
        let a = self.open(ty)?;
        let b = self.open(ty)?;
        for (this, other) in [(&a, &b), (&b, &a)] {
            let mut inner = this.lock();
            inner.pcb.peer = Some(Arc::downgrade(other));
            inner.state = SockState::Connected;
        }
        Ok((a, b))
    }

    /// Sockets currently allocated
    pub fn allocated(&self) -> usize {
        self.pool.allocated_count()
    }

    /// Find the socket bound to `path`
    fn resolve(&self, path: &str) -> Result<Arc<LocalSock>> {
        let node = self.ns.lookup(path)?;
        if node.kind() != VNodeKind::Socket {
            return Err(Error::ConnectionRefused);
        }
        node.attachment::<LocalBinding>()
            .and_then(|b| b.sock.upgrade())
            .ok_or(Error::ConnectionRefused)
    }

    fn connect_stream(&self, sock: &Arc<LocalSock>, path: &str) -> Result {
        let my_path = {
            let inner = sock.lock();
            match inner.state {
                SockState::Connected => return Err(Error::AlreadyConnected),
                SockState::Listening => return Err(Error::InvalidArgs),
                SockState::Closed => return Err(Error::BadState),
                _ => {}
            }
            inner.pcb.path.clone()
        };

        let listener = self.resolve(path)?;
        if listener.ty() != SockType::Stream {
            return Err(Error::WrongType);
        }

        // Server end, already wired to us
        let mut pcb = LocalPcb::new(SockType::Stream, self.stream_buf)?;
        pcb.path = Some(String::from(path));
        pcb.peer = Some(Arc::downgrade(sock));
        pcb.peer_path = my_path;
        let server = Sock::alloc(&self.pool, sock.proto().clone(), SockType::Stream, SockState::Connected, pcb)?;

        let policy = sock.send_policy();
        {
            let l = listener.lock();
            let mut l = policy.wait(&listener.tx_wait, l, |l| match &l.pcb.listener {
                Some(lst) => lst.pending.len() < lst.backlog,
                None => true,
            })?;
            let lst = l.pcb.listener.as_mut().ok_or(Error::ConnectionRefused)?;
            lst.pending.push_back(server.clone());
        }
        listener.rx_wait.wake_all();

        let mut inner = sock.lock();
        inner.pcb.peer = Some(Arc::downgrade(&server));
        inner.pcb.peer_path = Some(String::from(path));
        inner.pcb.peer_closed = false;
        inner.state = SockState::Connected;
        log_debug!("local socket {}: connected to {} (server {})", sock.id(), path, server.id());
        Ok(())
    }

    fn send_stream(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>) -> Result<usize> {
        let peer = {
            let inner = sock.lock();
            if inner.shut_wr {
                return Err(Error::BrokenPipe);
            }
            if inner.state != SockState::Connected {
                return Err(Error::NotConnected);
            }
            inner.pcb.upgrade_peer()
        };
        let peer = peer.ok_or(Error::BrokenPipe)?;
        if uio.is_empty() {
            return Ok(0);
        }

        let policy = sock.send_policy();
        let mut written = 0;
        let mut p = peer.lock();
        loop {
            if p.is_closed() || p.shut_rd {
                return Err(Error::BrokenPipe);
            }
            let n = match p.pcb.rx.as_mut() {
                Some(rx) => rx.write_from(uio, usize::MAX),
                None => return Err(Error::BadState),
            };
            if n > 0 {
                written += n;
                peer.rx_wait.wake_all();
            }
            if uio.is_empty() {
                return Ok(written);
            }

            p = match policy.wait(&sock.tx_wait, p, |p| {
                p.is_closed() || p.shut_rd || p.pcb.rx.as_ref().is_some_and(|rx| !rx.is_full())
            }) {
                Ok(p) => p,
                Err(Error::ShouldWait | Error::TimedOut) if written > 0 => return Ok(written),
                Err(err) => return Err(err),
            };
        }
    }

    fn recv_stream(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        if matches!(inner.state, SockState::Unbound | SockState::Bound | SockState::Listening) {
            return Err(Error::NotConnected);
        }
        if uio.is_empty() {
            return Ok((0, None));
        }

        let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
            i.pcb.rx_len() > 0 || i.pcb.peer_closed || i.shut_rd || i.is_closed()
        })?;
        let n = match inner.pcb.rx.as_mut() {
            Some(rx) => rx.read_into(uio, usize::MAX),
            None => 0,
        };
        let peer = inner.pcb.upgrade_peer();
        drop(inner);

        if n > 0 {
            // The writer sleeps on its own queue
            if let Some(peer) = peer {
                peer.tx_wait.wake_all();
            }
        }
        Ok((n, None))
    }

    fn send_dgram(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>, dest: Option<&SockAddr>) -> Result<usize> {
        let (from, default_peer) = {
            let inner = sock.lock();
            if inner.shut_wr {
                return Err(Error::BrokenPipe);
            }
            (inner.pcb.path.clone(), inner.pcb.peer.clone())
        };

        let target = match dest {
            Some(addr) => self.resolve(addr.as_local().ok_or(Error::InvalidArgs)?)?,
            None => default_peer
                .ok_or(Error::NotConnected)?
                .upgrade()
                .ok_or(Error::ConnectionRefused)?,
        };
        if target.ty() != SockType::Dgram {
            return Err(Error::WrongType);
        }

        let len = uio.resid();
        if len > self.stream_buf {
            return Err(Error::MessageTooLong);
        }
        let data = uio.copy_in_vec(len);

        let policy = sock.send_policy();
        let depth = self.dgram_queue;
        {
            let t = target.lock();
            let mut t = policy.wait(&target.tx_wait, t, |t| {
                t.is_closed() || t.shut_rd || t.pcb.dgrams.len() < depth
            })?;
            if t.is_closed() || t.shut_rd {
                return Err(Error::ConnectionRefused);
            }
            t.pcb.dgrams.push_back(Datagram { from, data });
        }
        target.rx_wait.wake_all();
        log_trace!("local socket {}: {} byte datagram to {}", sock.id(), len, target.id());
        Ok(len)
    }

    fn recv_dgram(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        let mut inner = policy.wait(&sock.rx_wait, inner, |i| {
            !i.pcb.dgrams.is_empty() || i.shut_rd || i.is_closed()
        })?;
        let dgram = inner.pcb.dgrams.pop_front();
        drop(inner);

        match dgram {
            Some(dgram) => {
                sock.tx_wait.wake_all();
                // Excess bytes of the message are discarded
                let n = uio.copy_out(&dgram.data);
                Ok((n, Some(SockAddr::Local(dgram.from.unwrap_or_default()))))
            }
            None => Ok((0, None)),
        }
    }
}

impl Protocol for LocalProto {
    type Pcb = LocalPcb;

    const NAME: &'static str = "local";

    fn bind(&self, sock: &Arc<LocalSock>, addr: &SockAddr) -> Result {
        let path = addr.as_local().ok_or(Error::InvalidArgs)?;

        let mut inner = sock.lock();
        if inner.is_closed() {
            return Err(Error::BadState);
        }
        if inner.pcb.path.is_some() || inner.pcb.node.is_some() {
            return Err(Error::InvalidArgs);
        }

        let node = self.ns.mknod(path, VNodeKind::Socket).map_err(|err| match err {
            Error::AlreadyExists => Error::AddrInUse,
            other => other,
        })?;
        let binding = Arc::new(LocalBinding {
            sock: Arc::downgrade(sock),
        });
        node.attach(binding.clone())?;

        inner.pcb.path = Some(String::from(path));
        inner.pcb.node = Some(node);
        inner.pcb.binding = Some(binding);
        if inner.state == SockState::Unbound {
            inner.state = SockState::Bound;
        }
        log_debug!("local socket {}: bound to {}", sock.id(), path);
        Ok(())
    }

    fn connect(&self, sock: &Arc<LocalSock>, addr: &SockAddr) -> Result {
        let path = addr.as_local().ok_or(Error::InvalidArgs)?;
        match sock.ty() {
            SockType::Stream => self.connect_stream(sock, path),
            _ => {
                let peer = self.resolve(path)?;
                if peer.ty() != sock.ty() {
                    return Err(Error::WrongType);
                }
                let mut inner = sock.lock();
                if inner.is_closed() {
                    return Err(Error::BadState);
                }
                inner.pcb.peer = Some(Arc::downgrade(&peer));
                inner.pcb.peer_path = Some(String::from(path));
                inner.state = SockState::Connected;
                Ok(())
            }
        }
    }

    fn listen(&self, sock: &Arc<LocalSock>, backlog: usize) -> Result {
        if sock.ty() != SockType::Stream {
            return Err(Error::NotSupported);
        }

        let backlog = backlog.clamp(1, self.max_backlog);
        let mut inner = sock.lock();
        match inner.state {
            SockState::Bound | SockState::Listening => {}
            SockState::Unbound => return Err(Error::InvalidArgs),
            _ => return Err(Error::BadState),
        }

        match inner.pcb.listener.as_mut() {
            Some(lst) => lst.backlog = backlog,
            None => {
                inner.pcb.listener = Some(Listener {
                    backlog,
                    pending: VecDeque::new(),
                    _slot: self.listeners.reserve()?,
                });
            }
        }
        inner.state = SockState::Listening;
        drop(inner);

        // A larger backlog may admit blocked connectors
        sock.tx_wait.wake_all();
        log_debug!("local socket {}: listening, backlog {}", sock.id(), backlog);
        Ok(())
    }

    fn accept(&self, sock: &Arc<LocalSock>) -> Result<Arc<LocalSock>> {
        let policy = sock.recv_policy();
        let inner = sock.lock();
        if inner.pcb.listener.is_none() {
            return Err(Error::InvalidArgs);
        }

        let mut inner = policy.wait(&sock.rx_wait, inner, |i| match &i.pcb.listener {
            Some(lst) => !lst.pending.is_empty(),
            None => true,
        })?;
        let child = inner
            .pcb
            .listener
            .as_mut()
            .and_then(|lst| lst.pending.pop_front())
            .ok_or(Error::BadState)?;
        drop(inner);

        sock.tx_wait.wake_all();
        Ok(child)
    }

    fn send(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>, dest: Option<&SockAddr>) -> Result<usize> {
        match sock.ty() {
            SockType::Stream => self.send_stream(sock, uio),
            _ => self.send_dgram(sock, uio, dest),
        }
    }

    fn recv(&self, sock: &Arc<LocalSock>, uio: &mut Uio<'_>) -> Result<(usize, Option<SockAddr>)> {
        match sock.ty() {
            SockType::Stream => self.recv_stream(sock, uio),
            _ => self.recv_dgram(sock, uio),
        }
    }

    fn shutdown(&self, sock: &Arc<LocalSock>, how: Shutdown) -> Result {
        let peer = {
            let mut inner = sock.lock();
            if sock.ty() == SockType::Stream && inner.state != SockState::Connected {
                return Err(Error::NotConnected);
            }
            if how.read() {
                inner.shut_rd = true;
                if let Some(rx) = inner.pcb.rx.as_mut() {
                    rx.clear();
                }
                inner.pcb.dgrams.clear();
            }
            if how.write() {
                inner.shut_wr = true;
            }
            inner.pcb.upgrade_peer()
        };
        sock.wake_all();

        if sock.ty() == SockType::Stream {
            if let Some(peer) = peer {
                if how.write() {
                    peer.lock().pcb.peer_closed = true;
                }
                // Our reads stopped or their writes have no reader
                peer.wake_all();
            }
        }
        Ok(())
    }

    fn close(&self, sock: &Arc<LocalSock>) {
        let (peer, node, binding, listener) = {
            let mut inner = sock.lock();
            inner.state = SockState::Closed;
            inner.shut_rd = true;
            inner.shut_wr = true;
            (
                inner.pcb.peer.take(),
                inner.pcb.node.take(),
                inner.pcb.binding.take(),
                inner.pcb.listener.take(),
            )
        };
        sock.wake_all();

        if let (Some(node), Some(binding)) = (node, binding) {
            node.detach(&binding);
            self.ns.unlink_node(&node);
        }

        // Connections nobody accepted
        if let Some(lst) = listener {
            for child in lst.pending {
                child.release();
            }
        }

        if sock.ty() == SockType::Stream {
            if let Some(peer) = peer.as_ref().and_then(Weak::upgrade) {
                peer.lock().pcb.peer_closed = true;
                peer.wake_all();
            }
        }
    }

    fn poll_events(&self, sock: &LocalSock) -> PollEvents {
        let mut events = PollEvents::empty();
        let peer = {
            let inner = sock.lock();
            if let Some(lst) = &inner.pcb.listener {
                if !lst.pending.is_empty() {
                    events |= PollEvents::IN;
                }
                return events;
            }

            match sock.ty() {
                SockType::Stream => {
                    if inner.pcb.rx_len() > 0 || inner.shut_rd {
                        events |= PollEvents::IN;
                    }
                    if inner.pcb.peer_closed {
                        events |= PollEvents::IN | PollEvents::HUP;
                    }
                    if inner.state != SockState::Connected || inner.shut_wr {
                        return events;
                    }
                    inner.pcb.upgrade_peer()
                }
                _ => {
                    if !inner.pcb.dgrams.is_empty() {
                        events |= PollEvents::IN;
                    }
                    if !inner.shut_wr {
                        events |= PollEvents::OUT;
                    }
                    return events;
                }
            }
        };

        // Writable when the peer's ring has room
        if let Some(peer) = peer {
            let p = peer.lock();
            if p.is_closed() || p.shut_rd {
                events |= PollEvents::ERR;
            } else if p.pcb.rx.as_ref().is_some_and(|rx| !rx.is_full()) {
                events |= PollEvents::OUT;
            }
        }
        events
    }

    fn local_addr(&self, sock: &LocalSock) -> Result<SockAddr> {
        let inner = sock.lock();
        Ok(SockAddr::Local(inner.pcb.path.clone().unwrap_or_default()))
    }

    fn peer_addr(&self, sock: &LocalSock) -> Result<SockAddr> {
        let inner = sock.lock();
        if inner.state != SockState::Connected {
            return Err(Error::NotConnected);
        }
        Ok(SockAddr::Local(inner.pcb.peer_path.clone().unwrap_or_default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::net::socket::Socket;
    use std::thread;
    use std::time::Duration;

    fn proto() -> Arc<LocalProto> {
        let config = StackConfig {
            local_stream_buf: 32,
            local_dgram_queue: 2,
            ..StackConfig::default()
        };
        Arc::new(LocalProto::new(&config, Arc::new(Namespace::new())).unwrap())
    }

    fn open(p: &Arc<LocalProto>, ty: SockType) -> Socket {
        Socket::Local(p.open(ty).unwrap())
    }

    fn send(s: &Socket, data: &[u8]) -> Result<usize> {
        s.send(&mut Uio::from_slice(data))
    }

    fn recv(s: &Socket, max: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let n = s.recv(&mut Uio::from_mut_slice(&mut buf))?;
        buf.truncate(n);
        Ok(buf)
    }

    #[test]
    fn test_stream_connect_accept_exchange() {
        let p = proto();
        let server = open(&p, SockType::Stream);
        server.bind(&SockAddr::local("/srv")).unwrap();
        server.listen(4).unwrap();

        let client = open(&p, SockType::Stream);
        client.connect(&SockAddr::local("/srv")).unwrap();
        let conn = server.accept().unwrap();

        assert_eq!(send(&client, b"hello"), Ok(5));
        assert_eq!(recv(&conn, 16).unwrap(), b"hello");
        assert_eq!(send(&conn, b"back"), Ok(4));
        assert_eq!(recv(&client, 16).unwrap(), b"back");

        assert_eq!(conn.local_addr(), Ok(SockAddr::local("/srv")));
        assert_eq!(client.peer_addr(), Ok(SockAddr::local("/srv")));

        // Peer close: buffered data first, then end of stream
        send(&client, b"bye").unwrap();
        drop(client);
        assert_eq!(recv(&conn, 16).unwrap(), b"bye");
        assert_eq!(recv(&conn, 16).unwrap(), b"");
        assert_eq!(send(&conn, b"x"), Err(Error::BrokenPipe));
    }

    #[test]
    fn test_connect_refused_and_missing() {
        let p = proto();
        let client = open(&p, SockType::Stream);
        assert_eq!(client.connect(&SockAddr::local("/nowhere")), Err(Error::NotFound));

        let bound = open(&p, SockType::Stream);
        bound.bind(&SockAddr::local("/bound")).unwrap();
        assert_eq!(client.connect(&SockAddr::local("/bound")), Err(Error::ConnectionRefused));

        let dgram = open(&p, SockType::Dgram);
        dgram.bind(&SockAddr::local("/dgram")).unwrap();
        assert_eq!(client.connect(&SockAddr::local("/dgram")), Err(Error::WrongType));
    }

    #[test]
    fn test_bind_in_use_and_unlink_on_close() {
        let p = proto();
        let a = open(&p, SockType::Dgram);
        a.bind(&SockAddr::local("/a")).unwrap();
        let b = open(&p, SockType::Dgram);
        assert_eq!(b.bind(&SockAddr::local("/a")), Err(Error::AddrInUse));

        drop(a);
        assert_eq!(b.bind(&SockAddr::local("/a")), Ok(()));
    }

    #[test]
    fn test_backlog_full_nonblocking() {
        let p = proto();
        let server = open(&p, SockType::Stream);
        server.bind(&SockAddr::local("/busy")).unwrap();
        server.listen(1).unwrap();

        let c1 = open(&p, SockType::Stream);
        c1.connect(&SockAddr::local("/busy")).unwrap();
        let c2 = open(&p, SockType::Stream);
        c2.set_nonblocking(true);
        assert_eq!(c2.connect(&SockAddr::local("/busy")), Err(Error::ShouldWait));

        let _conn = server.accept().unwrap();
        assert_eq!(c2.connect(&SockAddr::local("/busy")), Ok(()));
    }

    #[test]
    fn test_listener_close_resets_pending() {
        let p = proto();
        let server = open(&p, SockType::Stream);
        server.bind(&SockAddr::local("/gone")).unwrap();
        server.listen(4).unwrap();
        let client = open(&p, SockType::Stream);
        client.connect(&SockAddr::local("/gone")).unwrap();

        drop(server);
        assert_eq!(recv(&client, 8).unwrap(), b"");
        assert_eq!(send(&client, b"x"), Err(Error::BrokenPipe));
    }

    #[test]
    fn test_stream_backpressure() {
        let p = proto();
        let (a, b) = p.socketpair(SockType::Stream).unwrap();
        let (a, b) = (Socket::Local(a), Socket::Local(b));

        let data: Vec<u8> = (0..200u8).collect();
        let writer = {
            let data = data.clone();
            thread::spawn(move || send(&a, &data))
        };

        let mut got = Vec::new();
        while got.len() < data.len() {
            thread::sleep(Duration::from_millis(1));
            got.extend(recv(&b, 13).unwrap());
        }
        assert_eq!(writer.join().unwrap(), Ok(200));
        assert_eq!(got, data);
    }

    #[test]
    fn test_dgram_socketpair_and_queue_limit() {
        let p = proto();
        let (a, b) = p.socketpair(SockType::Dgram).unwrap();
        let (a, b) = (Socket::Local(a), Socket::Local(b));
        a.set_nonblocking(true);

        assert_eq!(send(&a, b"one"), Ok(3));
        assert_eq!(send(&a, b"two"), Ok(3));
        assert_eq!(send(&a, b"three"), Err(Error::ShouldWait));

        // Truncated to the buffer, rest of the message dropped
        assert_eq!(recv(&b, 2).unwrap(), b"on");
        assert_eq!(recv(&b, 8).unwrap(), b"two");
        assert_eq!(send(&a, &[0u8; 33]), Err(Error::MessageTooLong));
    }

    #[test]
    fn test_shutdown_write_gives_peer_eof() {
        let p = proto();
        let (a, b) = p.socketpair(SockType::Stream).unwrap();
        let (a, b) = (Socket::Local(a), Socket::Local(b));

        send(&a, b"last").unwrap();
        a.shutdown(Shutdown::Write).unwrap();
        assert_eq!(send(&a, b"x"), Err(Error::BrokenPipe));
        assert_eq!(recv(&b, 8).unwrap(), b"last");
        assert_eq!(recv(&b, 8).unwrap(), b"");
        // The other direction still works
        send(&b, b"ok").unwrap();
        assert_eq!(recv(&a, 8).unwrap(), b"ok");
    }

    #[test]
    fn test_pool_accounting() {
        let p = proto();
        let s = open(&p, SockType::Stream);
        let dup = s.dup();
        assert_eq!(s.open_count(), 2);
        drop(s);
        assert_eq!(p.allocated(), 1);
        drop(dup);
        assert_eq!(p.allocated(), 0);
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Stream Tests
//!
//! The same randomized transfer through every byte-stream object: writes
//! and reads of random sizes on two threads must deliver the exact byte
//! sequence, whatever the buffer sizes.

use std::thread;

use alloc::vec::Vec;
use rand::{thread_rng, Rng};

use super::loopback::{Loopback, Ticker};
use crate::kernel::cmdline::StackConfig;
use crate::kernel::net::{Family, Ipv4Addr, Shutdown, SockAddr, SockType};
use crate::kernel::object::Pipes;
use crate::kernel::uio::Uio;
use crate::rustux::errors::Result;

const TOTAL: usize = 64 * 1024;

fn pattern() -> Vec<u8> {
    let mut rng = thread_rng();
    (0..TOTAL).map(|_| rng.gen()).collect()
}

/// Write `data` in random-sized pieces, then call `done`
fn writer<W, D>(data: Vec<u8>, mut write: W, done: D) -> thread::JoinHandle<()>
where
    W: FnMut(&mut Uio<'_>) -> Result<usize> + Send + 'static,
    D: FnOnce() + Send + 'static,
{
    thread::spawn(move || {
        let mut rng = thread_rng();
        let mut off = 0;
        while off < data.len() {
            let len = rng.gen_range(1..=1500).min(data.len() - off);
            let mut uio = Uio::from_slice(&data[off..off + len]);
            while !uio.is_empty() {
                write(&mut uio).unwrap();
            }
            off += len;
        }
        done();
    })
}

/// Read with random-sized buffers until end of stream
fn drain<R>(mut read: R) -> Vec<u8>
where
    R: FnMut(&mut Uio<'_>) -> Result<usize>,
{
    let mut rng = thread_rng();
    let mut out = Vec::with_capacity(TOTAL);
    let mut buf = [0u8; 2048];
    loop {
        let len = rng.gen_range(1..=buf.len());
        let n = read(&mut Uio::from_mut_slice(&mut buf[..len])).unwrap();
        if n == 0 {
            return out;
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[test]
fn test_random_pipe_transfer() {
    let config = StackConfig {
        pipe_capacity: 512,
        ..StackConfig::default()
    };
    let pipes = Pipes::new(&config).unwrap();
    let (rd, wr) = pipes.pipe().unwrap();
    let data = pattern();

    // Dropping the write end is the end of stream
    let w = writer(data.clone(), move |uio| wr.write(uio), || {});
    assert_eq!(drain(|uio| rd.read(uio)), data);
    w.join().unwrap();
}

#[test]
fn test_random_local_stream_transfer() {
    let config = StackConfig {
        local_stream_buf: 1000,
        ..StackConfig::default()
    };
    let (stack, _lo) = Loopback::stack(config);
    let (x, y) = stack.socketpair(SockType::Stream).unwrap();
    let data = pattern();

    let w = writer(data.clone(), move |uio| x.send(uio), || {});
    assert_eq!(drain(|uio| y.recv(uio)), data);
    w.join().unwrap();
}

#[test]
fn test_random_tcp_transfer() {
    let config = StackConfig {
        tcp_sndbuf: 3000,
        tcp_rcvbuf: 2500,
        tcp_mss: 700,
        ..StackConfig::default()
    };
    let (stack, _lo) = Loopback::stack(config);
    let _ticker = Ticker::start(&stack);
    let l = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
    l.bind(&SockAddr::inet(Ipv4Addr::UNSPECIFIED, 5001)).unwrap();
    l.listen(1).unwrap();

    let client = stack.socket(Family::Inet, SockType::Stream, 0).unwrap();
    client.connect(&SockAddr::inet(Ipv4Addr::LOCALHOST, 5001)).unwrap();
    let server = l.accept().unwrap();
    let data = pattern();

    let tx = client.dup();
    let w = writer(data.clone(), move |uio| tx.send(uio), move || {
        client.shutdown(Shutdown::Write).unwrap();
    });
    assert_eq!(drain(|uio| server.recv(uio)), data);
    w.join().unwrap();
}

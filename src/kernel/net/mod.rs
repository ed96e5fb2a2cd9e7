// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Sockets
//!
//! The socket layer and its protocol families, sitting between callers
//! and a network layer that routes, fragments and talks to devices.
//!
//! # Modules
//!
//! - [`addr`] - Socket addresses
//! - [`netpkt`] - Packet buffers handed across the network-layer boundary
//! - [`checksum`] - Internet checksum
//! - [`socket`] - Generic socket, protocol interface, tagged handle
//! - [`local`] - Unix-domain streams and datagrams
//! - [`packet`] - Raw link-layer frames
//! - [`udp`] - UDP
//! - [`tcp`] - TCP
//! - [`stack`] - Family registry, input entry points, timer tick

pub mod addr;
pub mod checksum;
pub mod local;
pub mod netpkt;
pub mod packet;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;

// Re-exports
pub use addr::{Ipv4Addr, SockAddr, SockAddrIn};
pub use netpkt::NetPkt;
pub use socket::{Family, Shutdown, SockOptions, SockState, SockType, Socket};
pub use stack::{DropReason, InputResult, NetClock, NetOutput, NetStack};
pub use tcp::TcpState;

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Socket Addresses

use alloc::string::String;
use core::fmt;

use crate::rustux::types::IfIndex;

/// IPv4 address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Ipv4Addr(pub [u8; 4]);

impl Ipv4Addr {
    /// 0.0.0.0
    pub const UNSPECIFIED: Self = Self([0, 0, 0, 0]);
    /// 127.0.0.1
    pub const LOCALHOST: Self = Self([127, 0, 0, 1]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub const fn octets(&self) -> [u8; 4] {
        self.0
    }

    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }

    pub const fn to_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn from_u32(v: u32) -> Self {
        Self(v.to_be_bytes())
    }
}

impl fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d] = self.0;
        write!(f, "{}.{}.{}.{}", a, b, c, d)
    }
}

impl fmt::Debug for Ipv4Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// IPv4 address and port
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct SockAddrIn {
    pub addr: Ipv4Addr,
    pub port: u16,
}

impl SockAddrIn {
    pub const fn new(addr: Ipv4Addr, port: u16) -> Self {
        Self { addr, port }
    }
}

impl fmt::Display for SockAddrIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

impl fmt::Debug for SockAddrIn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Address of any family
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SockAddr {
    /// Unix-domain path name
    Local(String),
    /// IPv4 endpoint
    Inet(SockAddrIn),
    /// Link-layer interface and frame type
    Packet { ifindex: IfIndex, protocol: u16 },
}

impl SockAddr {
    /// Path-named local address
    pub fn local(path: &str) -> Self {
        SockAddr::Local(String::from(path))
    }

    /// IPv4 endpoint
    pub fn inet(addr: Ipv4Addr, port: u16) -> Self {
        SockAddr::Inet(SockAddrIn::new(addr, port))
    }

    pub fn as_local(&self) -> Option<&str> {
        match self {
            SockAddr::Local(path) => Some(path),
            _ => None,
        }
    }

    pub fn as_inet(&self) -> Option<SockAddrIn> {
        match self {
            SockAddr::Inet(sin) => Some(*sin),
            _ => None,
        }
    }
}

impl fmt::Display for SockAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SockAddr::Local(path) => write!(f, "local:{}", path),
            SockAddr::Inet(sin) => write!(f, "{}", sin),
            SockAddr::Packet { ifindex, protocol } => {
                write!(f, "if{}/{:#06x}", ifindex, protocol)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn test_addr_display() {
        assert_eq!(Ipv4Addr::new(10, 0, 0, 1).to_string(), "10.0.0.1");
        assert_eq!(SockAddr::inet(Ipv4Addr::LOCALHOST, 80).to_string(), "127.0.0.1:80");
        assert_eq!(
            SockAddr::Packet { ifindex: 2, protocol: 0x0806 }.to_string(),
            "if2/0x0806"
        );
    }

    #[test]
    fn test_u32_conversion() {
        let a = Ipv4Addr::new(192, 168, 1, 2);
        assert_eq!(a.to_u32(), 0xc0a8_0102);
        assert_eq!(Ipv4Addr::from_u32(0xc0a8_0102), a);
        assert!(Ipv4Addr::UNSPECIFIED.is_unspecified());
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Internet Checksum
//!
//! RFC 1071 ones'-complement sum, with the IPv4 pseudo-header UDP and TCP
//! fold into their checksums.

use super::addr::Ipv4Addr;

/// Running ones'-complement sum
#[derive(Debug, Clone, Copy, Default)]
pub struct Checksum {
    sum: u64,
    /// Odd trailing byte of the previous chunk
    pending: Option<u8>,
}

impl Checksum {
    pub const fn new() -> Self {
        Self { sum: 0, pending: None }
    }

    /// Start with the pseudo-header of a `len`-byte segment
    pub fn pseudo_header(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, len: usize) -> Self {
        let mut c = Self::new();
        c.add_bytes(&src.octets());
        c.add_bytes(&dst.octets());
        c.add_u16(protocol as u16);
        c.add_u16(len as u16);
        c
    }

    pub fn add_u16(&mut self, v: u16) {
        self.add_bytes(&v.to_be_bytes());
    }

    /// Add bytes; chunks may have odd lengths
    pub fn add_bytes(&mut self, mut data: &[u8]) {
        if let Some(hi) = self.pending.take() {
            match data.split_first() {
                Some((&lo, rest)) => {
                    self.sum += u16::from_be_bytes([hi, lo]) as u64;
                    data = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return;
                }
            }
        }

        let mut words = data.chunks_exact(2);
        for w in &mut words {
            self.sum += u16::from_be_bytes([w[0], w[1]]) as u64;
        }
        if let [last] = words.remainder() {
            self.pending = Some(*last);
        }
        self.fold();
    }

    fn fold(&mut self) {
        while self.sum > 0xffff {
            self.sum = (self.sum & 0xffff) + (self.sum >> 16);
        }
    }

    /// Final checksum value
    pub fn finish(mut self) -> u16 {
        if let Some(hi) = self.pending.take() {
            self.sum += u16::from_be_bytes([hi, 0]) as u64;
        }
        self.fold();
        !(self.sum as u16)
    }
}

/// Checksum of `data` alone
pub fn checksum(data: &[u8]) -> u16 {
    let mut c = Checksum::new();
    c.add_bytes(data);
    c.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1071_example() {
        // Sum of 0001 f203 f4f5 f6f7 is ddf2 after folding
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(checksum(&data), !0xddf2);
    }

    #[test]
    fn test_odd_chunks_match_whole() {
        let data: alloc::vec::Vec<u8> = (0..=200u8).collect();
        let mut c = Checksum::new();
        c.add_bytes(&data[..3]);
        c.add_bytes(&data[3..4]);
        c.add_bytes(&data[4..101]);
        c.add_bytes(&[]);
        c.add_bytes(&data[101..]);
        assert_eq!(c.finish(), checksum(&data));
    }

    #[test]
    fn test_verifies_to_zero() {
        let mut data = alloc::vec![0x45, 0x00, 0x00, 0x1c, 0x12, 0x34, 0x00, 0x00, 0x40, 0x11];
        let sum = checksum(&data);
        data.extend_from_slice(&sum.to_be_bytes());
        assert_eq!(checksum(&data), 0);
    }
}

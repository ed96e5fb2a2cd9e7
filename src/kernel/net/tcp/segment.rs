// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! TCP Segment Codec
//!
//! Header parsing and building, and modular sequence arithmetic. The only
//! option understood is MSS; it is sent on SYN segments and read from
//! incoming ones, every other option is skipped.
//!
//! # Header layout
//!
//! ```text
//!  0               2               4
//! +---------------+---------------+
//! |  source port  |  dest port    |
//! +---------------+---------------+
//! |        sequence number        |
//! +-------------------------------+
//! |     acknowledgment number     |
//! +-------+-------+---------------+
//! |off|rsv| flags |    window     |
//! +-------+-------+---------------+
//! |   checksum    |  urgent ptr   |
//! +---------------+---------------+
//! |     options (off*4 - 20)      |
//! +-------------------------------+
//! ```

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::kernel::net::addr::{Ipv4Addr, SockAddrIn};
use crate::kernel::net::checksum::Checksum;
use crate::kernel::net::netpkt::NetPkt;
use crate::kernel::net::stack::{DropReason, IPPROTO_TCP};

/// Header size without options
pub const TCP_HEADER_LEN: usize = 20;

/// MSS assumed when the peer sends none
pub const TCP_DEFAULT_MSS: u16 = 536;

const OPT_END: u8 = 0;
const OPT_NOP: u8 = 1;
const OPT_MSS: u8 = 2;

bitflags! {
    /// TCP control bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// ============================================================================
/// Sequence Arithmetic
/// ============================================================================

#[inline]
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

#[inline]
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

#[inline]
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

#[inline]
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// ============================================================================
/// Header
/// ============================================================================

/// Fields of a TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    /// MSS option
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Build the segment `src` -> `dst` with this header and `payload`
    pub fn encode(&self, src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
        let opt_len = if self.mss.is_some() { 4 } else { 0 };
        let hdr_len = TCP_HEADER_LEN + opt_len;
        let mut buf = Vec::with_capacity(hdr_len + payload.len());

        buf.extend_from_slice(&self.src_port.to_be_bytes());
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf.extend_from_slice(&self.seq.to_be_bytes());
        buf.extend_from_slice(&self.ack.to_be_bytes());
        buf.push(((hdr_len / 4) as u8) << 4);
        buf.push(self.flags.bits());
        buf.extend_from_slice(&self.window.to_be_bytes());
        buf.extend_from_slice(&[0, 0, 0, 0]);
        if let Some(mss) = self.mss {
            buf.extend_from_slice(&[OPT_MSS, 4]);
            buf.extend_from_slice(&mss.to_be_bytes());
        }
        buf.extend_from_slice(payload);

        let mut sum = Checksum::pseudo_header(src, dst, IPPROTO_TCP, buf.len());
        sum.add_bytes(&buf);
        let csum = sum.finish();
        buf[16..18].copy_from_slice(&csum.to_be_bytes());
        buf
    }
}

/// A received segment
#[derive(Debug, Clone)]
pub struct Segment {
    pub hdr: TcpHeader,
    pub payload: NetPkt,
}

impl Segment {
    /// Parse and verify a segment that arrived `src` -> `dst`
    pub fn parse(src: Ipv4Addr, dst: Ipv4Addr, pkt: &NetPkt) -> core::result::Result<Self, DropReason> {
        let b = pkt.as_slice();
        if b.len() < TCP_HEADER_LEN {
            return Err(DropReason::Malformed);
        }
        let hdr_len = usize::from(b[12] >> 4) * 4;
        if hdr_len < TCP_HEADER_LEN || hdr_len > b.len() {
            return Err(DropReason::Malformed);
        }

        let mut sum = Checksum::pseudo_header(src, dst, IPPROTO_TCP, b.len());
        sum.add_bytes(b);
        if sum.finish() != 0 {
            return Err(DropReason::BadChecksum);
        }

        let hdr = TcpHeader {
            src_port: u16::from_be_bytes([b[0], b[1]]),
            dst_port: u16::from_be_bytes([b[2], b[3]]),
            seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            flags: TcpFlags::from_bits_truncate(b[13]),
            window: u16::from_be_bytes([b[14], b[15]]),
            mss: parse_mss(&b[TCP_HEADER_LEN..hdr_len])?,
        };
        Ok(Self {
            hdr,
            payload: pkt.skip(hdr_len),
        })
    }

    pub fn has(&self, flags: TcpFlags) -> bool {
        self.hdr.flags.contains(flags)
    }

    /// Sequence space the segment occupies
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(TcpFlags::SYN) {
            len += 1;
        }
        if self.has(TcpFlags::FIN) {
            len += 1;
        }
        len
    }

    pub fn src(&self, addr: Ipv4Addr) -> SockAddrIn {
        SockAddrIn::new(addr, self.hdr.src_port)
    }

    pub fn dst(&self, addr: Ipv4Addr) -> SockAddrIn {
        SockAddrIn::new(addr, self.hdr.dst_port)
    }
}

fn parse_mss(mut opts: &[u8]) -> core::result::Result<Option<u16>, DropReason> {
    let mut mss = None;
    while let Some(&kind) = opts.first() {
        match kind {
            OPT_END => break,
            OPT_NOP => opts = &opts[1..],
            _ => {
                let len = usize::from(*opts.get(1).ok_or(DropReason::Malformed)?);
                if len < 2 || len > opts.len() {
                    return Err(DropReason::Malformed);
                }
                if kind == OPT_MSS && len == 4 {
                    mss = Some(u16::from_be_bytes([opts[2], opts[3]]));
                }
                opts = &opts[len..];
            }
        }
    }
    Ok(mss)
}

/// Reset answering `seg`, which reached no connection
///
/// Returns None when `seg` is itself a reset.
pub fn reset_for(seg: &Segment) -> Option<TcpHeader> {
    if seg.has(TcpFlags::RST) {
        return None;
    }
    let hdr = if seg.has(TcpFlags::ACK) {
        TcpHeader {
            src_port: seg.hdr.dst_port,
            dst_port: seg.hdr.src_port,
            seq: seg.hdr.ack,
            ack: 0,
            flags: TcpFlags::RST,
            window: 0,
            mss: None,
        }
    } else {
        TcpHeader {
            src_port: seg.hdr.dst_port,
            dst_port: seg.hdr.src_port,
            seq: 0,
            ack: seg.hdr.seq.wrapping_add(seg.seq_len()),
            flags: TcpFlags::RST | TcpFlags::ACK,
            window: 0,
            mss: None,
        }
    };
    Some(hdr)
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn header(flags: TcpFlags) -> TcpHeader {
        TcpHeader {
            src_port: 40000,
            dst_port: 80,
            seq: 0xffff_fff0,
            ack: 7,
            flags,
            window: 1024,
            mss: None,
        }
    }

    #[test]
    fn test_parse_what_was_built() {
        let hdr = TcpHeader {
            mss: Some(1400),
            ..header(TcpFlags::SYN)
        };
        let pkt = NetPkt::new(hdr.encode(A, B, &[]), 1);
        let seg = Segment::parse(A, B, &pkt).unwrap();
        assert_eq!(seg.hdr, hdr);
        assert_eq!(seg.seq_len(), 1);

        let data = header(TcpFlags::ACK | TcpFlags::PSH | TcpFlags::FIN);
        let pkt = NetPkt::new(data.encode(A, B, b"payload"), 1);
        let seg = Segment::parse(A, B, &pkt).unwrap();
        assert_eq!(seg.payload.as_slice(), b"payload");
        assert_eq!(seg.seq_len(), 8);
        assert_eq!(seg.src(A), SockAddrIn::new(A, 40000));
    }

    #[test]
    fn test_parse_rejects_damage() {
        let mut bytes = header(TcpFlags::ACK).encode(A, B, b"x");
        // Wrong addresses break the pseudo-header sum
        let pkt = NetPkt::from_slice(&bytes, 1);
        assert_eq!(Segment::parse(A, A, &pkt).err(), Some(DropReason::BadChecksum));

        bytes[12] = 0x40;
        assert_eq!(Segment::parse(A, B, &NetPkt::new(bytes, 1)).err(), Some(DropReason::Malformed));
        assert_eq!(Segment::parse(A, B, &NetPkt::from_slice(&[0; 12], 1)).err(), Some(DropReason::Malformed));
    }

    #[test]
    fn test_options_skipped() {
        assert_eq!(parse_mss(&[OPT_NOP, OPT_NOP, 8, 10, 0, 0, 0, 0, 0, 0, 0, 0, OPT_MSS, 4, 2, 0]), Ok(Some(512)));
        assert_eq!(parse_mss(&[OPT_END, 99]), Ok(None));
        assert_eq!(parse_mss(&[8, 30]), Err(DropReason::Malformed));
    }

    #[test]
    fn test_sequence_wraps() {
        assert!(seq_lt(0xffff_fff0, 5));
        assert!(seq_gt(5, 0xffff_fff0));
        assert!(seq_le(5, 5) && seq_ge(5, 5));
        assert!(!seq_lt(5, 5));
    }

    #[test]
    fn test_reset_rules() {
        let pkt = NetPkt::new(header(TcpFlags::ACK).encode(A, B, b"abc"), 1);
        let seg = Segment::parse(A, B, &pkt).unwrap();
        let rst = reset_for(&seg).unwrap();
        assert_eq!((rst.seq, rst.flags), (7, TcpFlags::RST));
        assert_eq!((rst.src_port, rst.dst_port), (80, 40000));

        let pkt = NetPkt::new(header(TcpFlags::SYN).encode(A, B, &[]), 1);
        let seg = Segment::parse(A, B, &pkt).unwrap();
        let rst = reset_for(&seg).unwrap();
        assert_eq!(rst.ack, 0xffff_fff1);
        assert_eq!(rst.flags, TcpFlags::RST | TcpFlags::ACK);

        let pkt = NetPkt::new(header(TcpFlags::RST).encode(A, B, &[]), 1);
        assert!(reset_for(&Segment::parse(A, B, &pkt).unwrap()).is_none());
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Scatter/Gather I/O Descriptor
//!
//! A [`Uio`] describes "N bytes remain, spread across these segments,
//! starting at this logical offset". Socket and pipe code moves bytes
//! through it without caring how the caller's buffer is split up.
//!
//! # Direction
//!
//! - A **source** descriptor carries the caller's data into the kernel
//!   (`write`, `send`). Drain it with [`Uio::copy_in`].
//! - A **sink** descriptor receives kernel data (`read`, `recv`). Fill it
//!   with [`Uio::copy_out`] or [`Uio::copy_zero`].
//!
//! Using a descriptor in the wrong direction is a kernel bug and is fatal.
//!
//! # Usage
//!
//! ```text
//! let mut hdr = [0u8; 4];
//! let mut body = [0u8; 60];
//! let mut uio = Uio::sink(vec![&mut hdr[..], &mut body[..]]);
//! let n = uio.copy_out(&packet);   // spans both segments
//! ```

use alloc::vec::Vec;

use crate::kernel::debug::log_fatal;

/// Where the segments live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UioSpace {
    /// Kernel-resident buffers
    Kernel,
    /// Buffers that belong to a user address space
    User,
}

enum Segments<'a> {
    Source(Vec<&'a [u8]>),
    Sink(Vec<&'a mut [u8]>),
}

impl<'a> Segments<'a> {
    fn seg_len(&self, index: usize) -> Option<usize> {
        match self {
            Segments::Source(segs) => segs.get(index).map(|s| s.len()),
            Segments::Sink(segs) => segs.get(index).map(|s| s.len()),
        }
    }
}

/// Scatter/gather transfer descriptor
pub struct Uio<'a> {
    segs: Segments<'a>,

    /// Current segment
    index: usize,

    /// Offset within the current segment
    seg_off: usize,

    /// Bytes left to transfer
    resid: usize,

    /// Logical offset of the next byte
    offset: u64,

    space: UioSpace,
}

impl<'a> Uio<'a> {
    /// Descriptor over caller data flowing into the kernel
    pub fn source(segs: Vec<&'a [u8]>) -> Self {
        let resid = segs.iter().map(|s| s.len()).sum();
        Self::build(Segments::Source(segs), resid)
    }

    /// Descriptor over caller buffers the kernel fills
    pub fn sink(segs: Vec<&'a mut [u8]>) -> Self {
        let resid = segs.iter().map(|s| s.len()).sum();
        Self::build(Segments::Sink(segs), resid)
    }

    /// Single-segment source
    pub fn from_slice(buf: &'a [u8]) -> Self {
        Self::source(alloc::vec![buf])
    }

    /// Single-segment sink
    pub fn from_mut_slice(buf: &'a mut [u8]) -> Self {
        Self::sink(alloc::vec![buf])
    }

    fn build(segs: Segments<'a>, resid: usize) -> Self {
        let mut uio = Self {
            segs,
            index: 0,
            seg_off: 0,
            resid,
            offset: 0,
            space: UioSpace::Kernel,
        };
        uio.skip_empty();
        uio
    }

    /// Start the logical offset at `offset`
    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    /// Mark the segments as user-resident
    pub fn with_space(mut self, space: UioSpace) -> Self {
        self.space = space;
        self
    }

    /// Bytes left to transfer
    pub fn resid(&self) -> usize {
        self.resid
    }

    /// Whether every byte has been transferred
    pub fn is_empty(&self) -> bool {
        self.resid == 0
    }

    /// Logical offset of the next byte
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Address space of the segments
    pub fn space(&self) -> UioSpace {
        self.space
    }

    /// Whether this descriptor carries data into the kernel
    pub fn is_source(&self) -> bool {
        matches!(self.segs, Segments::Source(_))
    }

    /// Move up to `dst.len()` bytes from the descriptor into `dst`
    ///
    /// # Returns
    ///
    /// Bytes moved; less than `dst.len()` once the descriptor runs dry.
    pub fn copy_in(&mut self, dst: &mut [u8]) -> usize {
        let mut done = 0;
        while done < dst.len() && self.resid > 0 {
            let (index, off) = (self.index, self.seg_off);
            let n = match &self.segs {
                Segments::Source(segs) => {
                    let seg = &segs[index][off..];
                    let n = seg.len().min(dst.len() - done);
                    dst[done..done + n].copy_from_slice(&seg[..n]);
                    n
                }
                Segments::Sink(_) => log_fatal(format_args!("uio: copy_in on a sink descriptor")),
            };
            self.advance(n);
            done += n;
        }
        done
    }

    /// Drain up to `count` bytes into a fresh buffer
    pub fn copy_in_vec(&mut self, count: usize) -> Vec<u8> {
        let mut buf = alloc::vec![0u8; count.min(self.resid)];
        let n = self.copy_in(&mut buf);
        buf.truncate(n);
        buf
    }

    /// Move up to `src.len()` bytes from `src` into the descriptor
    ///
    /// # Returns
    ///
    /// Bytes moved; less than `src.len()` once the descriptor is full.
    pub fn copy_out(&mut self, src: &[u8]) -> usize {
        let mut done = 0;
        while done < src.len() && self.resid > 0 {
            let (index, off) = (self.index, self.seg_off);
            let n = match &mut self.segs {
                Segments::Sink(segs) => {
                    let seg = &mut segs[index][off..];
                    let n = seg.len().min(src.len() - done);
                    seg[..n].copy_from_slice(&src[done..done + n]);
                    n
                }
                Segments::Source(_) => {
                    log_fatal(format_args!("uio: copy_out on a source descriptor"))
                }
            };
            self.advance(n);
            done += n;
        }
        done
    }

    /// Fill up to `count` bytes of the descriptor with zeros
    pub fn copy_zero(&mut self, count: usize) -> usize {
        let mut done = 0;
        while done < count && self.resid > 0 {
            let (index, off) = (self.index, self.seg_off);
            let n = match &mut self.segs {
                Segments::Sink(segs) => {
                    let seg = &mut segs[index][off..];
                    let n = seg.len().min(count - done);
                    seg[..n].fill(0);
                    n
                }
                Segments::Source(_) => {
                    log_fatal(format_args!("uio: copy_zero on a source descriptor"))
                }
            };
            self.advance(n);
            done += n;
        }
        done
    }

    fn advance(&mut self, n: usize) {
        self.seg_off += n;
        self.resid -= n;
        self.offset += n as u64;
        self.skip_empty();
    }

    /// Step past exhausted (or zero-length) segments
    fn skip_empty(&mut self) {
        while let Some(len) = self.segs.seg_len(self.index) {
            if self.seg_off < len {
                break;
            }
            self.index += 1;
            self.seg_off = 0;
        }
    }
}

impl core::fmt::Debug for Uio<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Uio")
            .field("source", &self.is_source())
            .field("index", &self.index)
            .field("resid", &self.resid)
            .field("offset", &self.offset)
            .field("space", &self.space)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Network Packet Buffer
//!
//! A [`NetPkt`] is an immutable, reference-counted byte buffer plus a window
//! into it. The network layer hands packets to the input paths; a socket
//! keeps a narrowed view of the payload instead of copying it, and several
//! packet sockets can queue the same frame.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;

use crate::rustux::types::IfIndex;

/// Packet buffer view
#[derive(Clone)]
pub struct NetPkt {
    data: Arc<[u8]>,
    start: usize,
    end: usize,
    ifindex: IfIndex,
}

impl NetPkt {
    /// Wrap `bytes` received on (or bound for) `ifindex`
    pub fn new(bytes: Vec<u8>, ifindex: IfIndex) -> Self {
        let end = bytes.len();
        Self {
            data: Arc::from(bytes),
            start: 0,
            end,
            ifindex,
        }
    }

    /// Copy `bytes` into a new packet
    pub fn from_slice(bytes: &[u8], ifindex: IfIndex) -> Self {
        Self::new(bytes.to_vec(), ifindex)
    }

    /// Bytes in view
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Interface the packet arrived on
    pub fn ifindex(&self) -> IfIndex {
        self.ifindex
    }

    /// A narrower view sharing the same buffer
    ///
    /// `range` is relative to the current view and is clamped to it.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let end = range.end.min(self.len());
        let start = range.start.min(end);
        Self {
            data: self.data.clone(),
            start: self.start + start,
            end: self.start + end,
            ifindex: self.ifindex,
        }
    }

    /// View with the first `n` bytes removed
    pub fn skip(&self, n: usize) -> Self {
        self.slice(n..self.len())
    }
}

impl AsRef<[u8]> for NetPkt {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl core::fmt::Debug for NetPkt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("NetPkt")
            .field("len", &self.len())
            .field("ifindex", &self.ifindex)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slices_share_buffer() {
        let pkt = NetPkt::new((0u8..20).collect(), 3);
        let payload = pkt.skip(8);
        assert_eq!(payload.len(), 12);
        assert_eq!(payload.as_slice()[0], 8);
        assert_eq!(payload.ifindex(), 3);

        let inner = payload.slice(2..4);
        assert_eq!(inner.as_slice(), &[10, 11]);
        // Clamped to the view
        assert_eq!(inner.slice(1..100).as_slice(), &[11]);
        assert!(inner.slice(5..9).is_empty());
    }
}

// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Circular Buffer
//!
//! Fixed-capacity byte ring used by pipes and Unix-domain stream sockets.
//! The ring carries no lock of its own: it always lives inside the owning
//! object's mutex, which also orders it against that object's wait queues.
//!
//! Unlike a head/tail ring that keeps one slot free, the byte count is
//! tracked explicitly so the full capacity is usable and any capacity, not
//! only powers of two, is accepted.

use alloc::boxed::Box;

use crate::kernel::uio::Uio;

/// Circular buffer structure
pub struct CBuf {
    /// Buffer data
    buf: Box<[u8]>,
    /// Read position
    tail: usize,
    /// Bytes stored
    len: usize,
}

impl CBuf {
    /// Create a new circular buffer holding up to `capacity` bytes
    ///
    /// Returns None for a zero capacity.
    pub fn new(capacity: usize) -> Option<Self> {
        if capacity == 0 {
            return None;
        }

        Some(Self {
            buf: alloc::vec![0u8; capacity].into_boxed_slice(),
            tail: 0,
            len: 0,
        })
    }

    /// Write position
    #[inline]
    fn head(&self) -> usize {
        (self.tail + self.len) % self.buf.len()
    }

    /// Calculate available space in the buffer
    pub fn space_avail(&self) -> usize {
        self.buf.len() - self.len
    }

    /// Calculate available data to read
    pub fn data_avail(&self) -> usize {
        self.len
    }

    /// Write as much of `data` as fits
    pub fn write(&mut self, data: &[u8]) -> usize {
        let to_write = data.len().min(self.space_avail());
        let mut done = 0;
        while done < to_write {
            let head = self.head();
            let run = (self.buf.len() - head).min(to_write - done);
            self.buf[head..head + run].copy_from_slice(&data[done..done + run]);
            self.len += run;
            done += run;
        }
        to_write
    }

    /// Read up to `buffer.len()` bytes
    pub fn read(&mut self, buffer: &mut [u8]) -> usize {
        let to_read = buffer.len().min(self.len);
        let mut done = 0;
        while done < to_read {
            let run = (self.buf.len() - self.tail).min(to_read - done);
            buffer[done..done + run].copy_from_slice(&self.buf[self.tail..self.tail + run]);
            self.consume(run);
            done += run;
        }
        to_read
    }

    /// Move up to `max` bytes from a source descriptor into the ring
    pub fn write_from(&mut self, uio: &mut Uio<'_>, max: usize) -> usize {
        let to_write = max.min(self.space_avail()).min(uio.resid());
        let mut done = 0;
        while done < to_write {
            let head = self.head();
            let run = (self.buf.len() - head).min(to_write - done);
            let n = uio.copy_in(&mut self.buf[head..head + run]);
            self.len += n;
            done += n;
            if n < run {
                break;
            }
        }
        done
    }

    /// Move up to `max` bytes from the ring into a sink descriptor
    pub fn read_into(&mut self, uio: &mut Uio<'_>, max: usize) -> usize {
        let to_read = max.min(self.len).min(uio.resid());
        let mut done = 0;
        while done < to_read {
            let run = (self.buf.len() - self.tail).min(to_read - done);
            let n = uio.copy_out(&self.buf[self.tail..self.tail + run]);
            self.consume(n);
            done += n;
            if n < run {
                break;
            }
        }
        done
    }

    fn consume(&mut self, n: usize) {
        self.tail = (self.tail + n) % self.buf.len();
        self.len -= n;
        if self.len == 0 {
            // Keep runs contiguous for the next writer
            self.tail = 0;
        }
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the buffer is full
    pub fn is_full(&self) -> bool {
        self.space_avail() == 0
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.tail = 0;
        self.len = 0;
    }

    /// Get the buffer capacity
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }
}

impl core::fmt::Debug for CBuf {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CBuf")
            .field("capacity", &self.capacity())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cbuf_creation() {
        assert!(CBuf::new(16).is_some());
        assert!(CBuf::new(100).is_some());
        assert!(CBuf::new(0).is_none());
    }

    #[test]
    fn test_cbuf_write_read() {
        let mut cbuf = CBuf::new(16).unwrap();

        assert_eq!(cbuf.write(b"Hello"), 5);

        let mut buffer = [0u8; 16];
        assert_eq!(cbuf.read(&mut buffer), 5);
        assert_eq!(&buffer[..5], b"Hello");
        assert!(cbuf.is_empty());
    }

    #[test]
    fn test_cbuf_wraparound() {
        let mut cbuf = CBuf::new(8).unwrap();

        assert_eq!(cbuf.write(b"123456"), 6);
        let mut buffer = [0u8; 4];
        assert_eq!(cbuf.read(&mut buffer), 4);

        // Two bytes left at the end; this write wraps
        assert_eq!(cbuf.write(b"ABCDEF"), 6);
        assert!(cbuf.is_full());

        let mut all = [0u8; 8];
        assert_eq!(cbuf.read(&mut all), 8);
        assert_eq!(&all, b"56ABCDEF");
    }

    #[test]
    fn test_cbuf_full_capacity_usable() {
        let mut cbuf = CBuf::new(7).unwrap();

        assert_eq!(cbuf.space_avail(), 7);
        assert_eq!(cbuf.write(b"0123456789"), 7);
        assert!(cbuf.is_full());
        assert_eq!(cbuf.space_avail(), 0);
        assert_eq!(cbuf.write(b"x"), 0);

        cbuf.clear();
        assert!(cbuf.is_empty());
        assert_eq!(cbuf.data_avail(), 0);
    }

    #[test]
    fn test_cbuf_uio_transfer() {
        let mut cbuf = CBuf::new(8).unwrap();

        let mut src = Uio::source(vec![&b"abc"[..], &b"defghij"[..]]);
        assert_eq!(cbuf.write_from(&mut src, usize::MAX), 8);
        assert_eq!(src.resid(), 2);

        let (mut a, mut b) = ([0u8; 5], [0u8; 5]);
        let mut dst = Uio::sink(vec![&mut a[..], &mut b[..]]);
        assert_eq!(cbuf.read_into(&mut dst, 6), 6);
        assert_eq!(cbuf.data_avail(), 2);

        // Refill across the wrap point from the remaining source bytes
        assert_eq!(cbuf.write_from(&mut src, usize::MAX), 2);
        assert_eq!(cbuf.read_into(&mut dst, usize::MAX), 4);
        drop(dst);
        assert_eq!(&a, b"abcde");
        assert_eq!(&b, b"fghij");
    }
}

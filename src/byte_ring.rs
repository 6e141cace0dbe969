//! Byte Ring - SPSC ring buffer of raw bytes for socket staging.
//!
//! A power-of-two region with monotonically increasing read and write
//! counters. One byte is always left empty, so a ring of size `S` holds at
//! most `S - 1` bytes. Writes are all-or-nothing; reads return whatever is
//! available up to the caller's buffer. Each side keeps a cached copy of the
//! opposite counter and reloads it only when the cache denies progress.

use std::fmt;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::error::{check_capacity, Result};
use crate::numa::NumaRegion;

/// Shared state of a byte ring. Reached through its two handles.
pub struct ByteRing {
    region: NumaRegion,
    mask: usize,
    write_index: CachePadded<AtomicUsize>,
    read_index: CachePadded<AtomicUsize>,
}

impl ByteRing {
    /// Create a ring of `size` bytes on `node` (or the caller's node).
    ///
    /// `size` must be a power of two and at least 2. The whole region is
    /// zeroed up front so no page faults happen on the data path.
    pub fn with_capacity(size: usize, node: Option<usize>) -> Result<(RingWriter, RingReader)> {
        check_capacity("byte ring", size, 2)?;
        let region = NumaRegion::allocate(size, node)?;
        // SAFETY: fresh region of at least `size` bytes.
        unsafe { ptr::write_bytes(region.as_ptr(), 0, size) };
        debug!(size, node = ?region.node(), "byte ring created");

        let ring = Arc::new(Self {
            region,
            mask: size - 1,
            write_index: CachePadded::new(AtomicUsize::new(0)),
            read_index: CachePadded::new(AtomicUsize::new(0)),
        });
        let writer = RingWriter { ring: Arc::clone(&ring), position: 0, cached_read: 0 };
        let reader = RingReader { ring, position: 0, cached_write: 0 };
        Ok((writer, reader))
    }

    /// Ring size in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        self.mask + 1
    }

    /// Largest number of bytes the ring can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        let read = self.read_index.load(Ordering::Acquire);
        let write = self.write_index.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Returns true if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// NUMA node backing the ring, if it was bound.
    pub fn node(&self) -> Option<usize> {
        self.region.node()
    }

    /// Offset of a counter within the region, and the bytes up to the end.
    #[inline]
    fn split(&self, position: usize) -> (usize, usize) {
        let offset = position & self.mask;
        (offset, self.size() - offset)
    }

    #[inline]
    fn at(&self, offset: usize) -> *mut u8 {
        // SAFETY: callers pass offsets below `size`.
        unsafe { self.region.as_ptr().add(offset) }
    }
}

impl fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteRing")
            .field("size", &self.size())
            .field("len", &self.len())
            .field("node", &self.node())
            .finish()
    }
}

/// Writing half of a byte ring.
pub struct RingWriter {
    ring: Arc<ByteRing>,
    position: usize,
    cached_read: usize,
}

impl RingWriter {
    #[inline]
    fn free(&self) -> usize {
        self.ring.capacity() - self.position.wrapping_sub(self.cached_read)
    }

    /// Free space, reloading the reader's counter if the cache says less
    /// than `wanted`.
    #[inline]
    fn free_for(&mut self, wanted: usize) -> usize {
        let free = self.free();
        if free >= wanted {
            return free;
        }
        self.cached_read = self.ring.read_index.load(Ordering::Acquire);
        self.free()
    }

    #[inline]
    fn publish(&mut self, n: usize) {
        self.position = self.position.wrapping_add(n);
        self.ring.write_index.store(self.position, Ordering::Release);
    }

    /// Append all of `src`, or nothing if it does not fit.
    ///
    /// Returns the number of bytes written: `src.len()` or 0.
    pub fn write(&mut self, src: &[u8]) -> usize {
        let len = src.len();
        if len == 0 || self.free_for(len) < len {
            return 0;
        }
        let (offset, to_end) = self.ring.split(self.position);
        let first = len.min(to_end);
        // SAFETY: [position, position + len) is free space owned by the writer.
        unsafe {
            ptr::copy_nonoverlapping(src.as_ptr(), self.ring.at(offset), first);
            if first < len {
                ptr::copy_nonoverlapping(src.as_ptr().add(first), self.ring.at(0), len - first);
            }
        }
        self.publish(len);
        len
    }

    /// Read from `source` straight into the ring's free space.
    ///
    /// Issues at most one `read` call, into the contiguous free run at the
    /// write position. Returns `Ok(0)` when the ring is full.
    pub fn fill_from<R: io::Read + ?Sized>(&mut self, source: &mut R) -> io::Result<usize> {
        let free = self.free_for(self.ring.capacity());
        let (offset, to_end) = self.ring.split(self.position);
        let run = free.min(to_end);
        if run == 0 {
            return Ok(0);
        }
        // SAFETY: the run is initialized, free, and owned by the writer.
        let buf = unsafe { std::slice::from_raw_parts_mut(self.ring.at(offset), run) };
        let n = source.read(buf)?;
        self.publish(n.min(run));
        Ok(n)
    }

    /// Bytes that can be written right now.
    pub fn writable(&mut self) -> usize {
        self.free_for(self.ring.capacity())
    }

    /// The shared ring.
    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }
}

/// Reading half of a byte ring.
pub struct RingReader {
    ring: Arc<ByteRing>,
    position: usize,
    cached_write: usize,
}

impl RingReader {
    #[inline]
    fn available(&self) -> usize {
        self.cached_write.wrapping_sub(self.position)
    }

    /// Buffered bytes, reloading the writer's counter if the cache says
    /// less than `wanted`.
    #[inline]
    fn available_for(&mut self, wanted: usize) -> usize {
        let avail = self.available();
        if avail >= wanted {
            return avail;
        }
        self.cached_write = self.ring.write_index.load(Ordering::Acquire);
        self.available()
    }

    /// Copy up to `dst.len()` bytes out of the ring.
    ///
    /// Returns the number of bytes read; 0 if the ring is empty.
    pub fn read(&mut self, dst: &mut [u8]) -> usize {
        let n = self.available_for(dst.len()).min(dst.len());
        if n == 0 {
            return 0;
        }
        let (offset, to_end) = self.ring.split(self.position);
        let first = n.min(to_end);
        // SAFETY: [position, position + n) was published by the writer.
        unsafe {
            ptr::copy_nonoverlapping(self.ring.at(offset), dst.as_mut_ptr(), first);
            if first < n {
                ptr::copy_nonoverlapping(self.ring.at(0), dst.as_mut_ptr().add(first), n - first);
            }
        }
        self.consume(n);
        n
    }

    /// Borrow the buffered bytes in place as up to two slices, oldest first.
    ///
    /// Nothing is consumed until [`RingReader::consume`].
    pub fn peek(&mut self) -> (&[u8], &[u8]) {
        let n = self.available_for(self.ring.capacity());
        let (offset, to_end) = self.ring.split(self.position);
        let first = n.min(to_end);
        // SAFETY: both runs lie in published data the writer cannot touch
        // until the reader consumes it.
        unsafe {
            (
                std::slice::from_raw_parts(self.ring.at(offset), first),
                std::slice::from_raw_parts(self.ring.at(0), n - first),
            )
        }
    }

    /// Drop `n` bytes from the front. Clamped to what is buffered.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.available_for(n));
        self.position = self.position.wrapping_add(n);
        self.ring.read_index.store(self.position, Ordering::Release);
    }

    /// Write buffered bytes to `sink`, consuming what it accepts.
    ///
    /// Issues at most one `write` call, from the contiguous run at the read
    /// position. Returns `Ok(0)` when the ring is empty.
    pub fn drain_into<W: io::Write + ?Sized>(&mut self, sink: &mut W) -> io::Result<usize> {
        let n = self.available_for(self.ring.capacity());
        let (offset, to_end) = self.ring.split(self.position);
        let run = n.min(to_end);
        if run == 0 {
            return Ok(0);
        }
        // SAFETY: published data, owned by the reader until consumed.
        let buf = unsafe { std::slice::from_raw_parts(self.ring.at(offset), run) };
        let written = sink.write(buf)?;
        self.consume(written);
        Ok(written)
    }

    /// Bytes that can be read right now.
    pub fn readable(&mut self) -> usize {
        self.available_for(self.ring.capacity())
    }

    /// The shared ring.
    pub fn ring(&self) -> &ByteRing {
        &self.ring
    }
}

impl fmt::Debug for RingWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingWriter")
            .field("position", &self.position)
            .field("cached_read", &self.cached_read)
            .field("ring", &self.ring)
            .finish()
    }
}

impl fmt::Debug for RingReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingReader")
            .field("position", &self.position)
            .field("cached_write", &self.cached_write)
            .field("ring", &self.ring)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn bytes(range: std::ops::Range<u8>) -> Vec<u8> {
        range.collect()
    }

    #[test]
    fn test_rejects_bad_sizes() {
        assert!(ByteRing::with_capacity(0, None).is_err());
        assert!(ByteRing::with_capacity(1, None).is_err());
        assert!(ByteRing::with_capacity(100, None).is_err());
        assert!(ByteRing::with_capacity(2, None).is_ok());
    }

    #[test]
    fn test_one_byte_sacrificed() {
        let (mut tx, mut rx) = ByteRing::with_capacity(16, None).unwrap();
        assert_eq!(tx.write(&[0u8; 16]), 0, "full size never fits");
        assert_eq!(tx.write(&[1u8; 15]), 15);
        assert_eq!(tx.write(&[2u8]), 0);
        assert_eq!(tx.writable(), 0);
        assert_eq!(rx.readable(), 15);
    }

    #[test]
    fn test_write_is_all_or_nothing() {
        let (mut tx, mut rx) = ByteRing::with_capacity(8, None).unwrap();
        assert_eq!(tx.write(&[1, 2, 3, 4, 5]), 5);
        assert_eq!(tx.write(&[6, 7, 8]), 0, "only two bytes free");
        assert_eq!(tx.write(&[]), 0);
        let mut out = [0u8; 8];
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(&out[..5], &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_wrap_around_keeps_order() {
        let (mut tx, mut rx) = ByteRing::with_capacity(16, None).unwrap();
        assert_eq!(tx.write(&bytes(0x00..0x0A)), 10);

        let mut head = [0u8; 6];
        assert_eq!(rx.read(&mut head), 6);
        assert_eq!(head.to_vec(), bytes(0x00..0x06));

        assert_eq!(tx.write(&bytes(0x0A..0x14)), 10);

        let mut rest = [0u8; 14];
        assert_eq!(rx.read(&mut rest), 14);
        assert_eq!(rest.to_vec(), bytes(0x06..0x14));
        assert_eq!(rx.read(&mut rest), 0);
    }

    #[test]
    fn test_peek_and_consume_across_wrap() {
        let (mut tx, mut rx) = ByteRing::with_capacity(8, None).unwrap();
        tx.write(&[1, 2, 3, 4, 5, 6]);
        rx.consume(4);
        tx.write(&[7, 8, 9, 10]);
        let (a, b) = rx.peek();
        assert_eq!(a, &[5, 6, 7, 8]);
        assert_eq!(b, &[9, 10]);
        rx.consume(100);
        assert_eq!(rx.readable(), 0);
    }

    #[test]
    fn test_io_adapters() {
        let (mut tx, mut rx) = ByteRing::with_capacity(64, None).unwrap();
        let mut source = Cursor::new(b"8=FIX.4.2|35=D|".to_vec());
        assert_eq!(tx.fill_from(&mut source).unwrap(), 15);
        assert_eq!(tx.fill_from(&mut source).unwrap(), 0, "source exhausted");

        let mut sink = Vec::new();
        assert_eq!(rx.drain_into(&mut sink).unwrap(), 15);
        assert_eq!(sink, b"8=FIX.4.2|35=D|");
        assert_eq!(rx.drain_into(&mut sink).unwrap(), 0);
    }

    #[test]
    fn test_cross_thread_stream() {
        const TOTAL: usize = 1 << 20;
        let (mut tx, mut rx) = ByteRing::with_capacity(4096, None).unwrap();
        let writer = std::thread::spawn(move || {
            let mut sent = 0usize;
            let mut chunk = [0u8; 97];
            while sent < TOTAL {
                let n = chunk.len().min(TOTAL - sent);
                for (i, b) in chunk[..n].iter_mut().enumerate() {
                    *b = ((sent + i) % 251) as u8;
                }
                if tx.write(&chunk[..n]) == n {
                    sent += n;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut received = 0usize;
        let mut buf = [0u8; 333];
        while received < TOTAL {
            let n = rx.read(&mut buf);
            for (i, &b) in buf[..n].iter().enumerate() {
                assert_eq!(b, ((received + i) % 251) as u8);
            }
            received += n;
        }
        writer.join().unwrap();
        assert!(rx.ring().is_empty());
    }
}

//! Fixed-capacity byte ring with monotonic cursors.
//!
//! Read and write positions are free-running `u64` counters; the storage
//! index is `cursor % BUF_SIZE`. The counters never reset, so `wp - rp` is
//! always the exact number of buffered bytes and cursor comparisons never
//! need wraparound handling.

use super::BUF_SIZE;

pub struct RingBuffer {
    buf: Box<[u8; BUF_SIZE]>,
    rp: u64,
    wp: u64,
}

impl RingBuffer {
    pub fn new() -> Self {
        Self {
            buf: Box::new([0u8; BUF_SIZE]),
            rp: 0,
            wp: 0,
        }
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn available(&self) -> usize {
        (self.wp - self.rp) as usize
    }

    /// Bytes of free space.
    #[inline]
    pub fn free(&self) -> usize {
        BUF_SIZE - self.available()
    }

    /// Whether at least `n` bytes can still be written.
    #[inline]
    pub fn has_room(&self, n: usize) -> bool {
        self.free() >= n
    }

    /// The contiguous writable span at the write position. Empty when full.
    pub fn write_span(&mut self) -> &mut [u8] {
        let free = self.free();
        let idx = (self.wp % BUF_SIZE as u64) as usize;
        let span = free.min(BUF_SIZE - idx);
        &mut self.buf[idx..idx + span]
    }

    /// Commit `n` bytes previously written into [`Self::write_span`].
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.free());
        self.wp += n as u64;
    }

    /// Peek `out.len()` bytes starting `offset` bytes past the read position,
    /// handling wraparound. The caller must know the bytes are available.
    pub fn copy_out(&self, offset: usize, out: &mut [u8]) {
        debug_assert!(offset + out.len() <= self.available());
        let mut idx = ((self.rp + offset as u64) % BUF_SIZE as u64) as usize;
        let mut done = 0;
        while done < out.len() {
            let span = (out.len() - done).min(BUF_SIZE - idx);
            out[done..done + span].copy_from_slice(&self.buf[idx..idx + span]);
            done += span;
            idx = (idx + span) % BUF_SIZE;
        }
    }

    /// Peek one little-endian u64 at `offset` past the read position.
    pub fn peek_u64(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        self.copy_out(offset, &mut raw);
        u64::from_le_bytes(raw)
    }

    /// Consume `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.rp += n as u64;
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.rp = self.wp;
    }
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(ring: &mut RingBuffer, data: &[u8]) {
        let mut done = 0;
        while done < data.len() {
            let span = ring.write_span();
            let n = span.len().min(data.len() - done);
            span[..n].copy_from_slice(&data[done..done + n]);
            ring.commit(n);
            done += n;
        }
    }

    #[test]
    fn test_write_read_basic() {
        let mut ring = RingBuffer::new();
        assert_eq!(ring.available(), 0);
        assert!(ring.has_room(BUF_SIZE));

        fill(&mut ring, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(ring.available(), 8);
        assert_eq!(ring.peek_u64(0), u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]));

        let mut out = [0u8; 4];
        ring.copy_out(2, &mut out);
        assert_eq!(out, [3, 4, 5, 6]);

        ring.advance(8);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_wraparound_copy() {
        let mut ring = RingBuffer::new();
        // Park the cursors 100 bytes before the end of storage.
        let skip = vec![0u8; BUF_SIZE - 100];
        fill(&mut ring, &skip);
        ring.advance(BUF_SIZE - 100);

        let data: Vec<u8> = (0..200u16).map(|v| v as u8).collect();
        fill(&mut ring, &data);
        assert_eq!(ring.available(), 200);

        let mut out = vec![0u8; 200];
        ring.copy_out(0, &mut out);
        assert_eq!(out, data);

        // A read crossing the physical boundary.
        let mut out = [0u8; 8];
        ring.copy_out(96, &mut out);
        assert_eq!(out, [96, 97, 98, 99, 100, 101, 102, 103]);
        ring.advance(200);
        assert_eq!(ring.available(), 0);
    }

    #[test]
    fn test_full_ring_has_no_room() {
        let mut ring = RingBuffer::new();
        fill(&mut ring, &vec![0xAB; BUF_SIZE]);
        assert_eq!(ring.free(), 0);
        assert!(!ring.has_room(1));
        assert_eq!(ring.write_span().len(), 0);

        ring.advance(64);
        assert!(ring.has_room(64));
        assert!(!ring.has_room(65));
    }

    #[test]
    fn test_clear_discards_everything() {
        let mut ring = RingBuffer::new();
        fill(&mut ring, &[9; 300]);
        ring.clear();
        assert_eq!(ring.available(), 0);
        assert_eq!(ring.free(), BUF_SIZE);
    }
}

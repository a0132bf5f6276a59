//! Growable single-reader/single-writer byte buffer.
//!
//! ```text
//!  0            read_index        write_index         capacity
//!  |  consumed  |     readable     |     writable     |
//! ```
//!
//! Socket reads go straight into [`ElasticBuffer::spare_mut`] and are
//! committed with [`ElasticBuffer::advance_write`]; socket writes go straight
//! out of [`ElasticBuffer::unread`] and are committed with
//! [`ElasticBuffer::advance_read`]. No intermediate copy is made on either
//! path.
//!
//! The read cursor drifts right as bytes are consumed. Whenever it passes
//! one third of the capacity the unread region is moved back to offset 0.

use bytes::Bytes;
use tracing::error;

/// Contiguous byte storage with independent read and write cursors.
///
/// Invariant after every operation: `read_index <= write_index <= capacity`.
#[derive(Debug, Clone, Default)]
pub struct ElasticBuffer {
    storage: Vec<u8>,
    read_index: usize,
    write_index: usize,
}

impl ElasticBuffer {
    /// Create an empty buffer with `capacity` bytes of storage.
    pub fn new(capacity: usize) -> Self {
        Self {
            storage: vec![0; capacity],
            read_index: 0,
            write_index: 0,
        }
    }

    // ── Accounting ───────────────────────────────────────────────

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Bytes written but not yet consumed.
    pub fn readable(&self) -> usize {
        self.write_index - self.read_index
    }

    /// Free bytes after the write cursor.
    pub fn writable(&self) -> usize {
        self.storage.len() - self.write_index
    }

    pub fn read_index(&self) -> usize {
        self.read_index
    }

    pub fn write_index(&self) -> usize {
        self.write_index
    }

    pub fn is_empty(&self) -> bool {
        self.readable() == 0
    }

    // ── Copying API ──────────────────────────────────────────────

    /// Append `bytes` after the write cursor, growing the storage to
    /// `1.5 × (write_index + len)` first if they do not fit.
    pub fn append(&mut self, bytes: &[u8]) {
        if bytes.len() > self.writable() {
            let new_capacity = (self.write_index + bytes.len()) * 3 / 2;
            self.reallocate(new_capacity);
        }
        let end = self.write_index + bytes.len();
        self.storage[self.write_index..end].copy_from_slice(bytes);
        self.write_index = end;
    }

    /// Remove and return up to `max_len` unread bytes.
    ///
    /// Returns an empty `Bytes` when nothing is readable.
    pub fn take(&mut self, max_len: usize) -> Bytes {
        let n = max_len.min(self.readable());
        if n == 0 {
            return Bytes::new();
        }
        let out = Bytes::copy_from_slice(&self.storage[self.read_index..self.read_index + n]);
        self.read_index += n;
        self.compact();
        out
    }

    /// The first `n` unread bytes, or `None` if fewer are buffered.
    pub fn peek(&self, n: usize) -> Option<&[u8]> {
        if n > self.readable() {
            return None;
        }
        Some(&self.storage[self.read_index..self.read_index + n])
    }

    // ── Zero-copy API ────────────────────────────────────────────

    /// The whole unread region.
    pub fn unread(&self) -> &[u8] {
        &self.storage[self.read_index..self.write_index]
    }

    /// The free region after the write cursor. Bytes placed here become
    /// readable once committed with [`advance_write`](Self::advance_write).
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_index..]
    }

    /// Commit `n` bytes written into [`spare_mut`](Self::spare_mut).
    ///
    /// An advance past the capacity is logged and ignored.
    pub fn advance_write(&mut self, n: usize) {
        let capacity = self.storage.len();
        let Some(target) = self.write_index.checked_add(n).filter(|&t| t <= capacity) else {
            error!(
                write_index = self.write_index,
                n,
                capacity,
                "advance_write past capacity ignored"
            );
            return;
        };
        self.write_index = target;
        self.compact();
    }

    /// Mark `n` unread bytes as consumed.
    ///
    /// An advance past the write cursor is logged and ignored.
    pub fn advance_read(&mut self, n: usize) {
        let written = self.write_index;
        let Some(target) = self.read_index.checked_add(n).filter(|&t| t <= written) else {
            error!(
                read_index = self.read_index,
                n,
                write_index = written,
                "advance_read past written data ignored"
            );
            return;
        };
        self.read_index = target;
        self.compact();
    }

    // ── Maintenance ──────────────────────────────────────────────

    /// Move the unread region to offset 0 once the read cursor has passed a
    /// third of the capacity. Storage is reused, never reallocated.
    pub fn compact(&mut self) {
        if self.read_index <= self.storage.len() / 3 {
            return;
        }
        let readable = self.readable();
        self.storage
            .copy_within(self.read_index..self.write_index, 0);
        self.read_index = 0;
        self.write_index = readable;
    }

    /// Enlarge the storage by `additional` bytes, moving unread data to the
    /// front.
    pub fn grow(&mut self, additional: usize) {
        self.reallocate(self.storage.len() + additional);
    }

    /// Drop all content. Capacity is retained.
    pub fn reset(&mut self) {
        self.read_index = 0;
        self.write_index = 0;
    }

    fn reallocate(&mut self, new_capacity: usize) {
        let readable = self.readable();
        let new_capacity = new_capacity.max(readable);
        let mut storage = vec![0; new_capacity];
        storage[..readable].copy_from_slice(self.unread());
        self.storage = storage;
        self.read_index = 0;
        self.write_index = readable;
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_invariant(buf: &ElasticBuffer) {
        assert!(buf.read_index() <= buf.write_index());
        assert!(buf.write_index() <= buf.capacity());
        assert_eq!(buf.readable(), buf.write_index() - buf.read_index());
        assert_eq!(buf.writable(), buf.capacity() - buf.write_index());
    }

    /// xorshift64, enough to drive operation sequences deterministically.
    struct Rng(u64);

    impl Rng {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }

        fn below(&mut self, n: usize) -> usize {
            (self.next() % n as u64) as usize
        }
    }

    #[test]
    fn new_buffer_is_empty() {
        let buf = ElasticBuffer::new(64);
        assert_eq!(buf.capacity(), 64);
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.writable(), 64);
        assert!(buf.is_empty());
    }

    #[test]
    fn append_then_take() {
        let mut buf = ElasticBuffer::new(16);
        buf.append(b"hello");
        assert_eq!(buf.readable(), 5);
        assert_eq!(&buf.take(3)[..], b"hel");
        assert_eq!(&buf.take(100)[..], b"lo");
        assert!(buf.take(10).is_empty());
        assert_invariant(&buf);
    }

    #[test]
    fn append_grows_by_half_again() {
        let mut buf = ElasticBuffer::new(4);
        buf.append(b"abc");
        buf.append(b"defgh");
        // 1.5 × (3 + 5)
        assert_eq!(buf.capacity(), 12);
        assert_eq!(buf.unread(), b"abcdefgh");
        assert_invariant(&buf);
    }

    #[test]
    fn growth_keeps_only_unread_region() {
        let mut buf = ElasticBuffer::new(10);
        buf.append(b"0123");
        let _ = buf.take(2);
        buf.append(b"456789abc");
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.unread(), b"23456789abc");
        assert_invariant(&buf);
    }

    #[test]
    fn zero_copy_write_path() {
        let mut buf = ElasticBuffer::new(8);
        buf.spare_mut()[..3].copy_from_slice(b"xyz");
        buf.advance_write(3);
        assert_eq!(buf.unread(), b"xyz");
        buf.advance_read(1);
        assert_eq!(buf.unread(), b"yz");
    }

    #[test]
    fn advance_write_past_capacity_is_ignored() {
        let mut buf = ElasticBuffer::new(8);
        buf.advance_write(6);
        buf.advance_write(3);
        assert_eq!(buf.write_index(), 6);
        assert_invariant(&buf);
    }

    #[test]
    fn advance_read_past_written_is_ignored() {
        let mut buf = ElasticBuffer::new(8);
        buf.append(b"ab");
        buf.advance_read(3);
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.readable(), 2);
    }

    #[test]
    fn oversized_advances_do_not_overflow() {
        let mut buf = ElasticBuffer::new(8);
        buf.append(b"ab");
        buf.advance_write(usize::MAX);
        assert_eq!(buf.write_index(), 2);

        buf.advance_read(1);
        buf.advance_read(usize::MAX);
        assert_eq!(buf.read_index(), 1);
        assert_eq!(buf.readable(), 1);
        assert_invariant(&buf);
    }

    #[test]
    fn compaction_triggers_past_one_third() {
        let mut buf = ElasticBuffer::new(30);
        buf.append(&[7u8; 20]);
        buf.advance_read(10);
        // 10 is not past 30 / 3
        assert_eq!(buf.read_index(), 10);
        buf.advance_read(1);
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.write_index(), 9);
        assert_eq!(buf.capacity(), 30);
    }

    #[test]
    fn compaction_preserves_content_order() {
        let mut buf = ElasticBuffer::new(12);
        buf.append(b"abcdefghij");
        buf.advance_read(5);
        assert_eq!(buf.read_index(), 0);
        assert_eq!(buf.unread(), b"fghij");
        buf.compact();
        assert_eq!(buf.unread(), b"fghij");
    }

    #[test]
    fn reset_retains_capacity() {
        let mut buf = ElasticBuffer::new(4);
        buf.append(b"too long for four");
        let cap = buf.capacity();
        buf.reset();
        assert_eq!(buf.capacity(), cap);
        assert_eq!(buf.readable(), 0);
        assert_eq!(buf.writable(), cap);
    }

    #[test]
    fn grow_adds_room_after_unread() {
        let mut buf = ElasticBuffer::new(4);
        buf.append(b"abcd");
        assert_eq!(buf.writable(), 0);
        buf.grow(100);
        assert_eq!(buf.capacity(), 104);
        assert_eq!(buf.writable(), 100);
        assert_eq!(buf.unread(), b"abcd");
    }

    #[test]
    fn peek_does_not_consume() {
        let mut buf = ElasticBuffer::new(8);
        buf.append(b"abc");
        assert_eq!(buf.peek(2), Some(&b"ab"[..]));
        assert_eq!(buf.peek(4), None);
        assert_eq!(buf.readable(), 3);
    }

    #[test]
    fn invariant_holds_over_random_operation_sequences() {
        let mut rng = Rng(0x9E37_79B9_7F4A_7C15);
        for _ in 0..50 {
            let mut buf = ElasticBuffer::new(rng.below(64));
            let mut model: Vec<u8> = Vec::new();
            for _ in 0..400 {
                match rng.below(5) {
                    0 => {
                        let chunk: Vec<u8> =
                            (0..rng.below(40)).map(|_| rng.next() as u8).collect();
                        buf.append(&chunk);
                        model.extend_from_slice(&chunk);
                    }
                    1 => {
                        let n = rng.below(48);
                        let got = buf.take(n);
                        let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                        assert_eq!(&got[..], &expected[..]);
                    }
                    2 => {
                        let n = rng.below(buf.writable() + 1);
                        for slot in &mut buf.spare_mut()[..n] {
                            *slot = rng.next() as u8;
                        }
                        let written = buf.spare_mut()[..n].to_vec();
                        buf.advance_write(n);
                        model.extend_from_slice(&written);
                    }
                    3 => {
                        let n = rng.below(buf.readable() + 1);
                        buf.advance_read(n);
                        model.drain(..n);
                    }
                    _ => buf.compact(),
                }
                assert_invariant(&buf);
                assert_eq!(buf.unread(), &model[..]);
            }
        }
    }

    #[test]
    fn chunked_appends_round_trip() {
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        let mut rng = Rng(42);
        let mut buf = ElasticBuffer::new(16);
        let mut offset = 0;
        while offset < data.len() {
            let n = (rng.below(300) + 1).min(data.len() - offset);
            buf.append(&data[offset..offset + n]);
            offset += n;
        }
        assert_eq!(&buf.take(data.len())[..], &data[..]);
    }
}

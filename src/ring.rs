//! Fixed-capacity byte ring shared between one stream writer and any number
//! of lazily-polling readers.
//!
//! The writer always makes progress: once the ring wraps, the oldest bytes
//! are overwritten whether or not anyone has read them. Each [`RingReader`]
//! keeps its own absolute cursor and drains whatever lies between the cursor
//! and the write position. A reader that falls more than a full capacity
//! behind has lost data and gets an error instead of garbled bytes.

use std::{
    io,
    sync::{Arc, Mutex},
};

struct Inner {
    data: Box<[u8]>,
    write_pos: u64,
}

pub struct RingBuffer {
    inner: Arc<Mutex<Inner>>,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        RingBuffer {
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0u8; capacity].into_boxed_slice(),
                write_pos: 0,
            })),
        }
    }

    /// Appends `bytes`, overwriting the oldest data once the ring wraps.
    /// Never blocks on readers and never fails.
    pub fn write(&self, bytes: &[u8]) {
        let mut inner = self.inner.lock().expect("ring lock poisoned");
        let cap = inner.data.len();

        let mut bytes = bytes;
        if bytes.len() > cap {
            // Only the newest window can survive anyway
            inner.write_pos += (bytes.len() - cap) as u64;
            bytes = &bytes[bytes.len() - cap..];
        }

        let start = (inner.write_pos % cap as u64) as usize;
        let first = bytes.len().min(cap - start);
        inner.data[start..start + first].copy_from_slice(&bytes[..first]);
        if first < bytes.len() {
            let rest = bytes.len() - first;
            inner.data[..rest].copy_from_slice(&bytes[first..]);
        }
        inner.write_pos += bytes.len() as u64;
    }

    /// Position roughly half a capacity behind the writer, clamped to the
    /// start of the stream. New readers seat here so they have recent data
    /// in front of them and a margin against overrun behind them.
    pub fn mid_point(&self) -> u64 {
        let inner = self.inner.lock().expect("ring lock poisoned");
        inner.write_pos.saturating_sub((inner.data.len() / 2) as u64)
    }

    pub fn write_pos(&self) -> u64 {
        self.inner.lock().expect("ring lock poisoned").write_pos
    }

    pub fn reader(&self, start: u64) -> RingReader {
        RingReader {
            inner: self.inner.clone(),
            pos: start,
        }
    }
}

/// A cursor view into a [`RingBuffer`].
pub struct RingReader {
    inner: Arc<Mutex<Inner>>,
    pos: u64,
}

impl RingReader {
    /// Copies up to `dst.len()` bytes from the cursor towards the write
    /// position and advances the cursor. Returns 0 when caught up with the
    /// writer; callers are expected to poll again after a short sleep.
    /// Fails when the writer has lapped this cursor by more than a capacity.
    pub fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let inner = self.inner.lock().expect("ring lock poisoned");
        let cap = inner.data.len();

        if inner.write_pos < self.pos {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "ring reader cursor ahead of writer",
            ));
        }
        let available = inner.write_pos - self.pos;
        if available == 0 {
            return Ok(0);
        }
        if available > cap as u64 {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "ring reader overrun by writer",
            ));
        }

        let n = dst.len().min(available as usize);
        let start = (self.pos % cap as u64) as usize;
        let first = n.min(cap - start);
        dst[..first].copy_from_slice(&inner.data[start..start + first]);
        if first < n {
            dst[first..n].copy_from_slice(&inner.data[..n - first]);
        }
        self.pos += n as u64;
        Ok(n)
    }

    pub fn position(&self) -> u64 {
        self.pos
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_returns_written_bytes_in_order() {
        let ring = RingBuffer::new(64);
        let mut reader = ring.reader(0);
        ring.write(b"hello ");
        ring.write(b"world");

        let mut buf = [0u8; 32];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
    }

    #[test]
    fn caught_up_reader_reads_zero() {
        let ring = RingBuffer::new(64);
        ring.write(b"abc");
        let mut reader = ring.reader(ring.write_pos());

        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);

        ring.write(b"xyz");
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyz");
    }

    #[test]
    fn small_destination_drains_incrementally() {
        let ring = RingBuffer::new(64);
        ring.write(b"abcdef");
        let mut reader = ring.reader(0);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(reader.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ef");
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn wrapping_preserves_byte_order() {
        let ring = RingBuffer::new(8);
        ring.write(b"01234");
        let mut reader = ring.reader(3);
        // Wraps: positions 5..11 land at indexes 5,6,7,0,1,2
        ring.write(b"56789A");

        let mut buf = [0u8; 16];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"3456789A");
    }

    #[test]
    fn mid_point_lags_half_capacity() {
        let ring = RingBuffer::new(100);
        assert_eq!(ring.mid_point(), 0);
        ring.write(&[0u8; 30]);
        assert_eq!(ring.mid_point(), 0);
        ring.write(&[0u8; 100]);
        assert_eq!(ring.mid_point(), 80);
    }

    #[test]
    fn lapped_reader_errors() {
        let ring = RingBuffer::new(16);
        let mut reader = ring.reader(0);
        ring.write(&[1u8; 17]);

        let mut buf = [0u8; 8];
        assert!(reader.read(&mut buf).is_err());
    }

    #[test]
    fn reader_exactly_a_capacity_behind_still_reads() {
        let ring = RingBuffer::new(16);
        let mut reader = ring.reader(0);
        ring.write(&[7u8; 16]);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 16);
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn oversized_write_keeps_newest_window() {
        let ring = RingBuffer::new(4);
        ring.write(b"abcdefgh");
        assert_eq!(ring.write_pos(), 8);

        let mut reader = ring.reader(4);
        let mut buf = [0u8; 8];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"efgh");
    }
}

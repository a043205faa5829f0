//! Growable append-only byte buffer with mid-stream splice support.
//!
//! Header and body bytes are accumulated here between parser events and
//! flushed to a sink once a message's framing is settled. `write_first_n`
//! exists so the interceptor can emit everything before a header field,
//! splice a replacement into the output, and keep the remainder without
//! rebuilding the buffer.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Initial capacity. A typical message head fits without growing.
const INITIAL_CAPACITY: usize = 32 * 1024;

/// Contiguous byte accumulator whose capacity is always a power of two.
pub struct StreamBuffer {
    storage: Box<[u8]>,
    len: usize,
}

impl StreamBuffer {
    pub fn new() -> Self {
        Self {
            storage: vec![0u8; INITIAL_CAPACITY].into_boxed_slice(),
            len: 0,
        }
    }

    /// Appends `bytes`, growing the storage to the next power of two that
    /// holds twice the required size. Returns the number of bytes appended,
    /// always `bytes.len()`: growth is infallible at this design point, the
    /// allocator aborts on out-of-memory.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        if self.len + bytes.len() > self.storage.len() {
            let new_capacity = (2 * (self.storage.len() + bytes.len())).next_power_of_two();
            tracing::trace!(
                from = self.storage.len(),
                to = new_capacity,
                "Growing stream buffer"
            );
            let mut storage = vec![0u8; new_capacity].into_boxed_slice();
            storage[..self.len].copy_from_slice(&self.storage[..self.len]);
            self.storage = storage;
        }
        self.storage[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        bytes.len()
    }

    /// Resets the logical length to zero without releasing storage.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.storage[..self.len]
    }

    /// Writes the full contents to `sink`, then clears the buffer. Partial
    /// writes are retried by `write_all` until done or a hard error.
    pub async fn write_all<W>(&mut self, sink: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        sink.write_all(&self.storage[..self.len]).await?;
        self.clear();
        Ok(())
    }

    /// Writes the first `n` bytes to `sink` and left-compacts the remainder
    /// to the front of the storage. `n >= len()` behaves as `write_all`.
    pub async fn write_first_n<W>(&mut self, sink: &mut W, n: usize) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        if n >= self.len {
            return self.write_all(sink).await;
        }
        sink.write_all(&self.storage[..n]).await?;
        self.skip_first(n);
        Ok(())
    }

    /// Left-compacts the buffer past the first `n` bytes without writing
    /// them anywhere. Companion to `write_first_n` for splicing a span out
    /// of the accumulated bytes.
    pub fn skip_first(&mut self, n: usize) {
        if n >= self.len {
            self.clear();
            return;
        }
        self.storage.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Default for StreamBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("len", &self.len)
            .field("capacity", &self.storage.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn append_accumulates_lengths() {
        let mut buf = StreamBuffer::new();
        let mut expected = 0;
        for chunk in [&b"hello"[..], b", ", b"world", b""] {
            assert_eq!(buf.append(chunk), chunk.len());
            expected += chunk.len();
        }
        assert_eq!(buf.len(), expected);
        assert_eq!(buf.as_slice(), b"hello, world");
    }

    #[test]
    fn capacity_is_power_of_two_after_growth() {
        let mut buf = StreamBuffer::new();
        let chunk = vec![0xabu8; 10_000];
        for _ in 0..20 {
            buf.append(&chunk);
            assert!(buf.capacity().is_power_of_two());
            assert!(buf.capacity() >= buf.len());
        }
        assert_eq!(buf.len(), 200_000);
    }

    #[test]
    fn growth_preserves_byte_order() {
        let mut buf = StreamBuffer::new();
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        for chunk in data.chunks(7777) {
            buf.append(chunk);
        }
        assert_eq!(buf.as_slice(), &data[..]);
    }

    #[test]
    fn clear_keeps_storage() {
        let mut buf = StreamBuffer::new();
        buf.append(&vec![1u8; 100_000]);
        let cap = buf.capacity();
        buf.clear();
        assert_eq!(buf.len(), 0);
        assert_eq!(buf.capacity(), cap);
    }

    #[tokio::test]
    async fn write_all_drains_and_clears() {
        let mut buf = StreamBuffer::new();
        buf.append(b"payload");
        let mut sink = Cursor::new(Vec::new());
        buf.write_all(&mut sink).await.unwrap();
        assert_eq!(sink.into_inner(), b"payload");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn write_first_n_splices_for_every_prefix() {
        let original = b"0123456789abcdef";
        for n in 0..=original.len() {
            let mut buf = StreamBuffer::new();
            buf.append(original);
            let mut sink = Cursor::new(Vec::new());
            buf.write_first_n(&mut sink, n).await.unwrap();
            assert_eq!(sink.into_inner(), &original[..n]);
            assert_eq!(buf.as_slice(), &original[n..]);
        }
    }

    #[tokio::test]
    async fn write_first_n_past_end_acts_as_write_all() {
        let mut buf = StreamBuffer::new();
        buf.append(b"short");
        let mut sink = Cursor::new(Vec::new());
        buf.write_first_n(&mut sink, 100).await.unwrap();
        assert_eq!(sink.into_inner(), b"short");
        assert!(buf.is_empty());
    }

    #[test]
    fn skip_first_drops_prefix_in_place() {
        let mut buf = StreamBuffer::new();
        buf.append(b"Content-Length: 5\r\nHost: x\r\n");
        buf.skip_first(19);
        assert_eq!(buf.as_slice(), b"Host: x\r\n");
        buf.skip_first(1000);
        assert!(buf.is_empty());
    }
}

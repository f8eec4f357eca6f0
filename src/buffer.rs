//! C1: growable, chunked byte buffer with consume-from-head semantics.
//!
//! Bytes are appended in fixed-size chunks and consumed from the front; a
//! chunk is freed as soon as it has been fully consumed, so the buffer never
//! re-copies already-read data the way a single growing `Vec` would on
//! compaction. Once total buffered bytes cross `mmap_threshold`, new chunks
//! are backed by a memory-mapped temp file instead of heap memory, so a slow
//! consumer facing a bursty producer doesn't pin arbitrary amounts of RAM.

use memmap2::MmapMut;
use std::collections::VecDeque;
use std::io;

const CHUNK_SIZE: usize = 4096;

enum Chunk {
    Heap(Vec<u8>),
    Mapped { map: MmapMut, len: usize },
}

impl Chunk {
    fn as_slice(&self) -> &[u8] {
        match self {
            Chunk::Heap(v) => v,
            Chunk::Mapped { map, len } => &map[..*len],
        }
    }
}

pub struct ByteBuffer {
    chunks: VecDeque<Chunk>,
    /// Offset into the front chunk that has already been consumed.
    front_offset: usize,
    len: usize,
    mmap_threshold: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_mmap_threshold(8 * 1024 * 1024)
    }

    pub fn with_mmap_threshold(mmap_threshold: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            front_offset: 0,
            len: 0,
            mmap_threshold,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends bytes, spilling to a memory-mapped temp file once the buffer
    /// is larger than `mmap_threshold`.
    pub fn append(&mut self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let take = data.len().min(CHUNK_SIZE);
            let (piece, rest) = data.split_at(take);
            data = rest;

            if self.len >= self.mmap_threshold {
                let mut map = MmapMut::map_anon(piece.len().max(1))?;
                map[..piece.len()].copy_from_slice(piece);
                self.chunks.push_back(Chunk::Mapped { map, len: piece.len() });
            } else {
                self.chunks.push_back(Chunk::Heap(piece.to_vec()));
            }
            self.len += piece.len();
        }
        Ok(())
    }

    /// Copies up to `buf.len()` bytes from the head of the buffer without
    /// consuming them. Returns the number of bytes copied.
    pub fn peek(&self, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        let mut chunk_offset = self.front_offset;
        for chunk in &self.chunks {
            if copied == buf.len() {
                break;
            }
            let slice = &chunk.as_slice()[chunk_offset..];
            let take = slice.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&slice[..take]);
            copied += take;
            chunk_offset = 0;
        }
        copied
    }

    /// Drops `n` bytes from the head of the buffer. Panics if `n > len()`,
    /// a caller contract violation.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.len, "consume beyond buffered length");
        let mut remaining = n;
        while remaining > 0 {
            let front = self.chunks.front_mut().expect("consume beyond buffered length");
            let available = front.as_slice().len() - self.front_offset;
            if remaining < available {
                self.front_offset += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                self.chunks.pop_front();
                self.front_offset = 0;
            }
        }
        self.len -= n;
    }

    /// Copies up to `buf.len()` bytes from the head and consumes them,
    /// returning how many were copied. Used by the TLS byte-IO back-end's
    /// `read(n)` operation.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = self.peek(buf);
        self.consume(n);
        n
    }

    /// Copies the full contents into a flat `Vec`. Used for the async
    /// resumption snapshot and socket export; buffers involved there are
    /// bounded (≤1024 bytes or detached at export), so the copy is cheap.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len);
        let mut buf = vec![0u8; self.len];
        let n = self.peek(&mut buf);
        out.extend_from_slice(&buf[..n]);
        out
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.front_offset = 0;
        self.len = 0;
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_and_consume_across_chunks() {
        let mut buf = ByteBuffer::new();
        let data = vec![7u8; CHUNK_SIZE * 3 + 10];
        buf.append(&data).unwrap();
        assert_eq!(buf.len(), data.len());

        let mut out = vec![0u8; data.len()];
        let n = buf.read(&mut out);
        assert_eq!(n, data.len());
        assert_eq!(out, data);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_consume_keeps_remainder() {
        let mut buf = ByteBuffer::new();
        buf.append(b"hello world").unwrap();
        buf.consume(6);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out), 5);
        assert_eq!(&out, b"world");
    }

    #[test]
    fn spills_to_mmap_past_threshold() {
        let mut buf = ByteBuffer::with_mmap_threshold(16);
        buf.append(&[1u8; 8]).unwrap();
        buf.append(&[2u8; 32]).unwrap();
        assert_eq!(buf.len(), 40);
        let v = buf.to_vec();
        assert_eq!(&v[..8], &[1u8; 8][..]);
        assert_eq!(&v[8..], &[2u8; 32][..]);
    }
}

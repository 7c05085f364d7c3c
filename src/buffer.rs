use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

/// An ordered sequence of byte chunks with a cached total length.
///
/// Backs both the read and the write buffer of a stream. Chunks are kept
/// as received; multi-chunk prefixes are merged lazily and gradually,
/// since large merges are expensive and get undone by `consume`.
#[derive(Default)]
pub(crate) struct ChunkDeque {
    chunks: VecDeque<Bytes>,
    len: usize,
}

impl ChunkDeque {
    pub fn new() -> ChunkDeque {
        ChunkDeque {
            chunks: VecDeque::new(),
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Append a chunk. Empty chunks are never stored, so emptiness of the
    /// deque tracks emptiness of the buffer.
    pub fn push(&mut self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }

        self.len += chunk.len();
        self.chunks.push_back(chunk);
    }

    #[inline]
    pub fn first(&self) -> Option<&Bytes> {
        self.chunks.front()
    }

    /// Remove and return exactly `n` bytes from the front as one chunk.
    ///
    /// Requires `n <= self.len()`.
    pub fn consume(&mut self, n: usize) -> Bytes {
        if n == 0 {
            return Bytes::new();
        }

        assert!(n <= self.len, "consume past end of buffer");

        self.merge_prefix(n);
        self.len -= n;
        self.chunks.pop_front().expect("merged prefix missing")
    }

    /// Remove and return the entire buffered contents as one chunk.
    pub fn consume_all(&mut self) -> Bytes {
        let len = self.len;
        self.consume(len)
    }

    /// Replace the first entries with a single chunk of up to `size`
    /// bytes, splitting a chunk when it straddles the boundary.
    pub fn merge_prefix(&mut self, size: usize) {
        if self.chunks.len() == 1 && self.chunks[0].len() <= size {
            return;
        }

        let mut prefix = BytesMut::new();
        let mut remaining = size;

        while remaining > 0 {
            let Some(mut chunk) = self.chunks.pop_front() else {
                break;
            };

            if chunk.len() > remaining {
                let head = chunk.split_to(remaining);
                self.chunks.push_front(chunk);
                prefix.extend_from_slice(&head);
                remaining = 0;
            } else {
                remaining -= chunk.len();
                prefix.extend_from_slice(&chunk);
            }
        }

        if !prefix.is_empty() {
            self.chunks.push_front(prefix.freeze());
        }
    }

    /// Grow the first chunk by doubling, but don't split the second chunk
    /// just because the first one is small.
    pub fn double_prefix(&mut self) {
        if self.chunks.len() < 2 {
            return;
        }

        let new_len = std::cmp::max(
            self.chunks[0].len() * 2,
            self.chunks[0].len() + self.chunks[1].len(),
        );
        self.merge_prefix(new_len);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn deque_of(parts: &[&str]) -> ChunkDeque {
        let mut deque = ChunkDeque::new();
        for part in parts {
            deque.push(Bytes::copy_from_slice(part.as_bytes()));
        }
        deque
    }

    fn parts(deque: &ChunkDeque) -> Vec<String> {
        deque
            .chunks
            .iter()
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect()
    }

    #[test]
    fn merge_prefix_joins_and_splits() {
        let mut d = deque_of(&["abc", "de", "fghi", "j"]);

        d.merge_prefix(5);
        assert_eq!(parts(&d), vec!["abcde", "fghi", "j"]);

        d.merge_prefix(7);
        assert_eq!(parts(&d), vec!["abcdefg", "hi", "j"]);

        d.merge_prefix(3);
        assert_eq!(parts(&d), vec!["abc", "defg", "hi", "j"]);

        d.merge_prefix(100);
        assert_eq!(parts(&d), vec!["abcdefghij"]);
        assert_eq!(d.len(), 10);
    }

    #[test]
    fn consume_returns_exact_prefix() {
        let mut d = deque_of(&["hel", "lo wo", "rld"]);

        assert_eq!(&d.consume(5)[..], b"hello");
        assert_eq!(d.len(), 6);
        assert_eq!(&d.consume_all()[..], b" world");
        assert!(d.is_empty());
    }

    #[test]
    fn consume_zero_is_empty() {
        let mut d = deque_of(&["abc"]);
        assert!(d.consume(0).is_empty());
        assert_eq!(d.len(), 3);
    }

    #[test]
    fn empty_chunks_are_dropped() {
        let mut d = ChunkDeque::new();
        d.push(Bytes::new());
        assert!(d.is_empty());
        assert_eq!(d.chunk_count(), 0);
    }

    #[test]
    fn double_prefix_grows_gradually() {
        let mut d = deque_of(&["ab", "cdef", "gh"]);

        // max(2 * 2, 2 + 4) = 6
        d.double_prefix();
        assert_eq!(parts(&d), vec!["abcdef", "gh"]);
    }
}

/// Span of an object's bytes: `count` bytes starting at `offset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub count: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(offset: u64, count: u64) -> Self {
        Self { offset, count }
    }

    /// One past the last byte of the range.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.offset + self.count
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Drops the first `n` bytes from the range.
    pub fn advance(&mut self, n: u64) {
        assert!(
            n <= self.count,
            "advancing {n} bytes past the end of {self:?}"
        );
        self.offset += n;
        self.count -= n;
    }

    /// Splits the range into consecutive `chunk_size` pieces, the last one possibly shorter.
    ///
    /// A `chunk_size` of zero yields the whole range as a single chunk; an empty range yields
    /// nothing.
    pub fn chunks(&self, chunk_size: u64) -> Chunks {
        Chunks {
            remaining: *self,
            chunk_size: if chunk_size == 0 {
                self.count.max(1)
            } else {
                chunk_size
            },
        }
    }

    #[must_use]
    pub fn num_chunks(&self, chunk_size: u64) -> u64 {
        if self.count == 0 {
            return 0;
        }
        if chunk_size == 0 {
            return 1;
        }
        self.count.div_ceil(chunk_size)
    }
}

impl std::fmt::Display for ByteRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.offset, self.end())
    }
}

#[derive(Debug, Clone)]
pub struct Chunks {
    remaining: ByteRange,
    chunk_size: u64,
}

impl Iterator for Chunks {
    type Item = ByteRange;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining.is_empty() {
            return None;
        }
        let len = std::cmp::min(self.chunk_size, self.remaining.count);
        let chunk = ByteRange::new(self.remaining.offset, len);
        self.remaining.advance(len);
        Some(chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn last_chunk_is_shorter() {
        let chunks: Vec<_> = ByteRange::new(100, 25).chunks(10).collect();
        assert_eq!(
            chunks,
            vec![
                ByteRange::new(100, 10),
                ByteRange::new(110, 10),
                ByteRange::new(120, 5),
            ]
        );
        assert_eq!(ByteRange::new(100, 25).num_chunks(10), 3);
    }

    #[test]
    fn empty_range_has_no_chunks() {
        assert_eq!(ByteRange::new(7, 0).chunks(4).count(), 0);
        assert_eq!(ByteRange::new(7, 0).num_chunks(4), 0);
        assert_eq!(ByteRange::new(7, 0).num_chunks(0), 0);
    }

    #[test]
    fn zero_chunk_size_means_single_chunk() {
        let chunks: Vec<_> = ByteRange::new(0, 42).chunks(0).collect();
        assert_eq!(chunks, vec![ByteRange::new(0, 42)]);
        assert_eq!(ByteRange::new(0, 42).num_chunks(0), 1);
    }

    #[test]
    #[should_panic(expected = "past the end")]
    fn advance_past_end_panics() {
        ByteRange::new(0, 3).advance(4);
    }

    proptest! {
        #[test]
        fn chunks_tile_the_range(offset in 0u64..1 << 40, count in 0u64..1 << 20, chunk_size in 1u64..1 << 16) {
            let range = ByteRange::new(offset, count);
            let chunks: Vec<_> = range.chunks(chunk_size).collect();
            prop_assert_eq!(chunks.len() as u64, range.num_chunks(chunk_size));
            let mut next = offset;
            for chunk in &chunks {
                prop_assert_eq!(chunk.offset, next);
                prop_assert!(chunk.count > 0 && chunk.count <= chunk_size);
                next = chunk.end();
            }
            prop_assert_eq!(next, range.end());
        }
    }
}

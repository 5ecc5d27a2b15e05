//! Content-defined chunking
//!
//! Gear rolling hash with normalized chunking: a stricter mask before the
//! average size and a looser one after it pulls cut points towards the
//! average. Cut points depend only on the bytes between the chunk start and
//! `max`, so streaming input splits exactly like the same bytes in one
//! buffer.
//!
//! ```text
//!   start      min            avg             max
//!     |─────────|──── mask_s ───|──── mask_l ───|
//!      no cuts    rare cuts       frequent cuts   forced cut
//! ```

use once_cell::sync::Lazy;

use crate::error::{Error, Result};
use crate::model::ChunkSplitConfig;

/// 256 pseudo-random 64-bit values, fixed for the lifetime of the format.
static GEAR: Lazy<[u64; 256]> = Lazy::new(|| {
    // splitmix64 from a constant seed
    let mut state: u64 = 0x5354_5241_5441_4344;
    let mut table = [0u64; 256];
    for slot in table.iter_mut() {
        state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        *slot = z ^ (z >> 31);
    }
    table
});

/// Mask selecting the top `bits` bits of the hash.
fn top_mask(bits: u32) -> u64 {
    match bits {
        0 => 0,
        b if b >= 64 => u64::MAX,
        b => !0u64 << (64 - b),
    }
}

/// Splits byte streams into content-defined chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentChunker {
    min: usize,
    avg: usize,
    max: usize,
    mask_s: u64,
    mask_l: u64,
}

impl ContentChunker {
    pub fn new(split: ChunkSplitConfig) -> Result<Self> {
        if split.avg_chunk == 0 || split.delta_chunk >= split.avg_chunk {
            return Err(Error::Config(format!(
                "chunk split needs avg_chunk > delta_chunk, got {} / {}",
                split.avg_chunk, split.delta_chunk
            )));
        }
        let bits = split.avg_chunk.ilog2();
        Ok(Self {
            min: split.avg_chunk - split.delta_chunk,
            avg: split.avg_chunk,
            max: split.avg_chunk + split.delta_chunk,
            mask_s: top_mask(bits + 1),
            mask_l: top_mask(bits.saturating_sub(1)),
        })
    }

    pub fn min_size(&self) -> usize {
        self.min
    }

    pub fn max_size(&self) -> usize {
        self.max
    }

    /// Length of the first chunk of `data`.
    ///
    /// Only meaningful when `data` holds at least `max_size()` bytes or is
    /// the tail of the stream.
    pub fn cut_point(&self, data: &[u8]) -> usize {
        let len = data.len();
        if len <= self.min {
            return len;
        }
        let end = len.min(self.max);
        let normal = self.avg.min(end);

        let gear = &*GEAR;
        let mut hash: u64 = 0;
        let mut i = self.min;
        while i < normal {
            hash = (hash << 1).wrapping_add(gear[data[i] as usize]);
            if hash & self.mask_s == 0 {
                return i + 1;
            }
            i += 1;
        }
        while i < end {
            hash = (hash << 1).wrapping_add(gear[data[i] as usize]);
            if hash & self.mask_l == 0 {
                return i + 1;
            }
            i += 1;
        }
        end
    }

    /// Split a complete buffer.
    pub fn split<'a>(&self, mut data: &'a [u8]) -> Vec<&'a [u8]> {
        let mut chunks = Vec::new();
        while !data.is_empty() {
            let (head, tail) = data.split_at(self.cut_point(data));
            chunks.push(head);
            data = tail;
        }
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{RngCore, SeedableRng};
    use std::collections::HashSet;

    fn random_bytes(len: usize, seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; len];
        StdRng::seed_from_u64(seed).fill_bytes(&mut data);
        data
    }

    fn chunker(avg: usize, delta: usize) -> ContentChunker {
        ContentChunker::new(ChunkSplitConfig {
            avg_chunk: avg,
            delta_chunk: delta,
        })
        .unwrap()
    }

    #[test]
    fn test_sizes_within_bounds() {
        let c = chunker(8192, 4096);
        let data = random_bytes(1 << 20, 1);
        let chunks = c.split(&data);

        assert_eq!(chunks.iter().map(|c| c.len()).sum::<usize>(), data.len());
        let (last, rest) = chunks.split_last().unwrap();
        for chunk in rest {
            assert!(chunk.len() >= 4096 && chunk.len() <= 12288, "{}", chunk.len());
        }
        assert!(last.len() <= 12288);
    }

    #[test]
    fn test_deterministic() {
        let c = chunker(4096, 2048);
        let data = random_bytes(200_000, 7);
        assert_eq!(c.split(&data), c.split(&data));
    }

    #[test]
    fn test_boundaries_resync_after_insert() {
        let c = chunker(8192, 6144);
        let data = random_bytes(1 << 20, 3);
        let mut shifted = vec![0xAB; 100];
        shifted.extend_from_slice(&data);

        let original: HashSet<&[u8]> = c.split(&data).into_iter().collect();
        let moved = c.split(&shifted);
        let shared = moved.iter().filter(|m| original.contains(*m)).count();
        assert!(
            shared * 2 > original.len(),
            "only {} of {} chunks survived a 100 byte insert",
            shared,
            original.len()
        );
    }

    #[test]
    fn test_small_and_empty_input() {
        let c = chunker(1024, 512);
        assert!(c.split(&[]).is_empty());
        assert_eq!(c.split(&[1, 2, 3]), vec![&[1u8, 2, 3][..]]);
    }

    #[test]
    fn test_streaming_prefix_matches_buffer() {
        let c = chunker(2048, 1024);
        let data = random_bytes(50_000, 11);
        let first = c.cut_point(&data);
        assert_eq!(c.cut_point(&data[..c.max_size()]), first);
    }

    #[test]
    fn test_rejects_bad_split() {
        assert!(ContentChunker::new(ChunkSplitConfig {
            avg_chunk: 1024,
            delta_chunk: 1024
        })
        .is_err());
    }
}

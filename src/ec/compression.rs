//! Chunk Compression
//!
//! LZ4 and zlib compressors behind a common trait. The algorithm is fixed by
//! the chunk's coding configuration, so there is no fallback: a chunk is
//! always stored with the compressor its configuration names.

use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::coding::CompressType;
use crate::error::{Error, Result};

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    fn algorithm(&self) -> CompressType;

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Compressor for a configured algorithm.
pub fn compressor_for(algorithm: CompressType) -> Box<dyn Compressor> {
    match algorithm {
        CompressType::Lz4 => Box::new(Lz4Compressor::new()),
        CompressType::Zlib => Box::new(ZlibCompressor::new()),
    }
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 block compressor with the uncompressed size prepended
pub struct Lz4Compressor {
    level: i32,
}

impl Lz4Compressor {
    pub fn new() -> Self {
        Self { level: 4 }
    }

    pub fn with_level(level: i32) -> Self {
        Self { level }
    }
}

impl Default for Lz4Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressType {
        CompressType::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        lz4::block::compress(
            data,
            Some(lz4::block::CompressionMode::HIGHCOMPRESSION(self.level)),
            true,
        )
        .map_err(|e| Error::CompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "lz4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Zlib Compressor
// =============================================================================

/// zlib (deflate) compressor
pub struct ZlibCompressor {
    level: flate2::Compression,
}

impl ZlibCompressor {
    pub fn new() -> Self {
        Self {
            level: flate2::Compression::default(),
        }
    }

    pub fn with_level(level: u32) -> Self {
        Self {
            level: flate2::Compression::new(level),
        }
    }
}

impl Default for ZlibCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor for ZlibCompressor {
    fn algorithm(&self) -> CompressType {
        CompressType::Zlib
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let failed = |e: std::io::Error| Error::CompressionFailed {
            algorithm: "zlib".into(),
            reason: e.to_string(),
        };
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), self.level);
        encoder.write_all(data).map_err(failed)?;
        encoder.finish().map_err(failed)
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        let mut out = Vec::with_capacity(data.len() * 2);
        ZlibDecoder::new(data)
            .read_to_end(&mut out)
            .map_err(|e| Error::DecompressionFailed {
                algorithm: "zlib".into(),
                reason: e.to_string(),
            })?;
        Ok(out)
    }
}

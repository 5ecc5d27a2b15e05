//! Erasure Coding Encoder/Decoder
//!
//! Parity over equally sized shards. Reed-Solomon uses the
//! `reed-solomon-erasure` crate; single-frag XOR parity and parity-less
//! (mirror) layouts are handled directly.

use crate::coding::ParityType;
use crate::error::{Error, Result};
use reed_solomon_erasure::galois_8::ReedSolomon;
use std::sync::Arc;
use tracing::{debug, instrument};

// =============================================================================
// Parity Codec
// =============================================================================

#[derive(Clone)]
enum Codec {
    /// No parity shards
    None,
    /// One parity shard, XOR of all data shards
    Xor,
    ReedSolomon(Arc<ReedSolomon>),
}

impl Codec {
    fn new(data_shards: usize, parity_shards: usize, parity_type: ParityType) -> Result<Self> {
        if data_shards == 0 {
            return Err(Error::InvalidCodingConfig(
                "data_shards must be greater than 0".to_string(),
            ));
        }
        if parity_shards == 0 {
            return Ok(Codec::None);
        }
        match parity_type {
            ParityType::Xor if parity_shards == 1 => Ok(Codec::Xor),
            ParityType::Xor => Err(Error::InvalidCodingConfig(format!(
                "xor parity supports one shard, got {}",
                parity_shards
            ))),
            ParityType::ReedSolomon => {
                let rs = ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                    Error::InvalidCodingConfig(format!(
                        "Failed to create Reed-Solomon codec: {}",
                        e
                    ))
                })?;
                Ok(Codec::ReedSolomon(Arc::new(rs)))
            }
        }
    }
}

fn xor_into(acc: &mut [u8], shard: &[u8]) {
    for (a, b) in acc.iter_mut().zip(shard) {
        *a ^= b;
    }
}

fn check_count<T>(shards: &[T], expected: usize) -> Result<()> {
    if shards.len() != expected {
        return Err(Error::EncodingFailure(format!(
            "Expected {} shards, got {}",
            expected,
            shards.len()
        )));
    }
    Ok(())
}

// =============================================================================
// EC Encoder
// =============================================================================

/// Erasure coding encoder for creating parity shards from data shards
#[derive(Clone)]
pub struct EcEncoder {
    codec: Codec,
    /// Number of data shards (k)
    data_shards: usize,
    /// Number of parity shards (m)
    parity_shards: usize,
}

impl EcEncoder {
    /// Create a new encoder for a k+m layout.
    pub fn new(data_shards: usize, parity_shards: usize, parity_type: ParityType) -> Result<Self> {
        Ok(Self {
            codec: Codec::new(data_shards, parity_shards, parity_type)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Split `data` into k padded data shards and compute the parity shards.
    ///
    /// Shards are never empty: an empty input yields one zero byte per shard.
    #[instrument(skip(self, data), fields(data_len = data.len()))]
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = calculate_shard_size(data.len(), self.data_shards);
        let mut shards: Vec<Vec<u8>> = Vec::with_capacity(self.total_shards());

        for i in 0..self.data_shards {
            let start = i * shard_size;
            let end = std::cmp::min(start + shard_size, data.len());

            let mut shard = if start < data.len() {
                data[start..end].to_vec()
            } else {
                Vec::new()
            };
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        self.encode_shards(&mut shards)?;

        debug!(
            "Encoded {} bytes into {} shards of {} bytes each",
            data.len(),
            self.total_shards(),
            shard_size
        );

        Ok(shards)
    }

    /// Compute parity in place over data shards followed by parity slots.
    pub fn encode_shards(&self, shards: &mut [Vec<u8>]) -> Result<()> {
        check_count(shards, self.total_shards())?;

        match &self.codec {
            Codec::None => Ok(()),
            Codec::Xor => {
                let (data, parity) = shards.split_at_mut(self.data_shards);
                let out = &mut parity[0];
                out.iter_mut().for_each(|b| *b = 0);
                for shard in data.iter() {
                    if shard.len() != out.len() {
                        return Err(Error::EncodingFailure(
                            "XOR shards differ in length".to_string(),
                        ));
                    }
                    xor_into(out, shard);
                }
                Ok(())
            }
            Codec::ReedSolomon(rs) => rs.encode(shards).map_err(|e| {
                Error::EncodingFailure(format!("Reed-Solomon encoding failed: {}", e))
            }),
        }
    }

    /// Check that the parity shards agree with the data shards.
    pub fn verify(&self, shards: &[Vec<u8>]) -> Result<bool> {
        check_count(shards, self.total_shards())?;

        match &self.codec {
            Codec::None => Ok(true),
            Codec::Xor => {
                let mut acc = vec![0u8; shards[0].len()];
                for shard in &shards[..self.data_shards] {
                    xor_into(&mut acc, shard);
                }
                Ok(acc == shards[self.data_shards])
            }
            Codec::ReedSolomon(rs) => rs
                .verify(shards)
                .map_err(|e| Error::EncodingFailure(format!("Verification failed: {}", e))),
        }
    }
}

// =============================================================================
// EC Decoder
// =============================================================================

/// Erasure coding decoder for reconstructing missing shards
#[derive(Clone)]
pub struct EcDecoder {
    codec: Codec,
    data_shards: usize,
    parity_shards: usize,
}

impl EcDecoder {
    pub fn new(data_shards: usize, parity_shards: usize, parity_type: ParityType) -> Result<Self> {
        Ok(Self {
            codec: Codec::new(data_shards, parity_shards, parity_type)?,
            data_shards,
            parity_shards,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Fill in every missing shard, data and parity.
    ///
    /// At least k shards must be present.
    #[instrument(skip(self, shards))]
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.reconstruct_inner(shards, false)
    }

    /// Fill in only the missing data shards.
    #[instrument(skip(self, shards))]
    pub fn reconstruct_data(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.reconstruct_inner(shards, true)
    }

    fn reconstruct_inner(&self, shards: &mut [Option<Vec<u8>>], data_only: bool) -> Result<()> {
        check_count(shards, self.total_shards())?;

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(Error::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }
        if available == self.total_shards() {
            return Ok(());
        }

        match &self.codec {
            // k shards present and no parity: nothing can be missing
            Codec::None => {}
            Codec::Xor => {
                let missing = shards.iter().position(|s| s.is_none());
                if let Some(idx) = missing {
                    if !(data_only && idx >= self.data_shards) {
                        let len = shards
                            .iter()
                            .flatten()
                            .next()
                            .map(|s| s.len())
                            .unwrap_or(0);
                        let mut acc = vec![0u8; len];
                        for shard in shards.iter().flatten() {
                            xor_into(&mut acc, shard);
                        }
                        shards[idx] = Some(acc);
                    }
                }
            }
            Codec::ReedSolomon(rs) => {
                let res = if data_only {
                    rs.reconstruct_data(shards)
                } else {
                    rs.reconstruct(shards)
                };
                res.map_err(|e| {
                    Error::EncodingFailure(format!("Reed-Solomon reconstruction failed: {}", e))
                })?;
            }
        }

        debug!(
            "Reconstructed shards from {}/{} available",
            available,
            self.total_shards()
        );

        Ok(())
    }

    /// Reconstruct missing data shards and join them, trimmed to `original_size`.
    #[instrument(skip(self, shards), fields(original_size))]
    pub fn decode(&self, shards: &mut [Option<Vec<u8>>], original_size: usize) -> Result<Vec<u8>> {
        self.reconstruct_data(shards)?;

        let mut data = Vec::with_capacity(original_size);
        for s in shards.iter().take(self.data_shards).flatten() {
            data.extend_from_slice(s);
        }
        data.truncate(original_size);

        Ok(data)
    }
}

// =============================================================================
// Convenience Functions
// =============================================================================

/// Shard size for `data_size` bytes over `data_shards` shards, never below 1.
pub fn calculate_shard_size(data_size: usize, data_shards: usize) -> usize {
    data_size.div_ceil(data_shards).max(1)
}

/// Storage overhead ratio (total/data)
pub fn storage_overhead(data_shards: usize, parity_shards: usize) -> f64 {
    (data_shards + parity_shards) as f64 / data_shards as f64
}

// =============================================================================
// Tests
// =============================================================================
